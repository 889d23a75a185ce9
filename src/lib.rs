#![warn(missing_docs)]

//! Characterization and matching of photovoltaic cells. \
//! Measured I-V sweeps are fitted to a single-diode model with four physical parameters:
//! irradiance, temperature, series resistance and shunt resistance. The fitted model is then used to
//! derive the usual cell metrics and to find groups of cells that work well together in a series string.
//!
//! ## Interface
//! Fitting is done by [`CurveFit`], which only needs samples and a seeded random source.
//! [`Characterizer`] wraps it, prepares raw sweeps and derives open-circuit voltage, short-circuit
//! current and the maximum power point from the fitted curve. \
//! Matching is done by [`Matcher`] on [`MatchCell`]s, which can be built from characterizations.
//! In any case, parameters are set via `with_*()` functions.
//!
//! Example:
//! ```rust
//! use pvmatch::{Characterizer, Matcher, MatchCell, NonidealCell};
//! use rand::SeedableRng;
//!
//! let model = NonidealCell::default();
//! let sweep: Vec<(f64, f64)> = (0..36)
//!     .map(|k| {
//!         let v = k as f64 * 0.02;
//!         (v, pvmatch::CellModel::current(&model, 800., 298., 0.02, 20., v))
//!     })
//!     .collect();
//!
//! let mut rng = rand::rngs::StdRng::seed_from_u64(0);
//! let cell = Characterizer::new(model)
//!     .with_target(0.08)
//!     .characterize("cell-1", sweep, &mut rng)
//!     .unwrap();
//! assert!(cell.v_mpp <= cell.v_oc);
//!
//! let cells = [0.62, 0.64, 0.62, 0.65]
//!     .iter()
//!     .enumerate()
//!     .map(|(i, &v_mpp)| MatchCell::new(format!("c{i}"), v_mpp, 0.721, 0.01, 2.))
//!     .collect::<Vec<_>>();
//! let matches = Matcher::default()
//!     .with_match_size(2)
//!     .with_max_matches(2)
//!     .generate_matches(&cells)
//!     .unwrap();
//! assert_eq!(matches.len(), 2);
//! ```
//!
//! Batches of cells and clusters are handled by [`Characterizer::characterize_cells()`] and
//! [`Matcher::match_clusters()`]. Both can also be executed in parallel with the `parallel` feature.
//!
//! ## Parameters
//! - `target`: Chi-square at which the fit stops. Fits that do not reach it still return their best result.
//! - `rounds` and `iterations`: Number of random restarts and of local searches per restart.
//! - `match_size`: Number of cells per series string.
//! - `max_matches`: Maximum number of strings taken from a group.
//! - `optimizer`: Objective for ranking operating points, see [`Optimizer`].
//! - `sum_constraint`: Restriction on the summed string voltage, see [`SumConstraint`].
//!
//! All randomness is drawn from explicitly passed generators, so equal seeds give equal results.
//! The library only emits [`log`] records and never installs a logger.

pub mod characterization;
pub mod error;
pub mod fit;
pub(crate) mod matching;
pub mod minimize;
pub mod model;
pub mod parameters;
pub mod pipeline;
pub mod query;
pub mod samples;
pub mod search;

pub use characterization::{CellCharacterization, Characterizer, CurveSummary};
pub use error::{Error, Result};
pub use fit::{CurveFit, FitResult};
pub use matching::{Match, Matcher};
pub use minimize::{LocalMinimizer, NelderMeadMinimizer};
pub use model::{CellModel, NonidealCell, OperatingConditions};
pub use parameters::{FitParameters, Parameter};
pub use pipeline::{BatchMatches, CellInput, Cluster, RankedMatch};
pub use query::{CellMetric, Condition, rank_cells, search_cells};
pub use samples::{IntoSamples, Resampler, SamplePoint};
pub use search::{MatchCell, Optimizer, Solution, SumConstraint};
