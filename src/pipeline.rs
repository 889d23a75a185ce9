//! Batch processing: characterizing many cells and matching many clusters.
//!
//! Failures are isolated. A cell with unusable data or a cluster with an invalid setup is
//! reported next to the results of the others instead of aborting the batch.

use itertools::Itertools;
use log::{error, info, warn};
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::characterization::{CellCharacterization, Characterizer};
use crate::error::{Error, Result};
use crate::matching::{Match, Matcher};
use crate::minimize::LocalMinimizer;
use crate::model::CellModel;
use crate::samples::{IntoSamples, SamplePoint};
use crate::search::MatchCell;

/// Measurements of one cell, optionally with a previous characterization.
#[derive(Debug, Clone, PartialEq)]
pub struct CellInput {
    /// Cell identity.
    pub id: String,
    /// Measured sweep.
    pub samples: Vec<SamplePoint>,
    /// Previous characterization of the cell.
    pub cached: Option<CellCharacterization>,
}

impl CellInput {
    /// Measurements without a cached characterization.
    pub fn new(id: impl Into<String>, samples: impl IntoSamples) -> Self {
        Self {
            id: id.into(),
            samples: samples.into_samples(),
            cached: None,
        }
    }

    /// Reuse `cached` if its residual is good enough, see [`Characterizer::characterize_cached`].
    pub fn with_cached(mut self, cached: CellCharacterization) -> Self {
        self.cached = Some(cached);
        self
    }
}

/// Seed of the random source of the cell at `index` in a batch.
pub fn cell_seed(seed: u64, index: usize) -> u64 {
    seed.wrapping_add(index as u64)
}

impl<M, L> Characterizer<M, L>
where
    M: CellModel,
    L: LocalMinimizer,
{
    fn characterize_input(&self, index: usize, input: &CellInput, seed: u64) -> Result<CellCharacterization> {
        let mut rng = StdRng::seed_from_u64(cell_seed(seed, index));
        let result = self.characterize_cached(&input.id, input.samples.as_slice(), input.cached.as_ref(), &mut rng);
        if let Err(err) = &result {
            error!("Characterization failed: {err}");
        }
        result
    }

    /// Characterize a batch of cells.
    ///
    /// Every cell gets its own random source seeded from `seed` and its position, so results do
    /// not depend on the order cells are processed in.
    ///
    /// # Returns
    /// One result per input, in input order.
    pub fn characterize_cells(&self, inputs: &[CellInput], seed: u64) -> Vec<Result<CellCharacterization>> {
        info!("Characterizing {} cells.", inputs.len());
        inputs
            .iter()
            .enumerate()
            .map(|(i, input)| self.characterize_input(i, input, seed))
            .collect()
    }
}

/// A group of similar cells that are matched among themselves.
#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    /// Cluster identity, which orders the batch output.
    pub id: usize,
    /// Member cells.
    pub cells: Vec<MatchCell>,
}

impl Cluster {
    /// Cluster of prepared cells.
    pub fn new(id: usize, cells: Vec<MatchCell>) -> Self {
        Self { id, cells }
    }

    /// Cluster of characterized cells.
    ///
    /// Cells without a fill factor, i.e. zero open-circuit voltage or short-circuit current, are left out.
    pub fn from_characterizations<'a>(id: usize, cells: impl IntoIterator<Item = &'a CellCharacterization>) -> Self {
        let cells = cells
            .into_iter()
            .filter(|cell| match cell.fill_factor() {
                Ok(_) => true,
                Err(err) => {
                    warn!("Excluding cell from cluster {id}: {err}");
                    false
                }
            })
            .map_into()
            .collect();
        Self::new(id, cells)
    }
}

/// A match together with its position in the batch output.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedMatch {
    /// Position within the cluster, 0 is the best.
    pub rank: usize,
    /// Id of the originating cluster.
    pub cluster: usize,
    /// The match itself.
    pub matched: Match,
}

/// Outcome of matching a batch of clusters.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchMatches {
    /// Matches ordered by cluster id, then rank.
    pub matches: Vec<RankedMatch>,
    /// Clusters that could not be matched.
    pub failures: Vec<Error>,
}

/// Merge per-cluster results in cluster order, keeping at most `limit` matches overall.
fn merge(mut results: Vec<(usize, Result<Vec<Match>>)>, limit: Option<usize>) -> BatchMatches {
    results.sort_by_key(|(id, _)| *id);
    let limit = limit.unwrap_or(usize::MAX);
    let mut batch = BatchMatches::default();

    for (cluster, result) in results {
        match result {
            Ok(matches) => {
                let room = limit.saturating_sub(batch.matches.len());
                batch.matches.extend(
                    matches
                        .into_iter()
                        .take(room)
                        .enumerate()
                        .map(|(rank, matched)| RankedMatch {
                            rank,
                            cluster,
                            matched,
                        }),
                );
            }
            Err(err) => {
                let err = err.in_cluster(cluster);
                error!("Matching failed: {err}");
                batch.failures.push(err);
            }
        }
    }

    info!("Collected {} matches.", batch.matches.len());
    batch
}

impl<M: CellModel> Matcher<M> {
    /// Match every cluster independently.
    ///
    /// # Arguments
    /// - `clusters`: Clusters in any order. Output is ordered by their ids.
    /// - `limit`: Maximum number of matches over all clusters, taken from the lowest cluster ids.
    pub fn match_clusters(&self, clusters: &[Cluster], limit: Option<usize>) -> BatchMatches {
        info!("Matching {} clusters.", clusters.len());
        let results = clusters
            .iter()
            .map(|cluster| (cluster.id, self.generate_matches(&cluster.cells)))
            .collect_vec();
        merge(results, limit)
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;

    impl<M, L> Characterizer<M, L>
    where
        M: CellModel + Sync,
        L: LocalMinimizer + Sync,
    {
        /// Characterize a batch of cells in parallel.
        ///
        /// Also see [`characterize_cells`](Characterizer::characterize_cells()).
        /// The output is identical to the sequential version.
        pub fn characterize_cells_par(&self, inputs: &[CellInput], seed: u64) -> Vec<Result<CellCharacterization>> {
            info!("Characterizing {} cells.", inputs.len());
            inputs
                .par_iter()
                .enumerate()
                .map(|(i, input)| self.characterize_input(i, input, seed))
                .collect()
        }
    }

    impl<M: CellModel + Sync> Matcher<M> {
        /// Match every cluster independently, in parallel.
        ///
        /// Also see [`match_clusters`](Matcher::match_clusters()).
        /// The output is identical to the sequential version.
        pub fn match_clusters_par(&self, clusters: &[Cluster], limit: Option<usize>) -> BatchMatches {
            info!("Matching {} clusters.", clusters.len());
            let results = clusters
                .par_iter()
                .map(|cluster| (cluster.id, self.generate_matches(&cluster.cells)))
                .collect();
            merge(results, limit)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::NonidealCell;
    use crate::parameters::FitParameters;

    fn ok(id: usize, n: usize) -> (usize, Result<Vec<Match>>) {
        let matches = (0..n)
            .map(|i| Match {
                cell_ids: vec![format!("{id}-{i}")],
                voltages: vec![0.6],
                current: 5.,
                metric: 3. - i as f64,
            })
            .collect();
        (id, Ok(matches))
    }

    #[test]
    fn clusters_skip_cells_without_fill_factor() {
        let characterizer = Characterizer::new(NonidealCell::default());
        let lit = characterizer.from_parameters("lit", FitParameters::new(1000., 298.15, 0.01, 20.), 0.);
        let dark = characterizer.from_parameters("dark", FitParameters::new(0., 298.15, 0.01, 20.), 0.);

        let cluster = Cluster::from_characterizations(4, [&lit, &dark]);
        assert_eq!(cluster.id, 4);
        assert_eq!(cluster.cells, vec![MatchCell::from(&lit)]);
    }

    #[test]
    fn seeds_differ_per_cell() {
        assert_eq!(cell_seed(10, 0), 10);
        assert_ne!(cell_seed(10, 1), cell_seed(10, 2));
        assert_eq!(cell_seed(u64::MAX, 1), 0);
    }

    #[test]
    fn merge_orders_by_cluster() {
        let batch = merge(vec![ok(2, 1), ok(0, 2), ok(1, 0)], None);
        let order = batch.matches.iter().map(|m| (m.cluster, m.rank)).collect_vec();
        assert_eq!(order, vec![(0, 0), (0, 1), (2, 0)]);
        assert!(batch.failures.is_empty());
    }

    #[test]
    fn merge_applies_global_limit() {
        let batch = merge(vec![ok(0, 2), ok(1, 3), ok(2, 3)], Some(4));
        let order = batch.matches.iter().map(|m| (m.cluster, m.rank)).collect_vec();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
    }

    #[test]
    fn merge_isolates_failures() {
        let failed = (1, Err(Error::invalid_config("match size must be at least 1")));
        let batch = merge(vec![ok(0, 1), failed, ok(2, 1)], None);

        assert_eq!(batch.matches.len(), 2);
        assert_eq!(batch.failures.len(), 1);
        assert!(matches!(batch.failures[0], Error::Cluster { cluster: 1, .. }));
    }
}
