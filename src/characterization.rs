//! Characterization of single cells: fitting followed by curve post-processing.

use log::{debug, info};
use ndarray::Array1;
use rand::Rng;

use crate::error::{Error, Result};
use crate::fit::{CurveFit, FitResult};
use crate::minimize::{LocalMinimizer, NelderMeadMinimizer};
use crate::model::CellModel;
use crate::parameters::FitParameters;
use crate::samples::{IntoSamples, Resampler, SamplePoint, average_duplicates};

/// Upper voltage of the regenerated curve.
const DEFAULT_CURVE_VOLTAGE: f64 = 0.8;
/// Number of points of the regenerated curve.
const DEFAULT_CURVE_RESOLUTION: usize = 100;
/// Points below this current are beyond open circuit and are dropped.
pub const CURRENT_FLOOR: f64 = 0.005;

/// Summary metrics of an I-V curve.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CurveSummary {
    /// Open-circuit voltage (V).
    pub v_oc: f64,
    /// Short-circuit current (A).
    pub i_sc: f64,
    /// Voltage at the maximum power point (V).
    pub v_mpp: f64,
    /// Current at the maximum power point (A).
    pub i_mpp: f64,
}

/// Evaluate `model` at `resolution` uniformly spaced voltages in `[0, v_max)`.
pub fn fitted_curve<M: CellModel>(
    model: &M,
    parameters: &FitParameters,
    v_max: f64,
    resolution: usize,
) -> Vec<SamplePoint> {
    let step = v_max / resolution as f64;
    Array1::from_shape_fn(resolution, |k| k as f64 * step)
        .iter()
        .map(|&v| {
            let i = model.current(
                parameters.irradiance,
                parameters.temperature,
                parameters.r_series,
                parameters.r_shunt,
                v,
            );
            SamplePoint::new(v, i)
        })
        .collect()
}

/// Drop nonphysical points: negative voltage or current below `floor`.
pub fn filter_curve(curve: &[SamplePoint], floor: f64) -> Vec<SamplePoint> {
    curve
        .iter()
        .filter(|p| p.current >= floor && p.voltage >= 0.)
        .copied()
        .collect()
}

/// Open-circuit voltage, short-circuit current and maximum power point of a curve.
///
/// The maximum power point is the first point, in the given order, with the highest power.
/// An empty curve gives all zeros.
pub fn summarize(curve: &[SamplePoint]) -> CurveSummary {
    curve.iter().fold(CurveSummary::default(), |mut summary, p| {
        summary.v_oc = summary.v_oc.max(p.voltage);
        summary.i_sc = summary.i_sc.max(p.current);
        if p.power() > summary.v_mpp * summary.i_mpp {
            summary.v_mpp = p.voltage;
            summary.i_mpp = p.current;
        }
        summary
    })
}

/// A characterized cell.
#[derive(Debug, Clone, PartialEq)]
pub struct CellCharacterization {
    /// Cell identity.
    pub id: String,
    /// Fitted model parameters.
    pub parameters: FitParameters,
    /// Chi-square of the fit.
    pub fit_residual: f64,
    /// Open-circuit voltage (V).
    pub v_oc: f64,
    /// Short-circuit current (A).
    pub i_sc: f64,
    /// Voltage at the maximum power point (V).
    pub v_mpp: f64,
    /// Current at the maximum power point (A).
    pub i_mpp: f64,
    /// The regenerated curve after filtering.
    pub curve: Vec<SamplePoint>,
}

impl CellCharacterization {
    /// The summary metrics.
    pub fn summary(&self) -> CurveSummary {
        CurveSummary {
            v_oc: self.v_oc,
            i_sc: self.i_sc,
            v_mpp: self.v_mpp,
            i_mpp: self.i_mpp,
        }
    }

    /// Power at the maximum power point (W).
    pub fn mpp_power(&self) -> f64 {
        self.v_mpp * self.i_mpp
    }

    /// Maximum power over `v_oc * i_sc`.
    pub fn fill_factor(&self) -> Result<f64> {
        if self.v_oc == 0. {
            return Err(Error::DivideByZero {
                cell: self.id.clone(),
                quantity: "v_oc",
            });
        }
        if self.i_sc == 0. {
            return Err(Error::DivideByZero {
                cell: self.id.clone(),
                quantity: "i_sc",
            });
        }
        Ok(self.mpp_power() / (self.v_oc * self.i_sc))
    }
}

/// Fits cells and post-processes the fitted curves.
#[derive(Debug, Clone)]
pub struct Characterizer<M, L = NelderMeadMinimizer> {
    fit: CurveFit<M, L>,
    curve_voltage: f64,
    curve_resolution: usize,
    current_floor: f64,
    resampler: Option<Resampler>,
}

impl<M: CellModel> Characterizer<M> {
    /// Characterize against `model` with default options.
    pub fn new(model: M) -> Self {
        Self::from_fit(CurveFit::new(model))
    }
}

impl<M, L> Characterizer<M, L>
where
    M: CellModel,
    L: LocalMinimizer,
{
    /// Use a preconfigured curve fit.
    pub fn from_fit(fit: CurveFit<M, L>) -> Self {
        Self {
            fit,
            curve_voltage: DEFAULT_CURVE_VOLTAGE,
            curve_resolution: DEFAULT_CURVE_RESOLUTION,
            current_floor: CURRENT_FLOOR,
            resampler: Some(Resampler::default()),
        }
    }

    /// Set the residual at which fitting stops.
    pub fn with_target(mut self, target: f64) -> Self {
        self.fit = self.fit.with_target(target);
        self
    }

    /// Set the voltage range `[0, voltage)` and number of points of the regenerated curve.
    pub fn with_curve(mut self, voltage: f64, resolution: usize) -> Self {
        self.curve_voltage = voltage;
        self.curve_resolution = resolution;
        self
    }

    /// Set the current below which regenerated points are dropped.
    pub fn with_current_floor(mut self, floor: f64) -> Self {
        self.current_floor = floor;
        self
    }

    /// Set or disable sample resampling before the fit.
    pub fn with_resampler(mut self, resampler: Option<Resampler>) -> Self {
        self.resampler = resampler;
        self
    }

    /// Residual at which fitting stops.
    pub fn target(&self) -> f64 {
        self.fit.target()
    }

    /// Build the characterization of already fitted parameters.
    pub fn from_parameters(&self, id: &str, parameters: FitParameters, fit_residual: f64) -> CellCharacterization {
        let curve = fitted_curve(
            self.fit.model(),
            &parameters,
            self.curve_voltage,
            self.curve_resolution,
        );
        let curve = filter_curve(&curve, self.current_floor);
        let CurveSummary {
            v_oc,
            i_sc,
            v_mpp,
            i_mpp,
        } = summarize(&curve);

        CellCharacterization {
            id: id.to_owned(),
            parameters,
            fit_residual,
            v_oc,
            i_sc,
            v_mpp,
            i_mpp,
            curve,
        }
    }

    /// Fit the samples of one cell and characterize the result.
    pub fn characterize<S, R>(&self, id: &str, samples: S, rng: &mut R) -> Result<CellCharacterization>
    where
        S: IntoSamples,
        R: Rng + ?Sized,
    {
        let points = average_duplicates(samples);
        let points = match &self.resampler {
            Some(resampler) => resampler.resample(&points, rng),
            None => points,
        };
        debug!("Fitting cell '{id}' to {} points.", points.len());

        let FitResult {
            parameters,
            residual,
            ..
        } = self.fit.fit(&points, rng).map_err(|err| err.for_cell(id))?;

        Ok(self.from_parameters(id, parameters, residual))
    }

    /// Characterize a cell, reusing a cached result when it is good enough.
    ///
    /// A cached residual at or below the target is returned as is. Otherwise the cell is
    /// refitted and whichever of the two results has the lower residual is kept.
    pub fn characterize_cached<S, R>(
        &self,
        id: &str,
        samples: S,
        cached: Option<&CellCharacterization>,
        rng: &mut R,
    ) -> Result<CellCharacterization>
    where
        S: IntoSamples,
        R: Rng + ?Sized,
    {
        if let Some(cached) = cached {
            if cached.fit_residual <= self.target() {
                debug!("Reusing cached characterization of cell '{id}'.");
                return Ok(cached.clone());
            }
        }

        let fresh = self.characterize(id, samples, rng)?;
        match cached {
            Some(cached) if cached.fit_residual <= fresh.fit_residual => {
                info!(
                    "Refit of cell '{id}' did not improve on the cached residual {}.",
                    cached.fit_residual
                );
                Ok(cached.clone())
            }
            _ => Ok(fresh),
        }
    }
}
