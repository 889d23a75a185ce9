//! Measured I-V samples and their preparation before fitting.
//!
//! Raw sweeps contain repeated voltages and far more points than the fit needs.
//! [`average_duplicates`] collapses them; [`Resampler`] draws a bounded subset and
//! densifies the region around the knee of the curve by linear interpolation.

use itertools::Itertools;
use ndarray::{Array2, ArrayView2, Axis};
use rand::Rng;
use rand::seq::index;
use rand_distr::{Distribution, Normal};

/// One measured point of a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplePoint {
    /// Voltage in V.
    pub voltage: f64,
    /// Current in A.
    pub current: f64,
}

impl SamplePoint {
    /// Sample at `voltage` (V) with `current` (A).
    pub fn new(voltage: f64, current: f64) -> Self {
        Self { voltage, current }
    }

    /// Power in W.
    pub fn power(&self) -> f64 {
        self.voltage * self.current
    }
}

impl From<(f64, f64)> for SamplePoint {
    fn from((voltage, current): (f64, f64)) -> Self {
        Self::new(voltage, current)
    }
}

impl From<[f64; 2]> for SamplePoint {
    fn from([voltage, current]: [f64; 2]) -> Self {
        Self::new(voltage, current)
    }
}

/// Conversion of the usual point containers into samples.
pub trait IntoSamples {
    /// Collect into a vector of samples.
    fn into_samples(self) -> Vec<SamplePoint>;
}

impl IntoSamples for Vec<SamplePoint> {
    fn into_samples(self) -> Vec<SamplePoint> {
        self
    }
}

impl IntoSamples for &[SamplePoint] {
    fn into_samples(self) -> Vec<SamplePoint> {
        self.to_vec()
    }
}

impl IntoSamples for Vec<(f64, f64)> {
    fn into_samples(self) -> Vec<SamplePoint> {
        self.into_iter().map_into().collect()
    }
}

impl IntoSamples for Vec<[f64; 2]> {
    fn into_samples(self) -> Vec<SamplePoint> {
        self.into_iter().map_into().collect()
    }
}

/// Rows of `(voltage, current)`. Shape `(n_points, 2)`.
impl IntoSamples for ArrayView2<'_, f64> {
    fn into_samples(self) -> Vec<SamplePoint> {
        assert_eq!(self.shape()[1], 2, "samples must have shape (n_points, 2)");
        self.axis_iter(Axis(0))
            .map(|row| SamplePoint::new(row[0], row[1]))
            .collect()
    }
}

impl IntoSamples for Array2<f64> {
    fn into_samples(self) -> Vec<SamplePoint> {
        self.view().into_samples()
    }
}

/// Average all samples taken at the same voltage and sort by voltage.
pub fn average_duplicates(samples: impl IntoSamples) -> Vec<SamplePoint> {
    samples
        .into_samples()
        .into_iter()
        .sorted_by(|a, b| a.voltage.total_cmp(&b.voltage))
        .chunk_by(|p| p.voltage.to_bits())
        .into_iter()
        .map(|(_, group)| {
            let (voltage, sum, count) = group.fold((0., 0., 0usize), |(_, sum, count), p| {
                (p.voltage, sum + p.current, count + 1)
            });
            SamplePoint::new(voltage, sum / count as f64)
        })
        .collect()
}

/// Whether the samples are sorted by strictly increasing voltage.
pub fn is_sorted(samples: &[SamplePoint]) -> bool {
    samples.iter().tuple_windows().all(|(a, b)| a.voltage < b.voltage)
}

/// Linear interpolation on voltage-sorted samples. `None` outside the sampled range.
pub fn interpolate(samples: &[SamplePoint], voltage: f64) -> Option<f64> {
    let upper = samples.partition_point(|p| p.voltage < voltage);
    match (upper.checked_sub(1).map(|i| samples[i]), samples.get(upper)) {
        (_, Some(b)) if b.voltage == voltage => Some(b.current),
        (Some(a), Some(b)) => {
            let t = (voltage - a.voltage) / (b.voltage - a.voltage);
            Some(a.current + t * (b.current - a.current))
        }
        _ => None,
    }
}

/// Bounded random subsampling plus knee densification.
#[derive(Debug, Clone, PartialEq)]
pub struct Resampler {
    /// Maximum number of measured points kept.
    pub max_samples: usize,
    /// Number of interpolated voltages drawn.
    pub extra_samples: usize,
    /// Mean of the normal distribution interpolated voltages are drawn from (V).
    pub knee_mean: f64,
    /// Standard deviation of that distribution (V).
    pub knee_std: f64,
    /// Interpolated voltages must lie this far inside the sampled range (V).
    pub guard: f64,
}

impl Default for Resampler {
    fn default() -> Self {
        Self {
            max_samples: 125,
            extra_samples: 125,
            knee_mean: 0.5,
            knee_std: 0.2,
            guard: 0.0005,
        }
    }
}

impl Resampler {
    /// Resample voltage-sorted, duplicate-free samples.
    pub fn resample<R: Rng + ?Sized>(&self, samples: &[SamplePoint], rng: &mut R) -> Vec<SamplePoint> {
        let amount = self.max_samples.min(samples.len());
        let subset = index::sample(rng, samples.len(), amount)
            .into_iter()
            .sorted()
            .map(|i| samples[i])
            .collect_vec();

        let (Some(first), Some(last)) = (subset.first(), subset.last()) else {
            return subset;
        };
        let (low, high) = (first.voltage + self.guard, last.voltage - self.guard);

        let mut points = match Normal::new(self.knee_mean, self.knee_std) {
            Ok(knee) => knee
                .sample_iter(&mut *rng)
                .take(self.extra_samples)
                .filter(|&v| v > low && v < high)
                .filter_map(|v| interpolate(&subset, v).map(|i| SamplePoint::new(v, i)))
                .collect_vec(),
            Err(_) => Vec::new(),
        };

        points.extend(subset);
        points.sort_by(|a, b| a.voltage.total_cmp(&b.voltage));
        points
    }
}
