//! Physical fit parameters and their internal scaling.
//!
//! The optimizer never sees physical values. Every parameter lives in `[0, SCALE]`
//! internally and is mapped to its physical range by a fixed affine transform,
//! which keeps parameters of very different magnitudes equally conditioned.

use std::fmt;

use nalgebra::Vector4;

/// Upper bound of every internally scaled parameter.
pub const SCALE: f64 = 1e-7;

/// Internal representation of a parameter set, ordered like [`Parameter::ALL`].
pub type Scaled = Vector4<f64>;

/// One of the four fitted quantities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Parameter {
    /// Irradiance in W/m².
    Irradiance,
    /// Temperature in K.
    Temperature,
    /// Series resistance in Ω.
    SeriesResistance,
    /// Shunt resistance in Ω.
    ShuntResistance,
}

impl Parameter {
    /// All parameters, in internal vector order.
    pub const ALL: [Parameter; 4] = [
        Parameter::Irradiance,
        Parameter::Temperature,
        Parameter::SeriesResistance,
        Parameter::ShuntResistance,
    ];

    /// Position in a [`Scaled`] vector.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Physical `(offset, span)` so that `physical = scaled / SCALE * span + offset`.
    fn affine(self) -> (f64, f64) {
        match self {
            Parameter::Irradiance => (0., 1000.),
            Parameter::Temperature => (250., 100.),
            Parameter::SeriesResistance => (0., 5.),
            Parameter::ShuntResistance => (0.01, 50.),
        }
    }

    /// Valid physical range `[min, max]`.
    pub fn bounds(self) -> (f64, f64) {
        let (offset, span) = self.affine();
        (offset, offset + span)
    }

    /// Map an internal value to its physical value.
    pub fn to_physical(self, scaled: f64) -> f64 {
        let (offset, span) = self.affine();
        scaled / SCALE * span + offset
    }

    /// Map a physical value to the internal scale, clamped to the valid range.
    pub fn to_scaled(self, physical: f64) -> f64 {
        let (offset, span) = self.affine();
        ((physical - offset) / span * SCALE).clamp(0., SCALE)
    }
}

impl fmt::Display for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Parameter::Irradiance => "irradiance",
            Parameter::Temperature => "temperature",
            Parameter::SeriesResistance => "r_series",
            Parameter::ShuntResistance => "r_shunt",
        };
        f.write_str(name)
    }
}

/// Physical parameters of the nonideal diode model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitParameters {
    /// Irradiance in W/m², within `[0, 1000]`.
    pub irradiance: f64,
    /// Temperature in K, within `[250, 350]`.
    pub temperature: f64,
    /// Series resistance in Ω, within `[0, 5]`.
    pub r_series: f64,
    /// Shunt resistance in Ω, within `[0.01, 50.01]`.
    pub r_shunt: f64,
}

impl FitParameters {
    /// Parameters from physical values.
    pub fn new(irradiance: f64, temperature: f64, r_series: f64, r_shunt: f64) -> Self {
        Self {
            irradiance,
            temperature,
            r_series,
            r_shunt,
        }
    }

    /// Recover physical parameters from an internal vector. Out of range values are clamped.
    pub fn from_scaled(scaled: &Scaled) -> Self {
        let value = |p: Parameter| p.to_physical(scaled[p.index()].clamp(0., SCALE));
        Self {
            irradiance: value(Parameter::Irradiance),
            temperature: value(Parameter::Temperature),
            r_series: value(Parameter::SeriesResistance),
            r_shunt: value(Parameter::ShuntResistance),
        }
    }

    /// Map to the internal scale, clamping out of range values.
    pub fn to_scaled(&self) -> Scaled {
        Scaled::from_fn(|i, _| {
            let p = Parameter::ALL[i];
            p.to_scaled(self.get(p))
        })
    }

    /// Value of one parameter.
    pub fn get(&self, parameter: Parameter) -> f64 {
        match parameter {
            Parameter::Irradiance => self.irradiance,
            Parameter::Temperature => self.temperature,
            Parameter::SeriesResistance => self.r_series,
            Parameter::ShuntResistance => self.r_shunt,
        }
    }

    /// Whether every value lies inside its physical bounds.
    pub fn in_bounds(&self) -> bool {
        Parameter::ALL.iter().all(|&p| {
            let (min, max) = p.bounds();
            let value = self.get(p);
            value >= min - 1e-9 && value <= max + 1e-9
        })
    }

    /// As `[irradiance, temperature, r_series, r_shunt]`.
    pub fn to_array(&self) -> [f64; 4] {
        [self.irradiance, self.temperature, self.r_series, self.r_shunt]
    }
}

impl From<[f64; 4]> for FitParameters {
    fn from([irradiance, temperature, r_series, r_shunt]: [f64; 4]) -> Self {
        Self::new(irradiance, temperature, r_series, r_shunt)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn affine_maps() {
        let scaled = Scaled::new(0.8e-7, 0.48e-7, 0.004e-7, 0.4e-7);
        let params = FitParameters::from_scaled(&scaled);

        assert_abs_diff_eq!(params.irradiance, 800., epsilon = 1e-9);
        assert_abs_diff_eq!(params.temperature, 298., epsilon = 1e-9);
        assert_abs_diff_eq!(params.r_series, 0.02, epsilon = 1e-9);
        assert_abs_diff_eq!(params.r_shunt, 20.01, epsilon = 1e-9);
        assert_abs_diff_eq!(params.to_scaled(), scaled, epsilon = 1e-20);
    }

    #[test]
    fn clamped_to_bounds() {
        let params = FitParameters::from_scaled(&Scaled::new(-1e-7, 2e-7, 0., 1e-7));
        assert!(params.in_bounds());
        assert_eq!(params.irradiance, 0.);
        assert_eq!(params.temperature, 350.);
        assert_abs_diff_eq!(params.r_shunt, 50.01, epsilon = 1e-9);

        assert!(!FitParameters::new(1200., 298., 0.1, 10.).in_bounds());
    }
}
