//! Physical cell model.
//!
//! The engines only see the [`CellModel`] trait. [`NonidealCell`] is the single-diode
//! implementation used by default:
//!   I = I_L - I_0 * (exp((V + I*R_s) / (n*V_t)) - 1) - (V + I*R_s) / R_sh
//!
//! The equation is implicit in `I`. It is solved for the diode voltage `x = V + I*R_s`,
//! which turns it into a strictly decreasing scalar function that can be bracketed.

/// Boltzmann constant over elementary charge, in V/K.
const K_OVER_Q: f64 = 1.380_649e-23 / 1.602_176_634e-19;
/// Maximum iterations for the implicit diode equation. Bisection alone needs about 50.
const MAX_ITERATIONS: usize = 200;
/// Convergence tolerance on the diode voltage, in volts.
const TOLERANCE: f64 = 1e-12;
/// Series resistances below this are treated as zero.
const MIN_SERIES_RESISTANCE: f64 = 1e-9;

/// Fixed illumination and temperature a model is evaluated at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OperatingConditions {
    /// Irradiance in W/m².
    pub irradiance: f64,
    /// Cell temperature in K.
    pub temperature: f64,
}

impl OperatingConditions {
    /// Standard test conditions, 1000 W/m² at 25 °C.
    pub const STC: Self = Self {
        irradiance: 1000.,
        temperature: 298.15,
    };
}

impl Default for OperatingConditions {
    fn default() -> Self {
        Self::STC
    }
}

/// A deterministic current model of a photovoltaic cell.
///
/// Implementations must be non-increasing in `voltage` over the operating region.
/// Beyond open circuit they may return negative currents.
pub trait CellModel {
    /// Current in A delivered at `voltage` (V).
    fn current(
        &self,
        irradiance: f64,
        temperature: f64,
        r_series: f64,
        r_shunt: f64,
        voltage: f64,
    ) -> f64;
}

impl<M: CellModel + ?Sized> CellModel for &M {
    fn current(
        &self,
        irradiance: f64,
        temperature: f64,
        r_series: f64,
        r_shunt: f64,
        voltage: f64,
    ) -> f64 {
        (**self).current(irradiance, temperature, r_series, r_shunt, voltage)
    }
}

/// Single-diode model of a silicon cell.
#[derive(Debug, Clone, PartialEq)]
pub struct NonidealCell {
    /// Short-circuit current at reference conditions (A).
    pub i_sc_ref: f64,
    /// Open-circuit voltage at reference conditions (V), used to derive the saturation current.
    pub v_oc_ref: f64,
    /// Reference temperature (K).
    pub t_ref: f64,
    /// Diode ideality factor.
    pub ideality: f64,
    /// Temperature coefficient of the photocurrent (1/K).
    pub alpha: f64,
    /// Band gap (eV).
    pub band_gap: f64,
}

impl Default for NonidealCell {
    fn default() -> Self {
        Self {
            i_sc_ref: 6.15,
            v_oc_ref: 0.72,
            t_ref: 298.15,
            ideality: 1.,
            alpha: 5e-4,
            band_gap: 1.12,
        }
    }
}

impl NonidealCell {
    /// Thermal voltage times ideality factor.
    fn n_vt(&self, temperature: f64) -> f64 {
        self.ideality * K_OVER_Q * temperature
    }

    fn photocurrent(&self, irradiance: f64, temperature: f64) -> f64 {
        self.i_sc_ref * (irradiance / 1000.) * (1. + self.alpha * (temperature - self.t_ref))
    }

    fn saturation_current(&self, temperature: f64) -> f64 {
        let i0_ref = self.i_sc_ref / ((self.v_oc_ref / self.n_vt(self.t_ref)).exp() - 1.);
        let ratio = temperature / self.t_ref;
        i0_ref
            * ratio.powi(3)
            * (self.band_gap / (self.ideality * K_OVER_Q) * (1. / self.t_ref - 1. / temperature))
                .exp()
    }
}

impl CellModel for NonidealCell {
    fn current(
        &self,
        irradiance: f64,
        temperature: f64,
        r_series: f64,
        r_shunt: f64,
        voltage: f64,
    ) -> f64 {
        let n_vt = self.n_vt(temperature);
        let i_l = self.photocurrent(irradiance, temperature);
        let i_0 = self.saturation_current(temperature);

        if r_series < MIN_SERIES_RESISTANCE {
            return i_l - i_0 * ((voltage / n_vt).exp() - 1.) - voltage / r_shunt;
        }

        // g(x) is strictly decreasing in the diode voltage x
        let g = |x: f64| i_l - i_0 * ((x / n_vt).exp() - 1.) - x / r_shunt - (x - voltage) / r_series;
        let dg = |x: f64| -i_0 / n_vt * (x / n_vt).exp() - 1. / r_shunt - 1. / r_series;

        // g(lo) >= 0 and g(hi) <= 0
        let mut lo = voltage.min(0.);
        let mut hi = ((i_l.max(0.) + i_0 + voltage / r_series) / (1. / r_shunt + 1. / r_series)).max(lo);
        let mut x = (voltage + i_l * r_series).clamp(lo, hi);
        let mut step = hi - lo;
        let mut previous_step = step;

        for _ in 0..MAX_ITERATIONS {
            let gx = g(x);
            if gx == 0. {
                break;
            }
            if gx > 0. {
                lo = x;
            } else {
                hi = x;
            }

            // Newton only while it stays in the bracket and shrinks at least as fast as bisection
            let slope = dg(x);
            let newton = x - gx / slope;
            let next = if newton > lo && newton < hi && (2. * gx).abs() <= (previous_step * slope).abs() {
                newton
            } else {
                0.5 * (lo + hi)
            };

            previous_step = step;
            step = (next - x).abs();
            x = next;
            if step < TOLERANCE || hi - lo < TOLERANCE {
                break;
            }
        }

        (x - voltage) / r_series
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use super::*;

    #[test]
    fn short_circuit_current_at_stc() {
        let cell = NonidealCell::default();
        let i_sc = cell.current(1000., 298.15, 0., 20., 0.);
        assert_abs_diff_eq!(i_sc, 6.15, epsilon = 1e-9);
    }

    #[test]
    fn open_circuit_near_reference() {
        let cell = NonidealCell::default();
        let i = cell.current(1000., 298.15, 0., 1e9, 0.72);
        assert_abs_diff_eq!(i, 0., epsilon = 1e-6);
        assert!(cell.current(1000., 298.15, 0.01, 20., 0.8) < 0.);
    }

    #[test]
    fn series_resistance_satisfies_implicit_equation() {
        let cell = NonidealCell::default();
        let (g, t, r_s, r_sh, v) = (800., 310., 0.05, 15., 0.55);
        let i = cell.current(g, t, r_s, r_sh, v);

        let n_vt = cell.n_vt(t);
        let x = v + i * r_s;
        let rhs = cell.photocurrent(g, t)
            - cell.saturation_current(t) * ((x / n_vt).exp() - 1.)
            - x / r_sh;
        assert_abs_diff_eq!(i, rhs, epsilon = 1e-9);
    }

    #[test]
    fn converges_with_large_series_resistance() {
        let cell = NonidealCell::default();
        let (g, t, r_s, r_sh) = (130.97, 280.71, 4.449, 10.27);
        let n_vt = cell.n_vt(t);

        let mut previous = f64::INFINITY;
        for k in 0..=100 {
            let v = k as f64 * 0.008;
            let i = cell.current(g, t, r_s, r_sh, v);
            let x = v + i * r_s;
            let rhs = cell.photocurrent(g, t) - cell.saturation_current(t) * ((x / n_vt).exp() - 1.) - x / r_sh;
            assert_abs_diff_eq!(i, rhs, epsilon = 1e-8);
            assert!(i <= previous, "{i} > {previous} at {v} V");
            previous = i;
        }
    }

    #[test]
    fn finite_for_extreme_parameters() {
        let cell = NonidealCell::default();
        for r_s in [0., 1e-6, 5.] {
            for v in [-0.5, 0., 0.7, 1.5] {
                assert!(cell.current(1000., 250., r_s, 0.01, v).is_finite());
                assert!(cell.current(0., 350., r_s, 50.01, v).is_finite());
            }
        }
    }

    #[test]
    fn monotonic_in_voltage() {
        let cell = NonidealCell::default();
        let mut rng = StdRng::seed_from_u64(17);

        for _ in 0..200 {
            let g = rng.random_range(0.0..=1000.);
            let t = rng.random_range(250.0..=350.);
            let r_s = rng.random_range(0.0..=5.);
            let r_sh = rng.random_range(0.01..=50.01);

            let mut previous = f64::INFINITY;
            for k in 0..=100 {
                let i = cell.current(g, t, r_s, r_sh, k as f64 * 0.008);
                assert!(i <= previous + 1e-8, "{i} > {previous} at ({g}, {t}, {r_s}, {r_sh})");
                previous = i;
            }
        }
    }
}
