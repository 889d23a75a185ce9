//! Derivative-free local minimization over a subset of the parameters.

use argmin::core::{CostFunction, Error as ArgminError, Executor, State};
use argmin::solver::neldermead::NelderMead;
use log::debug;

use crate::parameters::{SCALE, Scaled};

/// Cost assigned to trial points whose objective is not finite.
const PENALTY: f64 = 1e12;

/// A local minimizer that only moves the coordinates selected by a mask.
///
/// Coordinates are in the internal scale and are kept inside `[0, SCALE]`.
pub trait LocalMinimizer {
    /// Minimize `objective` starting at `initial`, varying only coordinates where `free` is set.
    ///
    /// Returns the final point and its objective value. With no free coordinates, the
    /// initial point is evaluated and returned.
    fn minimize<O>(&self, objective: O, initial: Scaled, free: [bool; 4]) -> (Scaled, f64)
    where
        O: Fn(&Scaled) -> f64;
}

/// Nelder-Mead simplex search from `argmin`.
#[derive(Debug, Clone, PartialEq)]
pub struct NelderMeadMinimizer {
    /// Offset of the initial simplex vertices from the start point, in internal units.
    pub step: f64,
    /// Maximum simplex iterations per call.
    pub max_iters: u64,
    /// Standard deviation of the vertex costs at which the search stops.
    pub sd_tolerance: f64,
}

impl Default for NelderMeadMinimizer {
    fn default() -> Self {
        Self {
            step: 0.05 * SCALE,
            max_iters: 100,
            sd_tolerance: 1e-12,
        }
    }
}

/// The objective restricted to the free coordinates.
struct Restricted<'a, O> {
    objective: &'a O,
    base: Scaled,
    free: Vec<usize>,
}

impl<O: Fn(&Scaled) -> f64> Restricted<'_, O> {
    fn expand(&self, reduced: &[f64]) -> Scaled {
        let mut full = self.base;
        for (&i, &value) in self.free.iter().zip(reduced) {
            full[i] = value.clamp(0., SCALE);
        }
        full
    }
}

impl<O: Fn(&Scaled) -> f64> CostFunction for &Restricted<'_, O> {
    type Param = Vec<f64>;
    type Output = f64;

    fn cost(&self, param: &Self::Param) -> Result<Self::Output, ArgminError> {
        let value = (self.objective)(&self.expand(param));
        Ok(if value.is_finite() { value } else { PENALTY })
    }
}

impl NelderMeadMinimizer {
    fn simplex(&self, start: &[f64]) -> Vec<Vec<f64>> {
        let mut vertices = vec![start.to_vec()];
        for i in 0..start.len() {
            let mut vertex = start.to_vec();
            // step inwards when the start sits at the upper bound
            vertex[i] = if vertex[i] + self.step <= SCALE {
                vertex[i] + self.step
            } else {
                vertex[i] - self.step
            };
            vertices.push(vertex);
        }
        vertices
    }
}

impl LocalMinimizer for NelderMeadMinimizer {
    fn minimize<O>(&self, objective: O, initial: Scaled, free: [bool; 4]) -> (Scaled, f64)
    where
        O: Fn(&Scaled) -> f64,
    {
        let free = (0..4).filter(|&i| free[i]).collect::<Vec<_>>();
        let evaluate = |point: &Scaled| {
            let value = objective(point);
            if value.is_finite() { value } else { PENALTY }
        };

        if free.is_empty() {
            return (initial, evaluate(&initial));
        }

        let start = free.iter().map(|&i| initial[i]).collect::<Vec<_>>();
        let vertices = self.simplex(&start);
        let problem = Restricted {
            objective: &objective,
            base: initial,
            free,
        };
        let expand = |reduced: &[f64]| problem.expand(reduced);

        let solver = match NelderMead::new(vertices).with_sd_tolerance(self.sd_tolerance) {
            Ok(solver) => solver,
            Err(err) => {
                debug!("Nelder-Mead rejected its configuration: {err}");
                return (initial, evaluate(&initial));
            }
        };

        let result = Executor::new(&problem, solver)
            .configure(|state| state.max_iters(self.max_iters))
            .timer(false)
            .run();

        let point = match result {
            Ok(result) => result
                .state()
                .get_best_param()
                .map_or(initial, |best| expand(best)),
            Err(err) => {
                debug!("Nelder-Mead stopped with an error: {err}");
                initial
            }
        };
        (point, evaluate(&point))
    }
}
