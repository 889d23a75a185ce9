//! Operating point search for a series string of cells.
//!
//! Cells in series share one current and add their voltages. For a fixed group, every cell is
//! given a grid of candidate voltages around its maximum power point; combinations of these
//! voltages are evaluated under reference conditions and the best one is kept.

use std::borrow::Borrow;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use itertools::Itertools;
use log::debug;

use crate::characterization::CellCharacterization;
use crate::error::{Error, Result};
use crate::model::{CellModel, OperatingConditions};

/// Voltage grid spacing of the search (V).
pub const SEARCH_RESOLUTION: f64 = 0.005;
/// Slack when comparing accumulated floating point sums with grid steps.
const EPSILON: f64 = 1e-9;

/// Restriction on the summed voltage of a combination.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub enum SumConstraint {
    /// Keep every combination.
    Unconstrained,
    /// Keep combinations summing to this voltage, within one grid step.
    Total(f64),
    /// Like [`SumConstraint::Total`] with the sum of the cells' maximum power voltages.
    #[default]
    MppSum,
}

impl SumConstraint {
    fn total<C: Borrow<MatchCell>>(self, cells: &[C]) -> Option<f64> {
        match self {
            Self::Unconstrained => None,
            Self::Total(total) => Some(total),
            Self::MppSum => Some(cells.iter().map(|c| c.borrow().v_mpp).sum()),
        }
    }
}

/// Objective used to rank operating points and matches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Optimizer {
    /// Total string power, maximized.
    #[default]
    Power,
    /// Mean distance of the cell voltages from their maximum power voltages, minimized.
    ///
    /// This ignores the string current entirely and is a weak objective; it is kept for
    /// comparison with the power objective.
    DistFromMpp,
}

impl Optimizer {
    /// Whether larger metrics are better.
    pub fn maximizes(self) -> bool {
        matches!(self, Self::Power)
    }

    /// Metric of cells operated at `voltages` with the shared `current`.
    pub fn metric<C: Borrow<MatchCell>>(self, cells: &[C], voltages: &[f64], current: f64) -> f64 {
        match self {
            Self::Power => voltages.iter().map(|v| v * current).sum(),
            Self::DistFromMpp => {
                let total: f64 = cells
                    .iter()
                    .zip(voltages)
                    .map(|(c, v)| (v - c.borrow().v_mpp).abs())
                    .sum();
                total / voltages.len().max(1) as f64
            }
        }
    }

    /// Order two metrics with the better one first.
    pub fn compare(self, a: f64, b: f64) -> Ordering {
        if self.maximizes() { b.total_cmp(&a) } else { a.total_cmp(&b) }
    }

    fn is_better(self, candidate: f64, incumbent: f64) -> bool {
        self.compare(candidate, incumbent) == Ordering::Less
    }
}

impl FromStr for Optimizer {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "power_opt" | "power" => Ok(Self::Power),
            "dist_from_mpp_opt" | "dist_from_mpp" => Ok(Self::DistFromMpp),
            _ => Err(Error::UnresolvedSelector {
                kind: "optimizer",
                name: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Optimizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Power => write!(f, "power_opt"),
            Self::DistFromMpp => write!(f, "dist_from_mpp_opt"),
        }
    }
}

/// The data of a characterized cell needed for matching.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchCell {
    /// Cell identity.
    pub id: String,
    /// Voltage at the maximum power point (V).
    pub v_mpp: f64,
    /// Open-circuit voltage (V).
    pub v_oc: f64,
    /// Fitted series resistance (Ω).
    pub r_series: f64,
    /// Fitted shunt resistance (Ω).
    pub r_shunt: f64,
}

impl MatchCell {
    /// Cell from its matching data.
    pub fn new(id: impl Into<String>, v_mpp: f64, v_oc: f64, r_series: f64, r_shunt: f64) -> Self {
        Self {
            id: id.into(),
            v_mpp,
            v_oc,
            r_series,
            r_shunt,
        }
    }

    /// Current of this cell at `voltage` under `conditions`.
    pub fn current<M: CellModel>(&self, model: &M, conditions: OperatingConditions, voltage: f64) -> f64 {
        model.current(
            conditions.irradiance,
            conditions.temperature,
            self.r_series,
            self.r_shunt,
            voltage,
        )
    }
}

impl From<&CellCharacterization> for MatchCell {
    fn from(cell: &CellCharacterization) -> Self {
        Self {
            id: cell.id.clone(),
            v_mpp: cell.v_mpp,
            v_oc: cell.v_oc,
            r_series: cell.parameters.r_series,
            r_shunt: cell.parameters.r_shunt,
        }
    }
}

/// Best operating point of a group.
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Value of the optimizer objective.
    pub metric: f64,
    /// Voltage of each cell, in group order.
    pub voltages: Vec<f64>,
    /// Shared string current.
    pub current: f64,
}

/// Candidate voltages of each cell.
///
/// All cells share the half width `min(v_oc - v_mpp)`, so the grid is centered on each cell's
/// maximum power voltage and clamped to `[0, v_oc]`.
pub fn voltage_grids<C: Borrow<MatchCell>>(cells: &[C], resolution: f64) -> Vec<Vec<f64>> {
    let half_width = cells
        .iter()
        .map(|c| c.borrow().v_oc - c.borrow().v_mpp)
        .reduce(f64::min)
        .unwrap_or(0.)
        .max(0.);

    cells
        .iter()
        .map(|c| {
            let c = c.borrow();
            let low = (c.v_mpp - half_width).max(0.);
            let high = (c.v_mpp + half_width).min(c.v_oc);
            let steps = ((high - low).max(0.) / resolution + EPSILON).floor() as usize;
            (0..=steps).map(|k| low + k as f64 * resolution).collect()
        })
        .collect()
}

/// All voltage combinations of a group that satisfy `constraint`.
///
/// # Returns
/// One voltage vector per combination, ordered like the cells.
pub fn generate_search_space<C: Borrow<MatchCell>>(
    cells: &[C],
    constraint: SumConstraint,
    resolution: f64,
) -> Result<Vec<Vec<f64>>> {
    if !(resolution > 0.) {
        return Err(Error::invalid_config(format!(
            "search resolution must be positive, got {resolution}"
        )));
    }
    if cells.is_empty() {
        return Ok(Vec::new());
    }

    let total = constraint.total(cells);
    let space = voltage_grids(cells, resolution)
        .into_iter()
        .multi_cartesian_product()
        .filter(|voltages| {
            total.is_none_or(|total| (voltages.iter().sum::<f64>() - total).abs() <= resolution + EPSILON)
        })
        .collect_vec();

    debug!("Search space of {} cells has {} combinations.", cells.len(), space.len());
    Ok(space)
}

/// Evaluate one combination: the string current is the lowest cell current.
pub fn evaluate<M, C>(
    model: &M,
    conditions: OperatingConditions,
    cells: &[C],
    voltages: &[f64],
    optimizer: Optimizer,
) -> Solution
where
    M: CellModel,
    C: Borrow<MatchCell>,
{
    let current = cells
        .iter()
        .zip(voltages)
        .map(|(c, &v)| c.borrow().current(model, conditions, v))
        .fold(f64::INFINITY, f64::min);

    Solution {
        metric: optimizer.metric(cells, voltages, current),
        voltages: voltages.to_vec(),
        current,
    }
}

/// Best combination of a search space. The first of equally good combinations wins.
///
/// # Returns
/// `None` if `combinations` is empty.
pub fn solve_search_space<M, C>(
    model: &M,
    conditions: OperatingConditions,
    cells: &[C],
    combinations: &[Vec<f64>],
    optimizer: Optimizer,
) -> Option<Solution>
where
    M: CellModel,
    C: Borrow<MatchCell>,
{
    combinations
        .iter()
        .map(|voltages| evaluate(model, conditions, cells, voltages, optimizer))
        .fold(None, |best: Option<Solution>, solution| match best {
            Some(best) if !optimizer.is_better(solution.metric, best.metric) => Some(best),
            _ => Some(solution),
        })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::model::NonidealCell;

    fn pair() -> [MatchCell; 2] {
        [
            MatchCell::new("a", 0.6, 0.7, 0.01, 2.),
            MatchCell::new("b", 0.6, 0.7, 0.01, 2.),
        ]
    }

    #[test]
    fn optimizer_names() {
        assert_eq!("power_opt".parse::<Optimizer>(), Ok(Optimizer::Power));
        assert_eq!("dist_from_mpp_opt".parse::<Optimizer>(), Ok(Optimizer::DistFromMpp));
        assert_eq!(Optimizer::DistFromMpp.to_string().parse(), Ok(Optimizer::DistFromMpp));
        assert_eq!(
            "fastest".parse::<Optimizer>(),
            Err(Error::UnresolvedSelector {
                kind: "optimizer",
                name: "fastest".into()
            })
        );
    }

    #[test]
    fn grids_share_half_width() {
        let cells = [
            MatchCell::new("a", 0.60, 0.70, 0.01, 2.),
            MatchCell::new("b", 0.62, 0.65, 0.01, 2.),
        ];
        let grids = voltage_grids(&cells, SEARCH_RESOLUTION);

        // half width is 0.03 for both cells, which gives 13 points each
        assert_eq!(grids[0].len(), 13);
        assert_eq!(grids[1].len(), 13);
        assert_abs_diff_eq!(grids[0][0], 0.57, epsilon = 1e-12);
        assert_abs_diff_eq!(grids[1][12], 0.65, epsilon = 1e-9);
    }

    #[test]
    fn mpp_beyond_open_circuit_gives_single_point() {
        let cells = [MatchCell::new("a", 0.75, 0.7, 0.01, 2.)];
        assert_eq!(voltage_grids(&cells, SEARCH_RESOLUTION), vec![vec![0.75]]);
    }

    #[test]
    fn unconstrained_space_is_full_product() {
        let space = generate_search_space(&pair(), SumConstraint::Unconstrained, SEARCH_RESOLUTION).unwrap();
        assert_eq!(space.len(), 41 * 41);
    }

    #[test]
    fn constrained_sums() {
        for constraint in [SumConstraint::Total(1.2), SumConstraint::MppSum] {
            let space = generate_search_space(&pair(), constraint, SEARCH_RESOLUTION).unwrap();
            assert!(!space.is_empty());
            assert!(space.len() < 41 * 41);
            for voltages in &space {
                let sum: f64 = voltages.iter().sum();
                assert!((sum - 1.2).abs() <= SEARCH_RESOLUTION + 1e-9, "{voltages:?}");
            }
        }
    }

    #[test]
    fn invalid_resolution() {
        assert!(matches!(
            generate_search_space(&pair(), SumConstraint::MppSum, 0.),
            Err(Error::InvalidConfig { .. })
        ));
    }

    #[test]
    fn string_current_is_minimum() {
        let model = NonidealCell::default();
        let cells = [
            MatchCell::new("a", 0.6, 0.7, 0.01, 2.),
            MatchCell::new("b", 0.6, 0.7, 0.5, 2.),
        ];
        let voltages = [0.6, 0.55];
        let stc = OperatingConditions::STC;
        let solution = evaluate(&model, stc, &cells, &voltages, Optimizer::Power);

        let expected = cells[0]
            .current(&model, stc, 0.6)
            .min(cells[1].current(&model, stc, 0.55));
        assert_eq!(solution.current, expected);
        assert_abs_diff_eq!(solution.metric, 1.15 * expected, epsilon = 1e-12);
    }

    #[test]
    fn best_combination_and_ties() {
        let model = NonidealCell::default();
        let cells = pair();
        let stc = OperatingConditions::STC;

        assert_eq!(solve_search_space(&model, stc, &cells, &[], Optimizer::Power), None);

        let combos = vec![vec![0.5, 0.5], vec![0.55, 0.55], vec![0.55, 0.55]];
        let best = solve_search_space(&model, stc, &cells, &combos, Optimizer::Power).unwrap();
        assert_eq!(best.voltages, vec![0.55, 0.55]);

        let combos = vec![vec![0.6, 0.55], vec![0.55, 0.6], vec![0.6, 0.6]];
        let best = solve_search_space(&model, stc, &cells, &combos, Optimizer::DistFromMpp).unwrap();
        assert_eq!(best.voltages, vec![0.6, 0.6]);
        assert_eq!(best.metric, 0.);

        // equal distances keep the first combination
        let combos = vec![vec![0.6, 0.55], vec![0.55, 0.6]];
        let best = solve_search_space(&model, stc, &cells, &combos, Optimizer::DistFromMpp).unwrap();
        assert_eq!(best.voltages, vec![0.6, 0.55]);
    }
}
