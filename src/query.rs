//! Filtering and ranking of characterized cells.

use std::fmt;
use std::str::FromStr;

use itertools::{Itertools, MinMaxResult};
use log::warn;

use crate::characterization::CellCharacterization;
use crate::error::{Error, Result};

/// A scalar property of a characterized cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CellMetric {
    /// `v_oc`
    OpenCircuitVoltage,
    /// `i_sc`
    ShortCircuitCurrent,
    /// `v_mpp`
    MppVoltage,
    /// `i_mpp`
    MppCurrent,
    /// `ff`
    FillFactor,
    /// `irrad`
    Irradiance,
    /// `temp`
    Temperature,
    /// `r_s`
    SeriesResistance,
    /// `r_sh`
    ShuntResistance,
    /// `fit_err`
    FitResidual,
}

impl CellMetric {
    /// All metrics.
    pub const ALL: [Self; 10] = [
        Self::OpenCircuitVoltage,
        Self::ShortCircuitCurrent,
        Self::MppVoltage,
        Self::MppCurrent,
        Self::FillFactor,
        Self::Irradiance,
        Self::Temperature,
        Self::SeriesResistance,
        Self::ShuntResistance,
        Self::FitResidual,
    ];

    /// Name the metric is parsed from.
    pub fn name(self) -> &'static str {
        match self {
            Self::OpenCircuitVoltage => "v_oc",
            Self::ShortCircuitCurrent => "i_sc",
            Self::MppVoltage => "v_mpp",
            Self::MppCurrent => "i_mpp",
            Self::FillFactor => "ff",
            Self::Irradiance => "irrad",
            Self::Temperature => "temp",
            Self::SeriesResistance => "r_s",
            Self::ShuntResistance => "r_sh",
            Self::FitResidual => "fit_err",
        }
    }

    /// Value of this metric for `cell`. Only the fill factor can fail.
    pub fn value(self, cell: &CellCharacterization) -> Result<f64> {
        Ok(match self {
            Self::OpenCircuitVoltage => cell.v_oc,
            Self::ShortCircuitCurrent => cell.i_sc,
            Self::MppVoltage => cell.v_mpp,
            Self::MppCurrent => cell.i_mpp,
            Self::FillFactor => cell.fill_factor()?,
            Self::Irradiance => cell.parameters.irradiance,
            Self::Temperature => cell.parameters.temperature,
            Self::SeriesResistance => cell.parameters.r_series,
            Self::ShuntResistance => cell.parameters.r_shunt,
            Self::FitResidual => cell.fit_residual,
        })
    }
}

impl FromStr for CellMetric {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|metric| metric.name() == s)
            .ok_or_else(|| Error::UnresolvedSelector {
                kind: "metric",
                name: s.to_owned(),
            })
    }
}

impl fmt::Display for CellMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Comparison of a metric against a reference value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Condition {
    /// `==`
    Equal,
    /// `<`
    Less,
    /// `>`
    Greater,
    /// `<=`
    LessOrEqual,
    /// `>=`
    GreaterOrEqual,
}

impl Condition {
    /// Whether `value` satisfies the condition against `reference`.
    pub fn holds(self, value: f64, reference: f64) -> bool {
        match self {
            Self::Equal => value == reference,
            Self::Less => value < reference,
            Self::Greater => value > reference,
            Self::LessOrEqual => value <= reference,
            Self::GreaterOrEqual => value >= reference,
        }
    }
}

impl FromStr for Condition {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "==" => Ok(Self::Equal),
            "<" => Ok(Self::Less),
            ">" => Ok(Self::Greater),
            "<=" => Ok(Self::LessOrEqual),
            ">=" => Ok(Self::GreaterOrEqual),
            _ => Err(Error::UnresolvedSelector {
                kind: "condition",
                name: s.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Self::Equal => "==",
            Self::Less => "<",
            Self::Greater => ">",
            Self::LessOrEqual => "<=",
            Self::GreaterOrEqual => ">=",
        };
        f.write_str(symbol)
    }
}

/// Cells whose `metric` satisfies `condition` against `value`, with their metric values.
///
/// Cells for which the metric is undefined are skipped.
pub fn search_cells(
    cells: &[CellCharacterization],
    metric: CellMetric,
    condition: Condition,
    value: f64,
) -> Vec<(String, f64)> {
    cells
        .iter()
        .filter_map(|cell| match metric.value(cell) {
            Ok(v) => Some((cell.id.clone(), v)),
            Err(err) => {
                warn!("Skipping cell in search: {err}");
                None
            }
        })
        .filter(|(_, v)| condition.holds(*v, value))
        .collect()
}

/// Relative standing of a cell within a population.
#[derive(Debug, Clone, PartialEq)]
pub struct CellRanking {
    /// Cell identity.
    pub id: String,
    /// Fill factor of the cell.
    pub fill_factor: f64,
    /// Position by fill factor, 0 is the lowest.
    pub ff_rank: usize,
    /// Position by short-circuit current, 0 is the lowest.
    pub sc_rank: usize,
    /// Position by maximum power, 0 is the lowest.
    pub mpp_rank: usize,
    /// Fill factor scaled linearly so the lowest is 0 and the highest 100.
    pub ff_percentile: f64,
}

/// Outcome of [`rank_cells`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ranking {
    /// Rankings in input order.
    pub cells: Vec<CellRanking>,
    /// Cells that could not be ranked.
    pub excluded: Vec<Error>,
}

fn ranks(values: &[f64]) -> Vec<usize> {
    let mut ranks = vec![0; values.len()];
    for (rank, idx) in (0..values.len())
        .sorted_by(|&a, &b| values[a].total_cmp(&values[b]))
        .enumerate()
    {
        ranks[idx] = rank;
    }
    ranks
}

/// Rank cells by fill factor, short-circuit current and maximum power.
///
/// Equal values are ranked in input order. If all fill factors are equal, every percentile is 100.
pub fn rank_cells(cells: &[CellCharacterization]) -> Ranking {
    let (valid, excluded): (Vec<_>, Vec<_>) = cells
        .iter()
        .map(|cell| cell.fill_factor().map(|ff| (cell, ff)))
        .partition_result();
    for err in &excluded {
        warn!("Excluding cell from ranking: {err}");
    }

    let fill_factors = valid.iter().map(|(_, ff)| *ff).collect_vec();
    let currents = valid.iter().map(|(cell, _)| cell.i_sc).collect_vec();
    let powers = valid.iter().map(|(cell, _)| cell.mpp_power()).collect_vec();
    let (ff_ranks, sc_ranks, mpp_ranks) = (ranks(&fill_factors), ranks(&currents), ranks(&powers));

    let (min, max) = match fill_factors.iter().minmax_by(|a, b| a.total_cmp(b)) {
        MinMaxResult::NoElements => (0., 0.),
        MinMaxResult::OneElement(&x) => (x, x),
        MinMaxResult::MinMax(&min, &max) => (min, max),
    };
    let percentile = |ff: f64| if max > min { (ff - min) / (max - min) * 100. } else { 100. };

    let ranked = valid
        .iter()
        .enumerate()
        .map(|(i, (cell, ff))| CellRanking {
            id: cell.id.clone(),
            fill_factor: *ff,
            ff_rank: ff_ranks[i],
            sc_rank: sc_ranks[i],
            mpp_rank: mpp_ranks[i],
            ff_percentile: percentile(*ff),
        })
        .collect();

    Ranking {
        cells: ranked,
        excluded,
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::parameters::FitParameters;

    fn cell(id: &str, v_oc: f64, i_sc: f64, v_mpp: f64, i_mpp: f64) -> CellCharacterization {
        CellCharacterization {
            id: id.to_owned(),
            parameters: FitParameters::new(1000., 298., 0.02, 20.),
            fit_residual: 0.01,
            v_oc,
            i_sc,
            v_mpp,
            i_mpp,
            curve: Vec::new(),
        }
    }

    fn population() -> Vec<CellCharacterization> {
        vec![
            cell("a", 0.7, 6.0, 0.55, 5.5),
            cell("b", 0.72, 5.8, 0.6, 5.2),
            cell("dark", 0., 0., 0., 0.),
            cell("c", 0.71, 6.1, 0.5, 5.0),
        ]
    }

    #[test]
    fn selector_names() {
        for metric in CellMetric::ALL {
            assert_eq!(metric.to_string().parse(), Ok(metric));
        }
        for symbol in ["==", "<", ">", "<=", ">="] {
            assert_eq!(symbol.parse::<Condition>().unwrap().to_string(), symbol);
        }
        assert_eq!(
            "efficiency".parse::<CellMetric>(),
            Err(Error::UnresolvedSelector {
                kind: "metric",
                name: "efficiency".into()
            })
        );
        assert!(matches!(
            "!=".parse::<Condition>(),
            Err(Error::UnresolvedSelector { kind: "condition", .. })
        ));
    }

    #[test]
    fn search_by_metric() {
        let cells = population();

        let found = search_cells(&cells, CellMetric::OpenCircuitVoltage, Condition::GreaterOrEqual, 0.71);
        assert_eq!(found, vec![("b".to_owned(), 0.72), ("c".to_owned(), 0.71)]);

        let found = search_cells(&cells, CellMetric::Irradiance, Condition::Equal, 1000.);
        assert_eq!(found.len(), 4);

        // the dark cell has no fill factor and is skipped
        let found = search_cells(&cells, CellMetric::FillFactor, Condition::Greater, 0.);
        assert_eq!(found.iter().map(|(id, _)| id.as_str()).collect_vec(), vec!["a", "b", "c"]);
    }

    #[test]
    fn ranking() {
        let ranking = rank_cells(&population());

        assert_eq!(
            ranking.excluded,
            vec![Error::DivideByZero {
                cell: "dark".into(),
                quantity: "v_oc"
            }]
        );
        let ids = ranking.cells.iter().map(|r| r.id.as_str()).collect_vec();
        assert_eq!(ids, vec!["a", "b", "c"]);

        // fill factors: a 0.720, b 0.747, c 0.577
        let ff_ranks = ranking.cells.iter().map(|r| r.ff_rank).collect_vec();
        assert_eq!(ff_ranks, vec![1, 2, 0]);
        let sc_ranks = ranking.cells.iter().map(|r| r.sc_rank).collect_vec();
        assert_eq!(sc_ranks, vec![1, 0, 2]);
        let mpp_ranks = ranking.cells.iter().map(|r| r.mpp_rank).collect_vec();
        assert_eq!(mpp_ranks, vec![1, 2, 0]);

        assert_eq!(ranking.cells[1].ff_percentile, 100.);
        assert_eq!(ranking.cells[2].ff_percentile, 0.);
        let a = &ranking.cells[0];
        assert_abs_diff_eq!(
            a.ff_percentile,
            (a.fill_factor - ranking.cells[2].fill_factor)
                / (ranking.cells[1].fill_factor - ranking.cells[2].fill_factor)
                * 100.,
            epsilon = 1e-9
        );
    }

    #[test]
    fn equal_fill_factors() {
        let cells = vec![cell("a", 0.7, 6., 0.5, 5.), cell("b", 0.7, 6., 0.5, 5.)];
        let ranking = rank_cells(&cells);
        assert!(ranking.cells.iter().all(|r| r.ff_percentile == 100.));
        assert_eq!(ranking.cells[0].ff_rank, 0);
        assert_eq!(ranking.cells[1].ff_rank, 1);
        assert_eq!(rank_cells(&[]), Ranking::default());
    }
}
