//! Disjoint matching of cells into series strings.

use std::collections::HashMap;

use itertools::Itertools;
use log::{debug, info};

use crate::error::{Error, Result};
use crate::model::{CellModel, NonidealCell, OperatingConditions};
use crate::search::{
    MatchCell, Optimizer, SEARCH_RESOLUTION, Solution, SumConstraint, generate_search_space, solve_search_space,
};

const DEFAULT_MATCH_SIZE: usize = 2;

/// A group of cells selected to operate in series.
#[derive(Debug, Clone, PartialEq)]
pub struct Match {
    /// Ids of the member cells.
    pub cell_ids: Vec<String>,
    /// Operating voltage of each cell, ordered like `cell_ids`.
    pub voltages: Vec<f64>,
    /// Shared string current.
    pub current: f64,
    /// Value of the optimizer objective.
    pub metric: f64,
}

/// A candidate group before selection: member indices into the cell list and its solution.
#[derive(Debug, Clone)]
struct Candidate {
    members: Vec<usize>,
    solution: Solution,
}

/// Builder and entry point for matching.
///
/// Use `with_` functions to set parameters.
#[derive(Debug, Clone)]
pub struct Matcher<M = NonidealCell> {
    model: M,
    conditions: OperatingConditions,
    match_size: usize,
    max_matches: Option<usize>,
    optimizer: Optimizer,
    resolution: f64,
    sum_constraint: SumConstraint,
}

impl Default for Matcher {
    fn default() -> Self {
        Self::new(NonidealCell::default())
    }
}

impl<M: CellModel> Matcher<M> {
    /// Match cells evaluated with `model` under standard test conditions.
    pub fn new(model: M) -> Self {
        Self {
            model,
            conditions: OperatingConditions::STC,
            match_size: DEFAULT_MATCH_SIZE,
            max_matches: None,
            optimizer: Optimizer::default(),
            resolution: SEARCH_RESOLUTION,
            sum_constraint: SumConstraint::default(),
        }
    }

    /// Set the number of cells per match.
    pub fn with_match_size(mut self, match_size: usize) -> Self {
        self.match_size = match_size;
        self
    }

    /// Stop after this many matches.
    pub fn with_max_matches(mut self, max_matches: usize) -> Self {
        self.max_matches = Some(max_matches);
        self
    }

    /// Set the objective used to rank operating points and matches.
    pub fn with_optimizer(mut self, optimizer: Optimizer) -> Self {
        self.optimizer = optimizer;
        self
    }

    /// Set the voltage grid spacing of the operating point search.
    pub fn with_resolution(mut self, resolution: f64) -> Self {
        self.resolution = resolution;
        self
    }

    /// Set the restriction on the summed string voltage.
    pub fn with_sum_constraint(mut self, constraint: SumConstraint) -> Self {
        self.sum_constraint = constraint;
        self
    }

    /// Set the conditions currents are evaluated under.
    pub fn with_conditions(mut self, conditions: OperatingConditions) -> Self {
        self.conditions = conditions;
        self
    }

    /// The objective in use.
    pub fn optimizer(&self) -> Optimizer {
        self.optimizer
    }

    /// The maximum number of matches, if any.
    pub fn max_matches(&self) -> Option<usize> {
        self.max_matches
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.match_size == 0 {
            return Err(Error::invalid_config("match size must be at least 1"));
        }
        if self.max_matches == Some(0) {
            return Err(Error::invalid_config("max matches must be at least 1"));
        }
        if !(self.resolution > 0.) {
            return Err(Error::invalid_config(format!(
                "search resolution must be positive, got {}",
                self.resolution
            )));
        }
        Ok(())
    }

    /// Matches are disjoint by cell id, so every id may appear only once.
    fn check_ids(cells: &[MatchCell]) -> Result<()> {
        match cells.iter().map(|c| c.id.as_str()).duplicates().next() {
            Some(id) => Err(Error::invalid_config(format!("cell id '{id}' appears more than once"))),
            None => Ok(()),
        }
    }

    /// Best operating point of a single group.
    ///
    /// # Returns
    /// `None` if no voltage combination satisfies the sum constraint.
    pub fn solve(&self, cells: &[&MatchCell]) -> Result<Option<Solution>> {
        let space = generate_search_space(cells, self.sum_constraint, self.resolution)?;
        Ok(solve_search_space(
            &self.model,
            self.conditions,
            cells,
            &space,
            self.optimizer,
        ))
    }

    fn candidate(&self, cells: &[MatchCell], members: Vec<usize>) -> Result<Option<Candidate>> {
        let group = members.iter().map(|&i| &cells[i]).collect_vec();
        Ok(self
            .solve(&group)?
            .map(|solution| Candidate { members, solution }))
    }

    /// Sort candidates best first. Equal metrics keep their enumeration order.
    fn rank(&self, candidates: &mut [Candidate]) {
        candidates.sort_by(|a, b| self.optimizer.compare(a.solution.metric, b.solution.metric));
    }

    /// Greedily take the best remaining candidate and drop all candidates sharing a cell with it.
    fn select(&self, cells: &[MatchCell], candidates: Vec<Candidate>) -> Vec<Match> {
        let mut by_cell: HashMap<usize, Vec<usize>> = HashMap::new();
        for (idx, candidate) in candidates.iter().enumerate() {
            for &member in &candidate.members {
                by_cell.entry(member).or_default().push(idx);
            }
        }

        let limit = self.max_matches.unwrap_or(usize::MAX);
        let mut alive = vec![true; candidates.len()];
        let mut matches = Vec::new();

        for (idx, candidate) in candidates.into_iter().enumerate() {
            if matches.len() >= limit {
                break;
            }
            if !alive[idx] {
                continue;
            }
            for member in &candidate.members {
                for &conflict in by_cell.get(member).into_iter().flatten() {
                    alive[conflict] = false;
                }
            }

            let Candidate { members, solution } = candidate;
            debug!("Selected cells {members:?} with metric {}.", solution.metric);
            matches.push(Match {
                cell_ids: members.iter().map(|&i| cells[i].id.clone()).collect(),
                voltages: solution.voltages,
                current: solution.current,
                metric: solution.metric,
            });
        }

        matches
    }

    /// Find disjoint matches in a group of cells.
    ///
    /// Every combination of `match_size` cells is solved, and matches are then taken greedily in
    /// order of their metric so that no cell is used twice.
    ///
    /// # Returns
    /// Matches ordered best first. Empty if the group is smaller than the match size.
    /// Fails if a cell id occurs twice.
    pub fn generate_matches(&self, cells: &[MatchCell]) -> Result<Vec<Match>> {
        self.validate()?;
        Self::check_ids(cells)?;

        let mut candidates = Vec::new();
        for members in (0..cells.len()).combinations(self.match_size) {
            if let Some(candidate) = self.candidate(cells, members)? {
                candidates.push(candidate);
            }
        }
        info!("Solved {} candidate groups of {} cells.", candidates.len(), cells.len());

        self.rank(&mut candidates);
        Ok(self.select(cells, candidates))
    }
}

#[cfg(feature = "parallel")]
mod parallel {
    use rayon::prelude::*;

    use super::*;

    impl<M: CellModel + Sync> Matcher<M> {
        /// Find disjoint matches in a group of cells, solving candidate groups in parallel.
        ///
        /// Also see [`generate_matches`](Matcher::generate_matches()) for more details.
        /// The output is identical to the sequential version.
        pub fn generate_matches_par(&self, cells: &[MatchCell]) -> Result<Vec<Match>> {
            self.validate()?;
            Self::check_ids(cells)?;

            let groups = (0..cells.len()).combinations(self.match_size).collect_vec();
            let solved = groups
                .into_par_iter()
                .map(|members| self.candidate(cells, members))
                .collect::<Result<Vec<_>>>()?;
            let mut candidates = solved.into_iter().flatten().collect_vec();
            info!("Solved {} candidate groups of {} cells.", candidates.len(), cells.len());

            self.rank(&mut candidates);
            Ok(self.select(cells, candidates))
        }
    }
}
