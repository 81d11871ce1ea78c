use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::formula::{Atom, FormulaArena, FormulaId};

/// Outcome of a satisfiability query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SatResult {
    Satisfiable,
    Unsatisfiable,
    /// The iteration budget ran out before a definite answer.
    Unknown,
}

/// Outcome of a proof query.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProveResult {
    Yes,
    No,
    Unknown,
}

/// Bounded satisfiability solver.
///
/// Splits on atoms with partial evaluation between splits. Every candidate
/// assignment counts against the iteration budget; once the budget is
/// exhausted the solver answers `Unknown` and latches `reached_limit`, which
/// callers surface as a structured analysis failure.
#[derive(Clone, Debug)]
pub struct Solver {
    max_iterations: u64,
    iterations: u64,
    reached_limit: bool,
}

impl Solver {
    pub fn new(max_iterations: u64) -> Self {
        Self {
            max_iterations,
            iterations: 0,
            reached_limit: false,
        }
    }

    /// Sticky flag set once the budget has been exhausted.
    pub fn reached_limit(&self) -> bool {
        self.reached_limit
    }

    pub fn satisfiable(&mut self, arena: &FormulaArena, f: FormulaId) -> SatResult {
        let mut atoms = BTreeSet::new();
        arena.atoms_of(f, &mut atoms);
        let atoms: Vec<Atom> = atoms.into_iter().collect();
        let mut assignment = BTreeMap::new();
        match self.split(arena, f, &atoms, &mut assignment) {
            Some(true) => SatResult::Satisfiable,
            Some(false) => SatResult::Unsatisfiable,
            None => SatResult::Unknown,
        }
    }

    /// Proves validity of `f`: `Yes` when `¬f` is unsatisfiable, `No` when
    /// `f` itself is, `Unknown` otherwise (including budget exhaustion).
    pub fn prove(&mut self, arena: &mut FormulaArena, f: FormulaId) -> ProveResult {
        let negated = arena.not(f);
        match self.satisfiable(arena, negated) {
            SatResult::Unsatisfiable => ProveResult::Yes,
            SatResult::Unknown => ProveResult::Unknown,
            SatResult::Satisfiable => match self.satisfiable(arena, f) {
                SatResult::Unsatisfiable => ProveResult::No,
                _ => ProveResult::Unknown,
            },
        }
    }

    fn split(
        &mut self,
        arena: &FormulaArena,
        f: FormulaId,
        atoms: &[Atom],
        assignment: &mut BTreeMap<Atom, bool>,
    ) -> Option<bool> {
        if self.iterations >= self.max_iterations {
            if !self.reached_limit {
                debug!(max_iterations = self.max_iterations, "solver budget exhausted");
            }
            self.reached_limit = true;
            return None;
        }
        self.iterations += 1;

        match arena.eval(f, assignment) {
            Some(value) => return Some(value),
            None => {}
        }
        let Some(next) = atoms.iter().find(|a| !assignment.contains_key(*a)) else {
            // All atoms assigned but evaluation undetermined: unreachable by
            // construction of `eval`, treated as unsatisfiable branch.
            return Some(false);
        };

        assignment.insert(*next, true);
        match self.split(arena, f, atoms, assignment) {
            Some(true) => {
                assignment.remove(next);
                return Some(true);
            }
            Some(false) => {}
            None => {
                assignment.remove(next);
                return None;
            }
        }
        assignment.insert(*next, false);
        let low = self.split(arena, f, atoms, assignment);
        assignment.remove(next);
        low
    }
}
