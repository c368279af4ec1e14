//! Shared good_lp/HiGHS plumbing for the Phase-1 and Phase-2 models.

use good_lp::solvers::highs::HighsProblem;
use good_lp::{
    Expression, ProblemVariables, ResolutionError, Solution, SolverModel, Variable, constraint, variable,
};
use log::{trace, warn};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::SolverSettings;
use crate::data::Slot;
use crate::error::{Result, SchedulerError};
use crate::params::{Assignment, GroupId, ProblemParams};

/// A round that returns this long before its time limit ran to completion, so its answer is optimal.
pub const FINISH_MARGIN: Duration = Duration::from_millis(500);

/// Placement values above this count as "placed".
const PLACED: f64 = 0.9;

/// Binary `place[g,t]` variables, created only for the slots a group may actually take.
pub struct PlacementVars {
    by_group: BTreeMap<GroupId, Vec<(Slot, Variable)>>,
    /// `table[g * num_slots + t]`
    table: Vec<Option<Variable>>,
    num_slots: usize,
}

impl PlacementVars {
    pub fn new<F>(problem: &mut ProblemVariables, groups: &[GroupId], num_slots: usize, allowed: F) -> Self
    where
        F: Fn(GroupId, Slot) -> bool,
    {
        let mut by_group = BTreeMap::new();
        let num_groups = groups.iter().max().map_or(0, |g| g + 1);
        let mut table = vec![None; num_groups * num_slots];
        let mut count = 0;
        for &g in groups {
            let slots: Vec<(Slot, Variable)> = (0..num_slots)
                .filter(|t| allowed(g, *t))
                .map(|t| (t, problem.add(variable().binary())))
                .collect();
            for &(t, var) in &slots {
                table[g * num_slots + t] = Some(var);
            }
            count += slots.len();
            by_group.insert(g, slots);
        }
        trace!(
            "Generated {} placement variables out of a theoretical maximum of {}.",
            count,
            groups.len() * num_slots
        );
        PlacementVars {
            by_group,
            table,
            num_slots,
        }
    }

    pub fn get(&self, group: GroupId, slot: Slot) -> Option<Variable> {
        if slot >= self.num_slots {
            return None;
        }
        self.table.get(group * self.num_slots + slot).copied().flatten()
    }

    /// Start values placing every group of `assignment` that has a variable for its slot.
    pub fn start_values(&self, assignment: &Assignment) -> Vec<(Variable, f64)> {
        let mut values = Vec::new();
        for (&g, slots) in &self.by_group {
            let chosen = assignment.get(&g);
            for &(t, var) in slots {
                values.push((var, if chosen == Some(&t) { 1.0 } else { 0.0 }));
            }
        }
        values
    }

    pub fn groups(&self) -> impl Iterator<Item = GroupId> + '_ {
        self.by_group.keys().copied()
    }

    /// Sum of the placement variables of `groups` in `slot`.
    pub fn in_slot<'a, I>(&self, groups: I, slot: Slot) -> Expression
    where
        I: IntoIterator<Item = &'a GroupId>,
    {
        let mut sum = Expression::from(0.0);
        for &g in groups {
            if let Some(var) = self.get(g, slot) {
                sum += var;
            }
        }
        sum
    }

    /// Whether any of `groups` can be placed in `slot` at all.
    pub fn any_in_slot<'a, I>(&self, groups: I, slot: Slot) -> bool
    where
        I: IntoIterator<Item = &'a GroupId>,
    {
        groups.into_iter().any(|g| self.get(*g, slot).is_some())
    }

    /// Every group in exactly one of its slots.
    pub fn add_assignment_constraints<M: SolverModel>(&self, model: &mut M) {
        for slots in self.by_group.values() {
            let mut placed = Expression::from(0.0);
            for (_, var) in slots {
                placed += *var;
            }
            model.add_constraint(constraint!(placed == 1));
        }
    }

    /// Total enrollment of each slot stays within `capacity`.
    pub fn add_capacity_constraints<M: SolverModel>(&self, model: &mut M, params: &ProblemParams, capacity: u32) {
        let mut load: BTreeMap<Slot, Expression> = BTreeMap::new();
        for (&g, slots) in &self.by_group {
            let size = params.group_size(g) as f64;
            for (t, var) in slots {
                *load.entry(*t).or_insert_with(|| Expression::from(0.0)) += size * *var;
            }
        }
        let capacity = capacity as f64;
        for (_, slot_load) in load {
            model.add_constraint(constraint!(slot_load <= capacity));
        }
    }

    /// Read the mapping out of a solution. `None` unless every group sits in exactly one slot.
    pub fn extract<S: Solution>(&self, solution: &S) -> Option<Assignment> {
        let mut assignment = Assignment::new();
        for (&g, slots) in &self.by_group {
            let mut placed = slots.iter().filter(|(_, var)| solution.value(*var) > PLACED);
            let (slot, _) = placed.next()?;
            if placed.next().is_some() {
                return None;
            }
            assignment.insert(g, *slot);
        }
        Some(assignment)
    }
}

/// Load capacity of an assignment, for validating extracted incumbents.
pub fn within_capacity(params: &ProblemParams, assignment: &Assignment, capacity: u32) -> bool {
    let mut load: BTreeMap<Slot, u32> = BTreeMap::new();
    for (&g, &t) in assignment {
        *load.entry(t).or_insert(0) += params.group_size(g);
    }
    load.values().all(|l| *l <= capacity)
}

/// Apply the HiGHS options of one solver round.
pub fn configure(
    model: HighsProblem,
    settings: &SolverSettings,
    seed: u64,
    limit: Duration,
    bound: Option<f64>,
) -> HighsProblem {
    let model = model
        .set_option("threads", settings.threads)
        .set_option("random_seed", (seed % i32::MAX as u64) as i32)
        .set_option("log_to_console", if settings.log_to_console { "true" } else { "false" })
        .set_option("mip_rel_gap", settings.mip_rel_gap)
        .set_option("time_limit", limit.as_secs_f64().max(0.001));
    match bound {
        Some(bound) => model.set_option("objective_bound", bound),
        None => model,
    }
}

/// The raw result of running a model once.
pub enum Attempt<S> {
    Infeasible,
    /// Time ran out or HiGHS stopped without a usable solution.
    NoSolution,
    Solved(S),
}

pub fn attempt<M>(model: M, label: &str) -> Result<Attempt<M::Solution>>
where
    M: SolverModel<Error = ResolutionError>,
{
    match model.solve() {
        Ok(solution) => Ok(Attempt::Solved(solution)),
        Err(ResolutionError::Infeasible) => Ok(Attempt::Infeasible),
        Err(ResolutionError::Unbounded) => Err(SchedulerError::Solver(format!("{} model is unbounded", label))),
        Err(e) => {
            warn!("{} round ended without a solution: {}", label, e);
            Ok(Attempt::NoSolution)
        }
    }
}

/// Whether a round returned clearly before its time limit, i.e. HiGHS finished its search.
pub fn finished_early(started: Instant, limit: Duration) -> bool {
    started.elapsed() + FINISH_MARGIN < limit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::grouped_params;
    use good_lp::default_solver;

    #[test]
    fn placement_vars_skip_disallowed_slots() {
        let mut problem = ProblemVariables::new();
        let vars = PlacementVars::new(&mut problem, &[0, 2], 4, |g, t| g == 0 || t == 3);
        assert!(vars.get(0, 1).is_some());
        assert!(vars.get(2, 1).is_none());
        assert!(vars.get(2, 3).is_some());
        assert!(vars.get(1, 3).is_none());
        assert!(vars.get(0, 4).is_none());
        assert!(vars.get(7, 0).is_none());
        assert!(vars.any_in_slot(&[0, 2], 0));
        assert!(!vars.any_in_slot(&[2], 0));
        assert_eq!(vars.groups().collect::<Vec<_>>(), vec![0, 2]);

        let start = vars.start_values(&Assignment::from([(0, 1), (2, 3)]));
        assert_eq!(start.len(), 5);
        assert_eq!(start.iter().filter(|(_, value)| *value == 1.0).count(), 2);
        assert!(start.contains(&(vars.get(0, 1).unwrap(), 1.0)));
        assert!(start.contains(&(vars.get(2, 3).unwrap(), 1.0)));
    }

    #[test]
    fn tiny_model_round_trip() {
        let params = grouped_params(2, &[&[0, 1], &[0, 1]]);
        let mut problem = ProblemVariables::new();
        let vars = PlacementVars::new(&mut problem, &[0, 1], 2, |_, _| true);
        // reward group 0 in slot 1
        let objective = Expression::from(0.0) - vars.get(0, 1).unwrap();
        let mut model = configure(
            problem.minimise(objective).using(default_solver),
            &SolverSettings::default(),
            1,
            Duration::from_secs(10),
            None,
        );
        vars.add_assignment_constraints(&mut model);
        vars.add_capacity_constraints(&mut model, &params, 2);
        let Attempt::Solved(solution) = attempt(model, "test").unwrap() else {
            panic!("expected a solution");
        };
        let assignment = vars.extract(&solution).unwrap();
        // both groups hold two students, so they cannot share a slot of capacity 2
        assert_eq!(assignment, Assignment::from([(0, 1), (1, 0)]));
        assert!(within_capacity(&params, &assignment, 2));
        assert!(!within_capacity(&params, &Assignment::from([(0, 0), (1, 0)]), 3));
    }

    #[test]
    fn infeasible_capacity_is_reported() {
        let params = grouped_params(2, &[&[0, 1], &[0, 1]]);
        let mut problem = ProblemVariables::new();
        let vars = PlacementVars::new(&mut problem, &[0, 1], 1, |_, _| true);
        let objective = Expression::from(0.0) + vars.get(0, 0).unwrap();
        let mut model = configure(
            problem.minimise(objective).using(default_solver),
            &SolverSettings::default(),
            1,
            Duration::from_secs(10),
            None,
        );
        vars.add_assignment_constraints(&mut model);
        vars.add_capacity_constraints(&mut model, &params, 3);
        assert!(matches!(attempt(model, "test").unwrap(), Attempt::Infeasible));
    }
}
