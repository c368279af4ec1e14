//! Phase 1: place the `k` most constrained and most popular groups, minimizing the pairwise student penalties
//! (overlap, back-to-back, night-to-morning) between them.

use good_lp::{Expression, ProblemVariables, Variable, WithInitialSolution, SolverModel, constraint, default_solver, variable};
use itertools::Itertools;
use log::{debug, info};
use std::cmp::Reverse;
use std::time::{Duration, Instant};

use crate::anytime::{Incumbent, RoundOutcome};
use crate::config::SolverSettings;
use crate::constraints::Placement;
use crate::data::PenaltyProfile;
use crate::error::Result;
use crate::params::{Assignment, GroupId, ProblemParams};
use crate::solver::{self, Attempt, PlacementVars};

/// The groups Phase 1 optimizes: constrained groups first, then the largest groups (ties in first-seen order) until
/// `k` groups are retained. Constrained groups are always retained, even beyond `k`.
pub fn select_groups(params: &ProblemParams, placement: &Placement, k: usize) -> Vec<GroupId> {
    let mut selected = placement.constrained_groups();
    let mut by_size: Vec<GroupId> = params.groups().collect();
    by_size.sort_by_key(|g| Reverse(params.group_size(*g)));
    for g in by_size {
        if selected.len() >= k {
            break;
        }
        if !selected.contains(&g) {
            selected.push(g);
        }
    }
    selected
}

/// Pairs of `groups` sharing a student or a faculty member.
pub fn relevant_pairs(params: &ProblemParams, groups: &[GroupId]) -> Vec<(GroupId, GroupId)> {
    groups
        .iter()
        .copied()
        .tuple_combinations()
        .filter(|(g1, g2)| params.is_relevant_pair(*g1, *g2))
        .collect()
}

/// The Phase-1 objective of an integral (possibly partial) assignment.
pub fn pairwise_cost(params: &ProblemParams, penalties: &PenaltyProfile, assignment: &Assignment) -> f64 {
    let calendar = &params.calendar;
    let mut cost = 0.0;
    for (&g1, &t1) in assignment {
        for (g2, shared) in params.student_neighbors(g1) {
            if g2 <= g1 {
                continue;
            }
            let Some(&t2) = assignment.get(&g2) else { continue };
            let shared = shared as f64;
            if t1 == t2 {
                cost += penalties.overlap * shared;
            } else if t1.abs_diff(t2) == 1 {
                let weight = if calendar.is_night(t1.min(t2)) {
                    penalties.night_to_morning
                } else {
                    penalties.back_to_back
                };
                cost += weight * shared;
            }
        }
    }
    cost
}

pub struct Phase1Model<'a> {
    params: &'a ProblemParams,
    penalties: &'a PenaltyProfile,
    placement: &'a Placement,
    settings: &'a SolverSettings,
    seed: u64,
    capacity: u32,
    groups: Vec<GroupId>,
    pairs: Vec<(GroupId, GroupId)>,
}

impl<'a> Phase1Model<'a> {
    pub fn new(
        params: &'a ProblemParams,
        penalties: &'a PenaltyProfile,
        placement: &'a Placement,
        settings: &'a SolverSettings,
        seed: u64,
        k: usize,
        capacity: u32,
    ) -> Self {
        let groups = select_groups(params, placement, k);
        let pairs = relevant_pairs(params, &groups);
        debug!(
            "Phase 1 with k={}: {} groups, {} relevant pairs",
            k,
            groups.len(),
            pairs.len()
        );
        Phase1Model {
            params,
            penalties,
            placement,
            settings,
            seed,
            capacity,
            groups,
            pairs,
        }
    }

    pub fn groups(&self) -> &[GroupId] {
        &self.groups
    }

    pub fn pairs(&self) -> &[(GroupId, GroupId)] {
        &self.pairs
    }

    /// Build the model and run HiGHS once for at most `limit`, optionally only accepting solutions below `bound`.
    pub fn solve_round(&self, limit: Duration, bound: Option<f64>) -> Result<RoundOutcome> {
        self.round(limit, bound, None)
    }

    /// Run HiGHS once with `start` as its initial solution.
    pub fn solve_round_from(&self, limit: Duration, start: &Assignment) -> Result<RoundOutcome> {
        self.round(limit, None, Some(start))
    }

    /// Start values of the placement and badness variables for `start`.
    fn start_values(&self, place: &PlacementVars, bad: &[[Variable; 3]], start: &Assignment) -> Vec<(Variable, f64)> {
        let calendar = &self.params.calendar;
        let mut values = place.start_values(start);
        for (&(g1, g2), &[overlap, b2b, n2m]) in self.pairs.iter().zip(bad) {
            let (Some(&t1), Some(&t2)) = (start.get(&g1), start.get(&g2)) else {
                continue;
            };
            let adjacent = t1.abs_diff(t2) == 1;
            let night = calendar.is_night(t1.min(t2));
            values.push((overlap, if t1 == t2 { 1.0 } else { 0.0 }));
            values.push((b2b, if adjacent && !night { 1.0 } else { 0.0 }));
            values.push((n2m, if adjacent && night { 1.0 } else { 0.0 }));
        }
        values
    }

    fn round(&self, limit: Duration, bound: Option<f64>, start: Option<&Assignment>) -> Result<RoundOutcome> {
        let calendar = &self.params.calendar;
        let mut problem = ProblemVariables::new();

        // x_gt = 1 if group g is in slot t
        let place = PlacementVars::new(&mut problem, &self.groups, calendar.num_slots(), |g, t| {
            self.placement.allows(calendar, g, t)
        });
        // badness per relevant pair: overlap, back-to-back, night-to-morning
        let bad: Vec<[Variable; 3]> = self
            .pairs
            .iter()
            .map(|_| {
                [
                    problem.add(variable().min(0.0)),
                    problem.add(variable().min(0.0)),
                    problem.add(variable().min(0.0)),
                ]
            })
            .collect();

        let mut objective = Expression::from(0.0);
        for (&(g1, g2), [overlap, b2b, n2m]) in self.pairs.iter().zip(&bad) {
            let shared = self.params.shared_students(g1, g2) as f64;
            objective += (self.penalties.overlap * shared) * *overlap;
            objective += (self.penalties.back_to_back * shared) * *b2b;
            objective += (self.penalties.night_to_morning * shared) * *n2m;
        }

        let mut model = solver::configure(
            problem.minimise(objective).using(default_solver),
            self.settings,
            self.seed,
            limit,
            bound,
        );
        if let Some(start) = start {
            model = model.with_initial_solution(self.start_values(&place, &bad, start));
        }
        place.add_assignment_constraints(&mut model);
        place.add_capacity_constraints(&mut model, self.params, self.capacity);

        for (&(g1, g2), &[overlap, b2b, n2m]) in self.pairs.iter().zip(&bad) {
            for t in calendar.available_slots() {
                if let (Some(x1), Some(x2)) = (place.get(g1, t), place.get(g2, t)) {
                    model.add_constraint(constraint!(x1 + x2 <= 1 + overlap));
                }
                if !calendar.is_available(t + 1) {
                    continue;
                }
                let adjacent = if calendar.is_night(t) { n2m } else { b2b };
                if let (Some(x1), Some(x2)) = (place.get(g1, t), place.get(g2, t + 1)) {
                    model.add_constraint(constraint!(x1 + x2 <= 1 + adjacent));
                }
                if let (Some(x2), Some(x1)) = (place.get(g2, t), place.get(g1, t + 1)) {
                    model.add_constraint(constraint!(x2 + x1 <= 1 + adjacent));
                }
            }
        }

        info!(
            "Starting Phase 1 round with {} groups, limit {:.1?}{}{}",
            self.groups.len(),
            limit,
            bound.map(|b| format!(", cutoff {:.4}", b)).unwrap_or_default(),
            if start.is_some() { ", from a start mapping" } else { "" }
        );
        let started = Instant::now();
        let solution = match solver::attempt(model, "Phase 1")? {
            Attempt::Infeasible => return Ok(RoundOutcome::Infeasible),
            Attempt::NoSolution => return Ok(RoundOutcome::NoIncumbent),
            Attempt::Solved(solution) => solution,
        };
        let proven_optimal = solver::finished_early(started, limit);

        let Some(assignment) = place.extract(&solution) else {
            debug!("Phase 1 round returned an incomplete mapping");
            return Ok(RoundOutcome::NoIncumbent);
        };
        if !solver::within_capacity(self.params, &assignment, self.capacity) {
            debug!("Phase 1 round returned a mapping over capacity");
            return Ok(RoundOutcome::NoIncumbent);
        }
        let objective = pairwise_cost(self.params, self.penalties, &assignment);
        info!("Phase 1 round found objective {:.4} in {:.2?}", objective, started.elapsed());
        Ok(RoundOutcome::Incumbent(Incumbent {
            objective,
            assignment,
            tally: None,
            proven_optimal,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GroupPolicies, PlacementConstraints};
    use crate::testing::grouped_params;
    use assert_float_eq::*;

    #[test]
    fn selects_constrained_then_largest_groups() {
        // sizes: G0 1, G1 3, G2 2, G3 3, G4 1
        let params = grouped_params(5, &[&[0, 1, 2, 3], &[1, 2, 3], &[1, 3], &[4]]);
        let placement = Placement::resolve(
            &PlacementConstraints {
                forbidden: [("G4".to_string(), vec![0])].into(),
                ..Default::default()
            },
            &GroupPolicies::default(),
            &params,
        )
        .unwrap();

        assert_eq!(select_groups(&params, &placement, 3), vec![4, 1, 3]);
        assert_eq!(select_groups(&params, &placement, 4), vec![4, 1, 3, 2]);
        assert_eq!(select_groups(&params, &placement, 10).len(), 5);
        assert_eq!(select_groups(&params, &placement, 0), vec![4]);
    }

    #[test]
    fn relevant_pairs_share_students_or_faculty() {
        let params = grouped_params(4, &[&[0, 1], &[1, 2]]);
        assert_eq!(relevant_pairs(&params, &[0, 1, 2, 3]), vec![(0, 1), (1, 2)]);
        assert_eq!(relevant_pairs(&params, &[2, 1]), vec![(2, 1)]);
    }

    #[test]
    fn pairwise_cost_weights_each_pair_once() {
        let params = grouped_params(4, &[&[0, 1], &[0, 1], &[1, 2], &[2, 3]]);
        let penalties = PenaltyProfile::default();
        // 0 and 1 overlap (2 students), 1 and 2 back-to-back, 2 and 3 night-to-morning
        let assignment: Assignment = [(0, 2), (1, 2), (2, 3), (3, 4)].into();
        assert_float_absolute_eq!(
            pairwise_cost(&params, &penalties, &assignment),
            2.0 * 1.0 + 0.02 + 0.04,
            1e-12
        );
        let partial: Assignment = [(0, 2), (3, 4)].into();
        assert_eq!(pairwise_cost(&params, &penalties, &partial), 0.0);
    }

    #[test]
    fn solves_small_instance_to_optimality() {
        let params = grouped_params(4, &[&[0, 1, 2], &[1, 2, 3], &[0, 3]]);
        let placement = Placement::default();
        let penalties = PenaltyProfile::default();
        let settings = SolverSettings::default();
        let model = Phase1Model::new(&params, &penalties, &placement, &settings, 1, 4, 1000);
        assert_eq!(model.groups().len(), 4);
        assert_eq!(model.pairs().len(), 6);

        let RoundOutcome::Incumbent(incumbent) = model.solve_round(Duration::from_secs(60), None).unwrap() else {
            panic!("expected an incumbent");
        };
        assert_eq!(incumbent.assignment.len(), 4);
        assert_float_absolute_eq!(incumbent.objective, 0.0, 1e-9);
        assert!(incumbent.proven_optimal);
        assert!(incumbent.assignment.values().all(|t| params.calendar.is_available(*t)));
    }

    #[test]
    fn improves_on_a_start_mapping() {
        let params = grouped_params(4, &[&[0, 1, 2], &[1, 2, 3], &[0, 3]]);
        let placement = Placement::default();
        let penalties = PenaltyProfile::default();
        let settings = SolverSettings::default();
        let model = Phase1Model::new(&params, &penalties, &placement, &settings, 1, 4, 1000);

        // everything crammed into two adjacent slots
        let start: Assignment = [(0, 0), (1, 0), (2, 1), (3, 1)].into();
        assert!(pairwise_cost(&params, &penalties, &start) > 1.0);
        let RoundOutcome::Incumbent(incumbent) = model.solve_round_from(Duration::from_secs(60), &start).unwrap() else {
            panic!("expected an incumbent");
        };
        assert_eq!(incumbent.assignment.len(), 4);
        assert_float_absolute_eq!(incumbent.objective, 0.0, 1e-9);
    }

    #[test]
    fn unavoidable_overlap_is_paid() {
        let params = grouped_params(2, &[&[0, 1]]);
        let placement = Placement::resolve(
            &PlacementConstraints {
                fixed: [("G0".to_string(), 0), ("G1".to_string(), 0)].into(),
                ..Default::default()
            },
            &GroupPolicies::default(),
            &params,
        )
        .unwrap();
        let penalties = PenaltyProfile::default();
        let settings = SolverSettings::default();
        let model = Phase1Model::new(&params, &penalties, &placement, &settings, 1, 2, 1000);

        let RoundOutcome::Incumbent(incumbent) = model.solve_round(Duration::from_secs(60), None).unwrap() else {
            panic!("expected an incumbent");
        };
        assert_float_absolute_eq!(incumbent.objective, 1.0, 1e-9);

        // the same instance cannot fit two groups into a slot of capacity 1
        let tight = Phase1Model::new(&params, &penalties, &placement, &settings, 1, 2, 1);
        assert_eq!(
            tight.solve_round(Duration::from_secs(60), None).unwrap(),
            RoundOutcome::Infeasible
        );
    }
}
