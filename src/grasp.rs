//! Greedy randomized construction of Phase-1 timetables.
//!
//! A run places the fixed groups, puts the largest remaining group into a random slot and then repeatedly commits
//! a random (group, slot) pair, favouring cheap pairs: zero-cost pairs are drawn uniformly, otherwise each finite
//! pair is drawn with weight `1 / (cost + smoothing)`. Restarts continue until the time budget is spent.

use log::debug;
use rand::Rng;
use rand::distributions::{Distribution, WeightedIndex};
use std::time::{Duration, Instant};

use crate::anytime::Incumbent;
use crate::constraints::Placement;
use crate::data::{PenaltyProfile, Slot};
use crate::error::{Result, SchedulerError};
use crate::params::{Assignment, GroupId, ProblemParams};
use crate::phase1::pairwise_cost;

#[derive(Debug, Clone, PartialEq)]
pub struct GraspSolution {
    pub assignment: Assignment,
    pub cost: f64,
}

impl From<GraspSolution> for Incumbent {
    fn from(solution: GraspSolution) -> Self {
        Incumbent {
            objective: solution.cost,
            assignment: solution.assignment,
            tally: None,
            proven_optimal: false,
        }
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    group: GroupId,
    slot: Slot,
    cost: f64,
}

/// Groups and load per slot of a partially built timetable.
struct PartialSchedule {
    by_slot: Vec<Vec<GroupId>>,
    load: Vec<u32>,
    assignment: Assignment,
}

impl PartialSchedule {
    fn new(num_slots: usize) -> Self {
        PartialSchedule {
            by_slot: vec![Vec::new(); num_slots],
            load: vec![0; num_slots],
            assignment: Assignment::new(),
        }
    }

    fn place(&mut self, group: GroupId, slot: Slot, size: u32) {
        self.by_slot[slot].push(group);
        self.load[slot] += size;
        self.assignment.insert(group, slot);
    }
}

pub struct GraspProblem<'a> {
    params: &'a ProblemParams,
    penalties: &'a PenaltyProfile,
    placement: &'a Placement,
    groups: Vec<GroupId>,
    capacity: u32,
    smoothing: f64,
}

impl<'a> GraspProblem<'a> {
    pub fn new(
        params: &'a ProblemParams,
        penalties: &'a PenaltyProfile,
        placement: &'a Placement,
        groups: &[GroupId],
        capacity: u32,
        smoothing: f64,
    ) -> Self {
        GraspProblem {
            params,
            penalties,
            placement,
            groups: groups.to_vec(),
            capacity,
            smoothing,
        }
    }

    /// Restart [`Self::construct`] until `budget` has elapsed (at least once) and keep the cheapest timetable.
    pub fn run<R: Rng + ?Sized>(&self, rng: &mut R, budget: Duration) -> Result<GraspSolution> {
        let start = Instant::now();
        let mut best = self.construct(rng)?;
        let mut runs = 1;
        while start.elapsed() < budget {
            let candidate = self.construct(rng)?;
            runs += 1;
            if candidate.cost < best.cost {
                debug!(
                    "GRASP improved from {:.4} to {:.4} after {:.2?}",
                    best.cost,
                    candidate.cost,
                    start.elapsed()
                );
                best = candidate;
            }
        }
        debug!("GRASP finished {} runs, best cost {:.4}", runs, best.cost);
        Ok(best)
    }

    /// Build one complete timetable for the retained groups.
    pub fn construct<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<GraspSolution> {
        let calendar = &self.params.calendar;
        let mut schedule = PartialSchedule::new(calendar.num_slots());
        let mut unplaced = Vec::with_capacity(self.groups.len());
        for &g in &self.groups {
            match self.placement.fixed_slot(g) {
                Some(slot) => schedule.place(g, slot, self.params.group_size(g)),
                None => unplaced.push(g),
            }
        }
        // pairs among fixed groups are paid up front
        let mut total = pairwise_cost(self.params, self.penalties, &schedule.assignment);

        let mut candidates: Vec<Candidate> = unplaced
            .iter()
            .flat_map(|&g| {
                self.placement
                    .allowed_slots(calendar, g)
                    .map(move |slot| Candidate { group: g, slot, cost: 0.0 })
            })
            .collect();
        for candidate in candidates.iter_mut() {
            candidate.cost = self.cost(&schedule, candidate.group, candidate.slot);
        }

        // largest group first, uniformly among its feasible slots
        let mut largest: Option<GroupId> = None;
        for &g in &unplaced {
            if largest.is_none_or(|l| self.params.group_size(g) > self.params.group_size(l)) {
                largest = Some(g);
            }
        }
        if let Some(largest) = largest {
            let options: Vec<usize> = (0..candidates.len())
                .filter(|i| candidates[*i].group == largest && candidates[*i].cost.is_finite())
                .collect();
            if options.is_empty() {
                return Err(self.exhausted(largest));
            }
            let chosen = options[rng.gen_range(0..options.len())];
            total += self.commit(&mut candidates, chosen, &mut schedule);
        }

        while let Some(first) = candidates.first() {
            let group = first.group;
            let chosen = self.choose(&candidates, rng).ok_or_else(|| self.exhausted(group))?;
            total += self.commit(&mut candidates, chosen, &mut schedule);
        }

        // groups whose every candidate was dropped never got placed
        if let Some(&g) = unplaced.iter().find(|g| !schedule.assignment.contains_key(g)) {
            return Err(self.exhausted(g));
        }

        Ok(GraspSolution {
            assignment: schedule.assignment,
            cost: total,
        })
    }

    fn exhausted(&self, group: GroupId) -> SchedulerError {
        SchedulerError::GraspExhausted(self.params.group_name(group).to_string())
    }

    /// Place the chosen candidate, drop the group's other candidates and re-cost the neighbouring ones.
    fn commit(&self, candidates: &mut Vec<Candidate>, chosen: usize, schedule: &mut PartialSchedule) -> f64 {
        let placed = candidates[chosen].clone();
        schedule.place(placed.group, placed.slot, self.params.group_size(placed.group));
        candidates.retain(|c| c.group != placed.group);
        for candidate in candidates.iter_mut() {
            if candidate.slot.abs_diff(placed.slot) <= 1 {
                candidate.cost = self.cost(schedule, candidate.group, candidate.slot);
            }
        }
        placed.cost
    }

    fn choose<R: Rng + ?Sized>(&self, candidates: &[Candidate], rng: &mut R) -> Option<usize> {
        let free: Vec<usize> = (0..candidates.len()).filter(|i| candidates[*i].cost == 0.0).collect();
        if !free.is_empty() {
            return Some(free[rng.gen_range(0..free.len())]);
        }
        let finite: Vec<usize> = (0..candidates.len())
            .filter(|i| candidates[*i].cost.is_finite())
            .collect();
        if finite.is_empty() {
            return None;
        }
        let weights = finite.iter().map(|i| 1.0 / (candidates[*i].cost + self.smoothing));
        let dist = WeightedIndex::new(weights).ok()?;
        Some(finite[dist.sample(rng)])
    }

    /// Penalty added by placing `group` into `slot` given the current partial schedule.
    fn cost(&self, schedule: &PartialSchedule, group: GroupId, slot: Slot) -> f64 {
        if schedule.load[slot] + self.params.group_size(group) > self.capacity {
            return f64::INFINITY;
        }
        let calendar = &self.params.calendar;
        let shared = |t: Slot| -> f64 {
            schedule.by_slot[t]
                .iter()
                .map(|other| self.params.shared_students(group, *other) as f64)
                .sum()
        };
        let adjacency = |first: Slot| {
            if calendar.is_night(first) {
                self.penalties.night_to_morning
            } else {
                self.penalties.back_to_back
            }
        };

        let mut cost = self.penalties.overlap * shared(slot);
        if slot + 1 < schedule.by_slot.len() {
            cost += adjacency(slot) * shared(slot + 1);
        }
        if slot > 0 {
            cost += adjacency(slot - 1) * shared(slot - 1);
        }
        cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{GroupPolicies, PlacementConstraints};
    use crate::testing::grouped_params;
    use assert_float_eq::*;
    use rand::SeedableRng;
    use rand::rngs::SmallRng;

    fn resolve(params: &ProblemParams, constraints: PlacementConstraints) -> Placement {
        Placement::resolve(&constraints, &GroupPolicies::default(), params).unwrap()
    }

    #[test]
    fn cost_matches_pairwise_cost() {
        let params = grouped_params(
            6,
            &[&[0, 1, 2], &[1, 2, 3], &[3, 4], &[4, 5, 0], &[0, 2, 4], &[1, 5]],
        );
        let placement = resolve(
            &params,
            PlacementConstraints {
                fixed: [("G0".to_string(), 0), ("G3".to_string(), 1)].into(),
                ..Default::default()
            },
        );
        let penalties = PenaltyProfile::default();
        let groups: Vec<GroupId> = params.groups().collect();
        let grasp = GraspProblem::new(&params, &penalties, &placement, &groups, 1000, 0.0);

        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..20 {
            let solution = grasp.construct(&mut rng).unwrap();
            assert_eq!(solution.assignment.len(), 6);
            assert_eq!(solution.assignment[&0], 0);
            assert_eq!(solution.assignment[&3], 1);
            assert_float_absolute_eq!(
                solution.cost,
                pairwise_cost(&params, &penalties, &solution.assignment),
                1e-9
            );
        }
    }

    #[test]
    fn respects_forbidden_slots_and_capacity() {
        // every group has 2 students, capacity 4 allows at most two groups per slot
        let params = grouped_params(4, &[&[0, 1, 2, 3], &[0, 1, 2, 3]]);
        let forbidden_slots: Vec<Slot> = (0..20).filter(|t| *t != 5 && *t != 9).collect();
        let placement = resolve(
            &params,
            PlacementConstraints {
                forbidden: [("G2".to_string(), forbidden_slots)].into(),
                ..Default::default()
            },
        );
        let penalties = PenaltyProfile::default();
        let groups: Vec<GroupId> = params.groups().collect();
        let grasp = GraspProblem::new(&params, &penalties, &placement, &groups, 4, 1.0);

        let mut rng = SmallRng::seed_from_u64(1);
        for _ in 0..20 {
            let solution = grasp.construct(&mut rng).unwrap();
            let g2 = solution.assignment[&2];
            assert!(g2 == 5 || g2 == 9);
            for slot in 0..20 {
                let load = solution.assignment.values().filter(|t| **t == slot).count();
                assert!(load <= 2);
                if load > 0 {
                    assert!(params.calendar.is_available(slot));
                }
            }
        }
    }

    #[test]
    fn reports_exhaustion() {
        let params = grouped_params(3, &[&[0, 1, 2]]);
        let only_slot_zero: Vec<Slot> = (1..20).collect();
        let placement = resolve(
            &params,
            PlacementConstraints {
                forbidden: ["G0", "G1", "G2"]
                    .iter()
                    .map(|g| (g.to_string(), only_slot_zero.clone()))
                    .collect(),
                ..Default::default()
            },
        );
        let penalties = PenaltyProfile::default();
        let groups: Vec<GroupId> = params.groups().collect();
        // a slot holds one group at most
        let grasp = GraspProblem::new(&params, &penalties, &placement, &groups, 1, 0.0);
        let err = grasp.construct(&mut SmallRng::seed_from_u64(3)).unwrap_err();
        assert!(matches!(err, SchedulerError::GraspExhausted(_)));
    }

    #[test]
    fn restarts_keep_the_best() {
        let params = grouped_params(5, &[&[0, 1], &[1, 2], &[2, 3], &[3, 4], &[4, 0]]);
        let placement = Placement::default();
        let penalties = PenaltyProfile::default();
        let groups: Vec<GroupId> = params.groups().collect();
        let grasp = GraspProblem::new(&params, &penalties, &placement, &groups, 1000, 0.0);

        let single = grasp
            .run(&mut SmallRng::seed_from_u64(11), Duration::ZERO)
            .unwrap();
        assert_eq!(single.assignment.len(), 5);
        let best = grasp
            .run(&mut SmallRng::seed_from_u64(11), Duration::from_millis(50))
            .unwrap();
        assert!(best.cost <= single.cost);
        // 19 available slots leave room for a timetable without any adjacent pair
        assert_eq!(best.cost, 0.0);
    }
}
