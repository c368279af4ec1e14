//! Phase 2: place every group, keeping the Phase-1 placements, and minimize the full per-student and per-faculty
//! inconvenience penalty.

use good_lp::{Expression, ProblemVariables, Solution, Variable, SolverModel, constraint, default_solver, variable};
use itertools::Itertools;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::anytime::{Incumbent, RoundOutcome};
use crate::config::SolverSettings;
use crate::constraints::Placement;
use crate::data::{PenaltyProfile, Slot};
use crate::error::Result;
use crate::params::{Assignment, GroupId, ProblemParams};
use crate::solver::{self, Attempt, PlacementVars};

/// Per-category sums of the badness variables of a Phase-2 solution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadnessTally {
    pub overlap: u32,
    pub back_to_back: u32,
    pub night_to_morning: u32,
    pub three_in_24: u32,
    pub four_in_48: u32,
    pub faculty_overlap: u32,
    pub faculty_back_to_back: u32,
}

impl BadnessTally {
    pub fn weighted(&self, penalties: &PenaltyProfile) -> f64 {
        penalties.overlap * self.overlap as f64
            + penalties.back_to_back * self.back_to_back as f64
            + penalties.night_to_morning * self.night_to_morning as f64
            + penalties.three_in_24 * self.three_in_24 as f64
            + penalties.four_in_48 * self.four_in_48 as f64
            + penalties.faculty_overlap * self.faculty_overlap as f64
            + penalties.faculty_back_to_back * self.faculty_back_to_back as f64
    }
}

/// Badness variables by category.
#[derive(Default)]
struct BadnessVars {
    overlap: Vec<Variable>,
    back_to_back: Vec<Variable>,
    night_to_morning: Vec<Variable>,
    three_in_24: Vec<Variable>,
    four_in_48: Vec<Variable>,
    faculty_overlap: Vec<Variable>,
    faculty_back_to_back: Vec<Variable>,
}

impl BadnessVars {
    fn categories(&self, penalties: &PenaltyProfile) -> [(f64, &[Variable]); 7] {
        [
            (penalties.overlap, &self.overlap),
            (penalties.back_to_back, &self.back_to_back),
            (penalties.night_to_morning, &self.night_to_morning),
            (penalties.three_in_24, &self.three_in_24),
            (penalties.four_in_48, &self.four_in_48),
            (penalties.faculty_overlap, &self.faculty_overlap),
            (penalties.faculty_back_to_back, &self.faculty_back_to_back),
        ]
    }

    fn objective(&self, penalties: &PenaltyProfile) -> Expression {
        let mut objective = Expression::from(0.0);
        for (weight, vars) in self.categories(penalties) {
            for var in vars {
                objective += weight * *var;
            }
        }
        objective
    }

    fn tally<S: Solution>(&self, solution: &S) -> BadnessTally {
        let sum = |vars: &[Variable]| vars.iter().map(|v| solution.value(*v)).sum::<f64>().round() as u32;
        BadnessTally {
            overlap: sum(&self.overlap),
            back_to_back: sum(&self.back_to_back),
            night_to_morning: sum(&self.night_to_morning),
            three_in_24: sum(&self.three_in_24),
            four_in_48: sum(&self.four_in_48),
            faculty_overlap: sum(&self.faculty_overlap),
            faculty_back_to_back: sum(&self.faculty_back_to_back),
        }
    }
}

/// Variables of one student with exams in two or more groups.
struct StudentVars<'p> {
    groups: &'p [GroupId],
    num_exams: f64,
    occupies: BTreeMap<Slot, Variable>,
    overlap: Vec<(Slot, Variable)>,
    adjacent: Vec<(Slot, Variable)>,
    three_in_24: Option<(Variable, Vec<Vec<Slot>>)>,
    four_in_48: Option<(Variable, Vec<Vec<Slot>>)>,
}

/// Variables of one faculty member teaching two or more groups.
struct FacultyVars<'p> {
    groups: &'p [GroupId],
    teaching: BTreeMap<Slot, Variable>,
    /// Group pairs whose exams in one slot give the faculty member two distinct titles.
    clashing: Vec<(GroupId, GroupId)>,
    overlap: Option<Variable>,
    back_to_back: Option<Variable>,
}

/// Titles of the courses `instructor` teaches in `group`.
fn titles<'p>(params: &'p ProblemParams, group: GroupId, instructor: &str) -> BTreeSet<&'p str> {
    params
        .group_crns(group)
        .iter()
        .filter_map(|crn| params.course(*crn))
        .filter(|course| course.instructor == instructor)
        .map(|course| course.title.as_str())
        .collect()
}

/// Windows of at least `min_len` occupiable slots, each starting at an occupiable slot and spanning less than `hours`.
fn windows(params: &ProblemParams, occupiable: &BTreeMap<Slot, Variable>, hours: f64, min_len: usize) -> Vec<Vec<Slot>> {
    occupiable
        .keys()
        .map(|&start| {
            params
                .calendar
                .window_within(start, hours)
                .into_iter()
                .filter(|t| occupiable.contains_key(t))
                .collect::<Vec<_>>()
        })
        .filter(|window| window.len() >= min_len)
        .dedup()
        .collect()
}

pub struct Phase2Model<'a> {
    params: &'a ProblemParams,
    penalties: &'a PenaltyProfile,
    placement: &'a Placement,
    settings: &'a SolverSettings,
    seed: u64,
    capacity: u32,
    preplaced: &'a Assignment,
}

impl<'a> Phase2Model<'a> {
    pub fn new(
        params: &'a ProblemParams,
        penalties: &'a PenaltyProfile,
        placement: &'a Placement,
        settings: &'a SolverSettings,
        seed: u64,
        capacity: u32,
        preplaced: &'a Assignment,
    ) -> Self {
        Phase2Model {
            params,
            penalties,
            placement,
            settings,
            seed,
            capacity,
            preplaced,
        }
    }

    fn allows(&self, group: GroupId, slot: Slot) -> bool {
        self.placement.allows(&self.params.calendar, group, slot)
            && self.preplaced.get(&group).is_none_or(|p| *p == slot)
    }

    pub fn solve_round(&self, limit: Duration, bound: Option<f64>) -> Result<RoundOutcome> {
        let params = self.params;
        let calendar = &params.calendar;
        let groups: Vec<GroupId> = params.groups().collect();
        let mut problem = ProblemVariables::new();
        let mut bad = BadnessVars::default();

        let place = PlacementVars::new(&mut problem, &groups, calendar.num_slots(), |g, t| self.allows(g, t));

        let mut students = Vec::new();
        for student in params.students().iter().filter(|s| s.groups.len() >= 2) {
            let occupies: BTreeMap<Slot, Variable> = calendar
                .available_slots()
                .filter(|t| place.any_in_slot(&student.groups, *t))
                .map(|t| (t, problem.add(variable().binary())))
                .collect();
            let max_extra = (student.groups.len() - 1) as f64;
            let mut overlap = Vec::new();
            for &t in occupies.keys() {
                if student.groups.iter().filter(|g| place.get(**g, t).is_some()).count() >= 2 {
                    let var = problem.add(variable().integer().min(0.0).max(max_extra));
                    bad.overlap.push(var);
                    overlap.push((t, var));
                }
            }
            let mut adjacent = Vec::new();
            for &t in occupies.keys() {
                if occupies.contains_key(&(t + 1)) {
                    let var = problem.add(variable().binary());
                    if calendar.is_night(t) {
                        bad.night_to_morning.push(var);
                    } else {
                        bad.back_to_back.push(var);
                    }
                    adjacent.push((t, var));
                }
            }
            let mut window_var = |min_len: usize, hours: f64, category: &mut Vec<Variable>| {
                if student.groups.len() < min_len {
                    return None;
                }
                let found = windows(params, &occupies, hours, min_len);
                if found.is_empty() {
                    return None;
                }
                let var = problem.add(variable().binary());
                category.push(var);
                Some((var, found))
            };
            let three_in_24 = window_var(3, 24.0, &mut bad.three_in_24);
            let four_in_48 = window_var(4, 48.0, &mut bad.four_in_48);

            students.push(StudentVars {
                groups: &student.groups,
                num_exams: student.num_exams() as f64,
                occupies,
                overlap,
                adjacent,
                three_in_24,
                four_in_48,
            });
        }

        let mut faculty = Vec::new();
        for f in params.faculty() {
            let taught = params.faculty_groups(f);
            if taught.len() < 2 {
                continue;
            }
            let teaching: BTreeMap<Slot, Variable> = calendar
                .available_slots()
                .filter(|t| place.any_in_slot(taught, *t))
                .map(|t| (t, problem.add(variable().binary())))
                .collect();
            let name = params.faculty_name(f);
            // cross-listed sections share a title and may sit together
            let clashing: Vec<(GroupId, GroupId)> = taught
                .iter()
                .copied()
                .tuple_combinations()
                .filter(|&(g1, g2)| {
                    let mut union = titles(params, g1, name);
                    union.extend(titles(params, g2, name));
                    union.len() > 1
                })
                .filter(|&(g1, g2)| {
                    teaching
                        .keys()
                        .any(|t| place.get(g1, *t).is_some() && place.get(g2, *t).is_some())
                })
                .collect();
            let overlap = (!clashing.is_empty()).then(|| problem.add(variable().binary()));
            let adjacent = teaching.keys().any(|t| teaching.contains_key(&(t + 1)));
            let back_to_back = adjacent.then(|| problem.add(variable().binary()));
            bad.faculty_overlap.extend(overlap);
            bad.faculty_back_to_back.extend(back_to_back);
            faculty.push(FacultyVars {
                groups: taught,
                teaching,
                clashing,
                overlap,
                back_to_back,
            });
        }

        let mut model = solver::configure(
            problem.minimise(bad.objective(self.penalties)).using(default_solver),
            self.settings,
            self.seed,
            limit,
            bound,
        );
        place.add_assignment_constraints(&mut model);
        place.add_capacity_constraints(&mut model, params, self.capacity);

        for s in &students {
            for (&t, &occ) in &s.occupies {
                let exams = place.in_slot(s.groups, t);
                model.add_constraint(constraint!(exams <= s.num_exams * occ));
            }
            for &(t, ov) in &s.overlap {
                let exams = place.in_slot(s.groups, t);
                model.add_constraint(constraint!(exams <= 1 + ov));
            }
            for &(t, adj) in &s.adjacent {
                let (first, second) = (s.occupies[&t], s.occupies[&(t + 1)]);
                model.add_constraint(constraint!(first + second <= 1 + adj));
            }
            for (allowed, window) in [(2.0, &s.three_in_24), (3.0, &s.four_in_48)] {
                let Some((var, found)) = window else { continue };
                let big_m = s.num_exams - allowed;
                for slots in found {
                    let mut occupied = Expression::from(0.0);
                    for t in slots {
                        occupied += s.occupies[t];
                    }
                    model.add_constraint(constraint!(occupied <= allowed + big_m * *var));
                }
            }
        }

        for f in &faculty {
            let big_m = f.groups.len() as f64;
            for (&t, &teach) in &f.teaching {
                let exams = place.in_slot(f.groups, t);
                model.add_constraint(constraint!(exams <= big_m * teach));
            }
            if let Some(fo) = f.overlap {
                for &(g1, g2) in &f.clashing {
                    for &t in f.teaching.keys() {
                        if let (Some(x1), Some(x2)) = (place.get(g1, t), place.get(g2, t)) {
                            model.add_constraint(constraint!(x1 + x2 <= 1 + fo));
                        }
                    }
                }
            }
            if let Some(fb) = f.back_to_back {
                for (&t, &teach) in &f.teaching {
                    if let Some(&next) = f.teaching.get(&(t + 1)) {
                        model.add_constraint(constraint!(teach + next <= 1 + fb));
                    }
                }
            }
        }

        info!(
            "Starting Phase 2 round with {} groups ({} preplaced), {} students, {} faculty, limit {:.1?}",
            groups.len(),
            self.preplaced.len(),
            students.len(),
            faculty.len(),
            limit
        );
        let started = Instant::now();
        let solution = match solver::attempt(model, "Phase 2")? {
            Attempt::Infeasible => return Ok(RoundOutcome::Infeasible),
            Attempt::NoSolution => return Ok(RoundOutcome::NoIncumbent),
            Attempt::Solved(solution) => solution,
        };
        let proven_optimal = solver::finished_early(started, limit);

        let Some(assignment) = place.extract(&solution) else {
            debug!("Phase 2 round returned an incomplete mapping");
            return Ok(RoundOutcome::NoIncumbent);
        };
        if !solver::within_capacity(params, &assignment, self.capacity) {
            debug!("Phase 2 round returned a mapping over capacity");
            return Ok(RoundOutcome::NoIncumbent);
        }
        let tally = bad.tally(&solution);
        let objective = tally.weighted(self.penalties);
        info!("Phase 2 round found objective {:.4} in {:.2?}", objective, started.elapsed());
        Ok(RoundOutcome::Incumbent(Incumbent {
            objective,
            assignment,
            tally: Some(tally),
            proven_optimal,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyze::analyze;
    use crate::data::{GroupPolicies, PlacementConstraints};
    use crate::testing::{course, grouped_params, semester, student};
    use assert_float_eq::*;

    fn solve(params: &ProblemParams, placement: &Placement, preplaced: &Assignment) -> Incumbent {
        let penalties = PenaltyProfile::default();
        let settings = SolverSettings::default();
        let model = Phase2Model::new(params, &penalties, placement, &settings, 1, 1000, preplaced);
        match model.solve_round(Duration::from_secs(60), None).unwrap() {
            RoundOutcome::Incumbent(incumbent) => incumbent,
            other => panic!("expected an incumbent, got {:?}", other),
        }
    }

    #[test]
    fn spreads_exams_without_conflicts() {
        let params = grouped_params(4, &[&[0, 1, 2], &[1, 2, 3], &[0, 3]]);
        let incumbent = solve(&params, &Placement::default(), &Assignment::new());
        assert_eq!(incumbent.assignment.len(), 4);
        assert_eq!(incumbent.tally, Some(BadnessTally::default()));
        assert_float_absolute_eq!(incumbent.objective, 0.0, 1e-9);
        assert!(incumbent.proven_optimal);
    }

    #[test]
    fn keeps_preplaced_groups_and_counts_their_conflicts() {
        let params = grouped_params(3, &[&[0, 1], &[1, 2]]);
        let preplaced: Assignment = [(0, 0), (1, 1)].into();
        let incumbent = solve(&params, &Placement::default(), &preplaced);
        assert_eq!(incumbent.assignment[&0], 0);
        assert_eq!(incumbent.assignment[&1], 1);
        let tally = incumbent.tally.unwrap();
        assert_eq!(tally.back_to_back, 1);
        assert_eq!(tally.overlap, 0);
        assert_float_absolute_eq!(incumbent.objective, 0.02, 1e-9);
        assert_eq!(analyze(&params, &incumbent.assignment).counts.student_back_to_back, 1);
    }

    #[test]
    fn three_exams_in_one_slot_count_two_overlaps() {
        let params = grouped_params(3, &[&[0, 1, 2]]);
        let preplaced: Assignment = [(0, 5), (1, 5), (2, 5)].into();
        let incumbent = solve(&params, &Placement::default(), &preplaced);
        assert_eq!(incumbent.tally.unwrap().overlap, 2);
        assert_float_absolute_eq!(incumbent.objective, 2.0, 1e-9);
        assert_eq!(analyze(&params, &incumbent.assignment).counts.student_overlap, 2);
    }

    #[test]
    fn cross_listed_sections_do_not_count_as_faculty_overlap() {
        let courses = vec![
            course(1, "A", "Dr X", "Optics"),
            course(2, "B", "Dr X", "Optics"),
            course(3, "C", "Dr X", "Algorithms"),
        ];
        let students = vec![student("s1", &[1]), student("s2", &[2]), student("s3", &[3])];
        let params = ProblemParams::derive(&semester(), &students, &courses).unwrap();
        let g = |name: &str| params.group_id(name).unwrap();

        let cross_listed: Assignment = [(g("A"), 0), (g("B"), 0)].into();
        let incumbent = solve(&params, &Placement::default(), &cross_listed);
        assert_eq!(incumbent.tally.unwrap().faculty_overlap, 0);
        assert_float_absolute_eq!(incumbent.objective, 0.0, 1e-9);
        assert_eq!(analyze(&params, &incumbent.assignment).counts.faculty_overlap, 0);

        let all_together: Assignment = [(g("A"), 0), (g("B"), 0), (g("C"), 0)].into();
        let incumbent = solve(&params, &Placement::default(), &all_together);
        assert_eq!(incumbent.tally.unwrap().faculty_overlap, 1);
        let report = analyze(&params, &incumbent.assignment);
        assert_eq!(report.counts.faculty_overlap, 1);
        assert_float_absolute_eq!(
            report.weighted_penalty(&PenaltyProfile::default()),
            incumbent.objective,
            1e-9
        );
    }

    #[test]
    fn three_in_24_matches_the_analysis() {
        let params = grouped_params(3, &[&[0, 1, 2]]);
        let only_monday_night: Vec<Slot> = (0..20).filter(|t| *t != 3).collect();
        let placement = Placement::resolve(
            &PlacementConstraints {
                forbidden: [("G2".to_string(), only_monday_night)].into(),
                ..Default::default()
            },
            &GroupPolicies::default(),
            &params,
        )
        .unwrap();
        let preplaced: Assignment = [(0, 0), (1, 2)].into();
        let incumbent = solve(&params, &placement, &preplaced);
        assert_eq!(incumbent.assignment[&2], 3);

        let tally = incumbent.tally.unwrap();
        assert_eq!(tally.three_in_24, 1);
        assert_eq!(tally.back_to_back, 1);
        assert_float_absolute_eq!(incumbent.objective, 0.1 + 0.02, 1e-9);

        let report = analyze(&params, &incumbent.assignment);
        assert_eq!(report.counts.three_in_24, 1);
        assert_eq!(report.counts.student_back_to_back, 1);
        assert_float_absolute_eq!(
            report.weighted_penalty(&PenaltyProfile::default()),
            incumbent.objective,
            1e-9
        );
    }
}
