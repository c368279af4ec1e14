//! Inconvenience statistics for a complete timetable.

use itertools::Itertools;
use log::{info, warn};
use std::collections::BTreeMap;

use crate::data::{ConflictReport, Crn, Inconvenience, InconvenienceCounts, Slot};
use crate::params::{Assignment, ProblemParams, StudentInfo};

/// Count and describe every student and faculty inconvenience of `assignment`.
///
/// Groups missing from the assignment are skipped; the affected CRNs are listed in
/// [`ConflictReport::missing_crns`]. The result is a pure function of its inputs.
pub fn analyze(params: &ProblemParams, assignment: &Assignment) -> ConflictReport {
    let mut report = ConflictReport {
        counts: InconvenienceCounts {
            forced_overlap: params.forced_overlaps(),
            ..Default::default()
        },
        ..Default::default()
    };

    for student in params.students() {
        analyze_student(params, assignment, student, &mut report);
    }
    if !report.missing_crns.is_empty() {
        warn!(
            "{} CRNs are not covered by the mapping ({} enrollments skipped)",
            report.missing_crns.len(),
            report.missing_crns.values().sum::<u32>()
        );
    }

    faculty_overlaps(params, assignment, &mut report);
    faculty_back_to_back(params, assignment, &mut report);

    let c = &report.counts;
    info!(
        "Analysis: {} overlaps ({} forced), {} back-to-back, {} night-to-morning, {} 3-in-24, {} 4-in-48, {} inconvenienced students, {} faculty overlaps, {} faculty back-to-back",
        c.student_overlap,
        c.forced_overlap,
        c.student_back_to_back,
        c.night_to_morning,
        c.three_in_24,
        c.four_in_48,
        c.inconvenient_students,
        c.faculty_overlap,
        c.faculty_back_to_back
    );
    report
}

fn problem(report: &mut ConflictReport, kind: Inconvenience, line: String) {
    report.problems.entry(kind).or_default().push(line);
}

fn analyze_student(params: &ProblemParams, assignment: &Assignment, student: &StudentInfo, report: &mut ConflictReport) {
    let calendar = &params.calendar;
    let id = &student.name;

    // every mapped CRN, so two exams of one group collide like any other pair
    let mut exams: Vec<(Slot, Crn)> = Vec::with_capacity(student.exam_crns.len());
    for &crn in &student.exam_crns {
        let Some(group) = params.course(crn).and_then(|c| c.group) else {
            continue;
        };
        match assignment.get(&group) {
            Some(&slot) => exams.push((slot, crn)),
            None => *report.missing_crns.entry(crn).or_insert(0) += 1,
        }
    }
    if exams.is_empty() {
        return;
    }
    exams.sort_by_key(|(slot, _)| *slot);

    let mut inconvenienced = false;
    for ((t1, c1), (t2, c2)) in exams.iter().tuple_windows() {
        if t1 == t2 {
            report.counts.student_overlap += 1;
            inconvenienced = true;
            problem(
                report,
                Inconvenience::StudentOverlap,
                format!("ID: {}, timeslot: {}, crns: {}, {}", id, calendar.label(*t1), c1, c2),
            );
        }
    }

    let slots: Vec<Slot> = exams.iter().map(|(slot, _)| *slot).dedup().collect();
    let mut three_in_24 = false;
    let mut four_in_48 = false;
    for (i, &slot) in slots.iter().enumerate() {
        if !four_in_48 && i + 3 < slots.len() && calendar.hours_between(slot, slots[i + 3]) < 48.0 {
            four_in_48 = true;
            problem(
                report,
                Inconvenience::FourIn48,
                format!("ID: {}, timeslot: {}", id, calendar.label(slot)),
            );
        }
        if !three_in_24 && i + 2 < slots.len() && calendar.hours_between(slot, slots[i + 2]) < 24.0 {
            three_in_24 = true;
            problem(
                report,
                Inconvenience::ThreeIn24,
                format!("ID: {}, timeslot: {}", id, calendar.label(slot)),
            );
        }
        if i + 1 < slots.len() && slots[i + 1] == slot + 1 {
            inconvenienced = true;
            if calendar.is_night(slot) {
                report.counts.night_to_morning += 1;
                problem(
                    report,
                    Inconvenience::NightToMorning,
                    format!("ID: {}, night timeslot: {}", id, calendar.label(slot)),
                );
            } else {
                report.counts.student_back_to_back += 1;
                problem(
                    report,
                    Inconvenience::StudentBackToBack,
                    format!("ID: {}, first timeslot: {}", id, calendar.label(slot)),
                );
            }
        }
    }

    if three_in_24 {
        report.counts.three_in_24 += 1;
    }
    if four_in_48 {
        report.counts.four_in_48 += 1;
    }
    if inconvenienced || three_in_24 || four_in_48 {
        report.counts.inconvenient_students += 1;
        problem(report, Inconvenience::InconvenientStudents, format!("ID: {}", id));
    }
}

/// Groups per slot, in group order.
fn groups_by_slot(params: &ProblemParams, assignment: &Assignment) -> Vec<Vec<usize>> {
    let mut by_slot = vec![Vec::new(); params.calendar.num_slots()];
    for (&group, &slot) in assignment {
        if let Some(groups) = by_slot.get_mut(slot) {
            groups.push(group);
        }
    }
    by_slot
}

/// A faculty member with exams of two or more distinct titles in one slot. Cross-listed sections share a title and
/// do not count.
fn faculty_overlaps(params: &ProblemParams, assignment: &Assignment, report: &mut ConflictReport) {
    for (slot, groups) in groups_by_slot(params, assignment).iter().enumerate() {
        let mut courses: BTreeMap<&str, Vec<(&str, &str)>> = BTreeMap::new();
        for &group in groups {
            for &crn in params.group_crns(group) {
                let Some(course) = params.course(crn) else { continue };
                if params.faculty_id(&course.instructor).is_none() {
                    continue;
                }
                let taught = courses.entry(course.instructor.as_str()).or_default();
                if !taught.iter().any(|(_, title)| *title == course.title) {
                    taught.push((course.course_id.as_str(), course.title.as_str()));
                }
            }
        }
        for (instructor, taught) in courses.iter().filter(|(_, taught)| taught.len() > 1) {
            report.counts.faculty_overlap += 1;
            let listing = taught
                .iter()
                .map(|(course_id, title)| format!("{} ({})", course_id, title))
                .join(", ");
            problem(
                report,
                Inconvenience::FacultyOverlap,
                format!("Faculty: {}, Time: {}, courses: {}", instructor, params.calendar.label(slot), listing),
            );
        }
    }
}

/// A faculty member with exams in two adjacent slots.
fn faculty_back_to_back(params: &ProblemParams, assignment: &Assignment, report: &mut ConflictReport) {
    for faculty in params.faculty() {
        let name = params.faculty_name(faculty);
        // first CRN the faculty member teaches in each occupied slot
        let mut teaching: BTreeMap<Slot, Crn> = BTreeMap::new();
        for &group in params.faculty_groups(faculty) {
            let Some(&slot) = assignment.get(&group) else { continue };
            let crn = params
                .group_crns(group)
                .iter()
                .copied()
                .find(|crn| params.course(*crn).is_some_and(|c| c.instructor == name));
            if let Some(crn) = crn {
                let entry = teaching.entry(slot).or_insert(crn);
                *entry = (*entry).min(crn);
            }
        }
        for ((t1, c1), (t2, c2)) in teaching.iter().tuple_windows() {
            if *t2 == *t1 + 1 {
                report.counts.faculty_back_to_back += 1;
                problem(
                    report,
                    Inconvenience::FacultyBackToBack,
                    format!("Faculty: {}, CRNs: {}, {}", name, c1, c2),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_float_eq::*;
    use crate::data::{NO_EXAM_GROUP, PenaltyProfile};
    use crate::testing::{course, grouped_params, semester, student};

    fn assignment(pairs: &[(usize, Slot)]) -> Assignment {
        pairs.iter().copied().collect()
    }

    #[test]
    fn two_students_one_overlap() {
        let params = grouped_params(2, &[&[0, 1], &[0]]);
        let report = analyze(&params, &assignment(&[(0, 0), (1, 0)]));
        assert_eq!(report.counts.student_overlap, 1);
        assert_eq!(report.counts.inconvenient_students, 1);
        assert_eq!(report.counts.student_back_to_back, 0);
        assert_eq!(
            report.problems[&Inconvenience::StudentOverlap],
            vec!["ID: s0, timeslot: Monday, 12/09, 08:00 AM, crns: 1, 2".to_string()]
        );
        assert_eq!(report.problems[&Inconvenience::InconvenientStudents], vec!["ID: s0".to_string()]);
    }

    #[test]
    fn back_to_back_and_night_to_morning() {
        let params = grouped_params(4, &[&[0, 1], &[2, 3]]);
        // s0: slots 1, 2 (afternoon after late morning); s1: slots 3, 4 (Monday night, Tuesday morning)
        let report = analyze(&params, &assignment(&[(0, 1), (1, 2), (2, 3), (3, 4)]));
        assert_eq!(report.counts.student_back_to_back, 1);
        assert_eq!(report.counts.night_to_morning, 1);
        assert_eq!(report.counts.inconvenient_students, 2);
        assert_eq!(report.counts.three_in_24, 0);
        assert_eq!(
            report.problems[&Inconvenience::NightToMorning],
            vec!["ID: s1, night timeslot: Monday, 12/09, 07:00 PM".to_string()]
        );
    }

    #[test]
    fn three_in_24_counted_once_per_student() {
        let params = grouped_params(5, &[&[0, 1, 2, 3, 4]]);
        // Monday 8 AM through Monday 7 PM
        let four = analyze(&params, &assignment(&[(0, 0), (1, 1), (2, 2), (3, 3)]));
        assert_eq!(four.counts.three_in_24, 1);
        assert_eq!(four.counts.four_in_48, 1);
        assert_eq!(four.counts.student_back_to_back, 3);
        assert_eq!(four.counts.inconvenient_students, 1);

        let five = analyze(&params, &assignment(&[(0, 0), (1, 1), (2, 2), (3, 3), (4, 4)]));
        assert_eq!(five.counts.three_in_24, 1);
        assert_eq!(five.counts.four_in_48, 1);
        assert_eq!(five.counts.night_to_morning, 1);
        assert_eq!(five.problems[&Inconvenience::ThreeIn24].len(), 1);

        // Monday 3:30 PM, Tuesday 8 AM, Tuesday 3:30 PM span exactly 24 hours
        let spaced = analyze(&params, &assignment(&[(0, 2), (1, 4), (2, 6)]));
        assert_eq!(spaced.counts.three_in_24, 0);
        assert_eq!(spaced.counts.inconvenient_students, 0);
    }

    #[test]
    fn spread_out_exams_are_convenient() {
        let params = grouped_params(3, &[&[0, 1, 2]]);
        let report = analyze(&params, &assignment(&[(0, 0), (1, 8), (2, 16)]));
        assert_eq!(report.counts, InconvenienceCounts::default());
        assert!(report.problems.is_empty());
        assert_eq!(report.weighted_penalty(&PenaltyProfile::default()), 0.0);
    }

    #[test]
    fn faculty_overlap_ignores_cross_listings() {
        let courses = vec![
            course(1, "A", "Dr X", "Algorithms"),
            course(2, "B", "Dr X", "Databases"),
            course(3, "C", "Dr Y", "Optics"),
            course(4, "D", "Dr Y", "Optics"),
        ];
        let params = ProblemParams::derive(&semester(), &[], &courses).unwrap();
        let a = |name: &str| params.group_id(name).unwrap();

        let report = analyze(&params, &assignment(&[(a("A"), 0), (a("B"), 0), (a("C"), 5), (a("D"), 5)]));
        assert_eq!(report.counts.faculty_overlap, 1);
        assert_eq!(
            report.problems[&Inconvenience::FacultyOverlap],
            vec!["Faculty: DrX, Time: Monday, 12/09, 08:00 AM, courses: C1 (Algorithms), C2 (Databases)".to_string()]
        );

        let report = analyze(&params, &assignment(&[(a("A"), 0), (a("B"), 1), (a("C"), 5), (a("D"), 6)]));
        assert_eq!(report.counts.faculty_overlap, 0);
        assert_eq!(report.counts.faculty_back_to_back, 2);
        assert_eq!(
            report.problems[&Inconvenience::FacultyBackToBack][0],
            "Faculty: DrX, CRNs: 1, 2"
        );
    }

    #[test]
    fn missing_groups_and_forced_overlaps() {
        let courses = vec![
            course(1, "A", "Dr X", "Algorithms"),
            course(2, "A", "Dr X", "Algorithms Lab"),
            course(3, "B", "Dr Y", "Optics"),
            course(4, NO_EXAM_GROUP, "Dr Z", "Seminar"),
        ];
        let students = vec![student("s1", &[1, 2, 3, 4])];
        let params = ProblemParams::derive(&semester(), &students, &courses).unwrap();
        let a = params.group_id("A").unwrap();

        let report = analyze(&params, &assignment(&[(a, 0)]));
        assert_eq!(report.counts.forced_overlap, 1);
        assert_eq!(report.counts.student_overlap, 1);
        assert_eq!(report.counts.inconvenient_students, 1);
        assert_eq!(
            report.problems[&Inconvenience::StudentOverlap],
            vec!["ID: s1, timeslot: Monday, 12/09, 08:00 AM, crns: 1, 2".to_string()]
        );
        assert_eq!(report.missing_crns, BTreeMap::from([(3, 1)]));
        // the student collision is reported but not charged, only Dr X's two titles are
        assert_eq!(report.counts.faculty_overlap, 1);
        assert_float_absolute_eq!(report.weighted_penalty(&PenaltyProfile::default()), 0.2, 1e-9);
    }

    #[test]
    fn every_duplicate_in_a_slot_is_one_overlap() {
        let courses = vec![
            course(1, "A", "Dr X", "Algorithms"),
            course(2, "A", "Dr X", "Algorithms"),
            course(3, "A", "Dr X", "Algorithms"),
            course(4, "B", "Dr Y", "Optics"),
        ];
        let students = vec![student("s1", &[1, 2, 3, 4]), student("s2", &[1, 4])];
        let params = ProblemParams::derive(&semester(), &students, &courses).unwrap();
        let a = params.group_id("A").unwrap();
        let b = params.group_id("B").unwrap();

        let apart = analyze(&params, &assignment(&[(a, 0), (b, 8)]));
        assert_eq!(apart.counts.forced_overlap, 2);
        assert_eq!(apart.counts.student_overlap, 2);
        assert_eq!(apart.counts.inconvenient_students, 1);
        assert_float_absolute_eq!(apart.weighted_penalty(&PenaltyProfile::default()), 0.0, 1e-9);

        // s1 now has four exams in one slot, s2 two
        let together = analyze(&params, &assignment(&[(a, 0), (b, 0)]));
        assert_eq!(together.counts.student_overlap, 4);
        assert_eq!(together.counts.inconvenient_students, 2);
        assert_eq!(together.problems[&Inconvenience::StudentOverlap].len(), 4);
        assert_float_absolute_eq!(together.weighted_penalty(&PenaltyProfile::default()), 2.0, 1e-9);
    }

    #[test]
    fn analysis_is_idempotent_and_penalty_matches_counts() {
        let params = grouped_params(4, &[&[0, 1, 2], &[1, 2], &[2, 3], &[0, 3]]);
        let mapping = assignment(&[(0, 0), (1, 0), (2, 1), (3, 3)]);
        let first = analyze(&params, &mapping);
        let second = analyze(&params, &mapping);
        assert_eq!(first, second);

        let c = &first.counts;
        // s0 overlaps in 0 and runs 0 -> 1, s1 runs 0 -> 1, s2 has 1 and 3, s3 has 0 and 3
        assert_eq!(c.student_overlap, 1);
        assert_eq!(c.student_back_to_back, 2);
        assert_eq!(c.inconvenient_students, 2);
        let penalties = PenaltyProfile::default();
        assert_float_absolute_eq!(first.weighted_penalty(&penalties), 1.04, 1e-9);
    }
}
