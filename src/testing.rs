//! Small synthetic instances shared by the unit tests.

use crate::data::{CourseRecord, Crn, SemesterConfig, StudentRecord};
use crate::params::ProblemParams;

/// Monday 2024-12-09 through Friday 2024-12-13, four exams a day. Slots 0..19, slot 19 (Friday night) unavailable.
pub fn semester() -> SemesterConfig {
    SemesterConfig {
        start_date: "2024-12-09".parse().unwrap(),
        end_date: "2024-12-13".parse().unwrap(),
        exam_start_times: vec![
            "8:00 AM".into(),
            "11:45 AM".into(),
            "3:30 PM".into(),
            "7:00 PM".into(),
        ],
    }
}

pub fn course(crn: Crn, group: &str, instructor: &str, title: &str) -> CourseRecord {
    CourseRecord {
        crn,
        course_group: group.into(),
        instructor: Some(instructor.into()),
        title: title.into(),
        section: "01".into(),
        course_id: format!("C{}", crn),
        has_exam: true,
    }
}

pub fn student(id: &str, crns: &[Crn]) -> StudentRecord {
    StudentRecord {
        id: id.into(),
        crns: crns.to_vec(),
    }
}

/// One course per group `G{i}`, each taught by its own instructor, and the given enrollments by group index.
pub fn grouped_params(num_groups: usize, enrollments: &[&[usize]]) -> ProblemParams {
    let courses: Vec<_> = (0..num_groups)
        .map(|g| course(g as Crn + 1, &format!("G{}", g), &format!("Prof {}", g), &format!("Course {}", g)))
        .collect();
    let students: Vec<_> = enrollments
        .iter()
        .enumerate()
        .map(|(i, groups)| {
            let crns: Vec<Crn> = groups.iter().map(|g| *g as Crn + 1).collect();
            student(&format!("s{}", i), &crns)
        })
        .collect();
    ProblemParams::derive(&semester(), &students, &courses).unwrap()
}
