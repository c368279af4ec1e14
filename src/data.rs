use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::DataError;

// Type aliases for clarity
pub type Crn = i64;
pub type Slot = usize;

/// Group name of the reserved group that holds every CRN without a final exam.
pub const NO_EXAM_GROUP: &str = "NO_EXAM";

/// Marks an unused enrollment column in the student table.
pub const UNUSED_CRN: Crn = -1;

/// Maximum number of CRNs a student row may list.
pub const MAX_ENROLLMENTS: usize = 15;

/// The exam window of a semester.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SemesterConfig {
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    /// Ordered daily exam start times, e.g. `["8:00 AM", "11:45 AM", "3:30 PM", "7:00 PM"]`.
    pub exam_start_times: Vec<String>,
}

/// One row of the enrollment table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    pub id: String,
    pub crns: Vec<Crn>,
}

/// One row of the course table.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CourseRecord {
    pub crn: Crn,
    pub course_group: String,
    #[serde(default)]
    pub instructor: Option<String>,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub section: String,
    #[serde(default)]
    pub course_id: String,
    #[serde(default = "default_has_exam")]
    pub has_exam: bool,
}

fn default_has_exam() -> bool {
    true
}

/// Weights of each inconvenience kind.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PenaltyProfile {
    pub overlap: f64,
    pub back_to_back: f64,
    pub night_to_morning: f64,
    pub three_in_24: f64,
    pub four_in_48: f64,
    pub faculty_overlap: f64,
    pub faculty_back_to_back: f64,
}

impl Default for PenaltyProfile {
    fn default() -> Self {
        PenaltyProfile {
            overlap: 1.0,
            back_to_back: 0.02,
            night_to_morning: 0.04,
            three_in_24: 0.1,
            four_in_48: 0.2,
            faculty_overlap: 0.2,
            faculty_back_to_back: 0.05,
        }
    }
}

impl PenaltyProfile {
    pub fn validate(&self) -> Result<(), DataError> {
        let weights = [
            ("overlap", self.overlap),
            ("backToBack", self.back_to_back),
            ("nightToMorning", self.night_to_morning),
            ("threeIn24", self.three_in_24),
            ("fourIn48", self.four_in_48),
            ("facultyOverlap", self.faculty_overlap),
            ("facultyBackToBack", self.faculty_back_to_back),
        ];
        for (name, weight) in weights {
            if !weight.is_finite() || weight < 0.0 {
                return Err(DataError::BadPenalty(name));
            }
        }
        Ok(())
    }
}

/// Hard placement constraints keyed by group name.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlacementConstraints {
    pub fixed: BTreeMap<String, Slot>,
    pub forbidden: BTreeMap<String, Vec<Slot>>,
}

/// Named groups that must stay out of parts of the exam period. Each list expands into forbidden slots.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GroupPolicies {
    pub no_last_day: Vec<String>,
    pub no_last_two_days: Vec<String>,
    pub no_night: Vec<String>,
    pub no_friday_monday: Vec<String>,
}

/// The complete input for one optimization run.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleInput {
    pub semester: SemesterConfig,
    pub students: Vec<StudentRecord>,
    pub courses: Vec<CourseRecord>,
    #[serde(default)]
    pub penalties: PenaltyProfile,
    #[serde(default)]
    pub constraints: PlacementConstraints,
    #[serde(default)]
    pub policies: GroupPolicies,
}

/// Input for analyzing an existing timetable.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyzeInput {
    pub schedule: ScheduleInput,
    pub group_to_slot: BTreeMap<String, Slot>,
}

/// The categories reported by the conflict analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Inconvenience {
    StudentOverlap,
    StudentBackToBack,
    NightToMorning,
    ThreeIn24,
    FourIn48,
    InconvenientStudents,
    FacultyOverlap,
    FacultyBackToBack,
}

impl fmt::Display for Inconvenience {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Inconvenience::StudentOverlap => "Student Overlap",
            Inconvenience::StudentBackToBack => "Student Back-to-Back",
            Inconvenience::NightToMorning => "Night to Morning",
            Inconvenience::ThreeIn24 => "Three in 24 Hours",
            Inconvenience::FourIn48 => "Four in 48 Hours",
            Inconvenience::InconvenientStudents => "Inconvenienced Students",
            Inconvenience::FacultyOverlap => "Faculty Overlap",
            Inconvenience::FacultyBackToBack => "Faculty Back-to-Back",
        };
        write!(f, "{}", name)
    }
}

/// Counts per inconvenience category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InconvenienceCounts {
    pub student_overlap: u32,
    pub forced_overlap: u32,
    pub student_back_to_back: u32,
    pub night_to_morning: u32,
    pub three_in_24: u32,
    pub four_in_48: u32,
    pub inconvenient_students: u32,
    pub faculty_overlap: u32,
    pub faculty_back_to_back: u32,
}

/// The result of analyzing a complete timetable.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub counts: InconvenienceCounts,
    pub problems: BTreeMap<Inconvenience, Vec<String>>,
    /// CRNs whose group was absent from the analyzed mapping, with the number of affected enrollments.
    pub missing_crns: BTreeMap<Crn, u32>,
}

impl ConflictReport {
    /// Penalty-weighted total of the counted inconveniences. `student_overlap` includes the forced
    /// same-group collisions, which are taken out again here since no mapping can avoid them.
    pub fn weighted_penalty(&self, penalties: &PenaltyProfile) -> f64 {
        let c = &self.counts;
        penalties.overlap * c.student_overlap.saturating_sub(c.forced_overlap) as f64
            + penalties.back_to_back * c.student_back_to_back as f64
            + penalties.night_to_morning * c.night_to_morning as f64
            + penalties.three_in_24 * c.three_in_24 as f64
            + penalties.four_in_48 * c.four_in_48 as f64
            + penalties.faculty_overlap * c.faculty_overlap as f64
            + penalties.faculty_back_to_back * c.faculty_back_to_back as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SolveStatus {
    Optimized,
    Infeasible,
}

/// The final output of the scheduler.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleOutput {
    pub status: SolveStatus,
    pub group_to_slot: BTreeMap<String, Slot>,
    pub objective: Option<f64>,
    /// Subset size of the Phase-1 run that produced the chosen timetable.
    pub phase1_size: Option<usize>,
    pub failed_workers: Vec<usize>,
    pub report: Option<ConflictReport>,
}

impl ScheduleOutput {
    pub fn infeasible() -> Self {
        ScheduleOutput {
            status: SolveStatus::Infeasible,
            group_to_slot: BTreeMap::new(),
            objective: None,
            phase1_size: None,
            failed_workers: Vec::new(),
            report: None,
        }
    }
}
