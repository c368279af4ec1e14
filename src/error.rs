use crate::data::Crn;
use thiserror::Error;

/// Problems with the input tables or placement constraints. Every variant names the offending record.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DataError {
    #[error("CRN {crn} is missing required field `{field}`")]
    MissingField { crn: Crn, field: &'static str },
    #[error("CRN {0} appears more than once in the course table")]
    DuplicateCrn(Crn),
    #[error("student `{0}` appears more than once in the enrollment table")]
    DuplicateStudent(String),
    #[error("student `{student}` is enrolled in CRN {crn}, which is not in the course table")]
    UnknownCrn { student: String, crn: Crn },
    #[error("student `{student}` lists {count} CRNs, at most {max} are allowed")]
    TooManyCrns {
        student: String,
        count: usize,
        max: usize,
    },
    #[error("unknown course group `{0}`")]
    UnknownGroup(String),
    #[error("group `{group}` is fixed to slot {slot}, which is also forbidden for it")]
    ConflictingConstraint { group: String, slot: usize },
    #[error("slot {slot} for group `{group}` is out of range or unavailable")]
    InvalidSlot { group: String, slot: usize },
    #[error("malformed exam start time `{0}`")]
    BadExamTime(String),
    #[error("no daily exam start times configured")]
    NoExamTimes,
    #[error("exam period ends on {end} before it starts on {start}")]
    BadExamWindow { start: String, end: String },
    #[error("penalty `{0}` must be a non-negative number")]
    BadPenalty(&'static str),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("worker for subset size {k} failed: {reason}")]
    WorkerFailed { k: usize, reason: String },
    #[error("all {0} workers failed without producing a result")]
    AllWorkersFailed(usize),
    #[error("GRASP ran out of feasible slots while placing group `{0}`")]
    GraspExhausted(String),
    #[error("solver error: {0}")]
    Solver(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
