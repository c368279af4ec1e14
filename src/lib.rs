//! Two-phase exam timetable optimization: a coarse Phase-1 model places the largest and most constrained course
//! groups, a Phase-2 model completes the timetable student by student, and GRASP competes with or warm-starts
//! Phase 1. Runs for several Phase-1 subset sizes execute in parallel and the best complete timetable wins.

pub mod analyze;
pub mod anytime;
pub mod calendar;
pub mod config;
pub mod constraints;
pub mod data;
pub mod error;
pub mod grasp;
pub mod orchestrator;
pub mod params;
pub mod phase1;
pub mod phase2;
pub mod server;
pub mod solver;

#[cfg(test)]
mod testing;

pub use config::SolverConfig;
pub use data::{AnalyzeInput, ConflictReport, ScheduleInput, ScheduleOutput, SolveStatus};
pub use error::{DataError, Result, SchedulerError};
pub use orchestrator::{analyze_mapping, optimize};
