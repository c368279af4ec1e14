use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, SchedulerError};

/// How Phase 1 finds its partial timetable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase1Strategy {
    /// Exact Phase-1 model only.
    Ilp,
    /// Exact Phase-1 model, seeded with a GRASP solution.
    IlpWithGrasp,
    /// GRASP replaces the Phase-1 model.
    Grasp,
}

/// Options passed through to HiGHS.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolverSettings {
    pub threads: i32,
    pub log_to_console: bool,
    pub mip_rel_gap: f64,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            log_to_console: false,
            mip_rel_gap: 1e-4,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SolverConfig {
    // Model parameters
    pub max_students_per_slot: u32,
    pub phase1_subset_sizes: Vec<usize>,
    pub phase1_strategy: Phase1Strategy,

    // Time budgets, in seconds
    pub phase1_min_seconds: f64,
    pub phase1_bonus_seconds: f64,
    pub phase1_max_seconds: f64,
    pub phase2_seconds: f64,
    pub grasp_seconds: f64,

    // Heuristic parameters
    pub grasp_workers: usize,
    pub grasp_smoothing: f64,
    pub seed: u64,

    // Runtime parameters
    pub snapshot_dir: Option<PathBuf>,
    pub solver: SolverSettings,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            max_students_per_slot: 1000,
            phase1_subset_sizes: vec![15, 20, 25, 30],
            phase1_strategy: Phase1Strategy::Ilp,

            phase1_min_seconds: 60.0,
            phase1_bonus_seconds: 30.0,
            phase1_max_seconds: 600.0,
            phase2_seconds: 600.0,
            grasp_seconds: 10.0,

            grasp_workers: num_cpus::get(),
            grasp_smoothing: 0.0,
            seed: 1234,

            snapshot_dir: None,
            solver: SolverSettings::default(),
        }
    }
}

impl SolverConfig {
    /// Environment variable naming a config file, consulted when no path is given explicitly.
    pub const ENV_VAR: &'static str = "EXAM_SCHEDULER_CONFIG";

    /// Tiny budgets for smoke tests and small instances.
    pub fn quick() -> Self {
        Self {
            phase1_subset_sizes: vec![10],
            phase1_min_seconds: 2.0,
            phase1_bonus_seconds: 1.0,
            phase1_max_seconds: 10.0,
            phase2_seconds: 10.0,
            grasp_seconds: 0.2,
            grasp_workers: 2,
            ..Default::default()
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: SolverConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the given path, else from the file named by [`Self::ENV_VAR`], else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_file(path);
        }
        match std::env::var_os(Self::ENV_VAR) {
            Some(path) => Self::from_file(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.phase1_subset_sizes.is_empty() || self.phase1_subset_sizes.contains(&0) {
            return Err(SchedulerError::Config(
                "phase1SubsetSizes must list at least one positive size".into(),
            ));
        }
        let budgets = [
            ("phase1MinSeconds", self.phase1_min_seconds),
            ("phase1BonusSeconds", self.phase1_bonus_seconds),
            ("phase1MaxSeconds", self.phase1_max_seconds),
            ("phase2Seconds", self.phase2_seconds),
            ("graspSeconds", self.grasp_seconds),
        ];
        for (name, seconds) in budgets {
            if !seconds.is_finite() || seconds <= 0.0 {
                return Err(SchedulerError::Config(format!("{} must be positive", name)));
            }
        }
        if self.phase1_max_seconds < self.phase1_min_seconds {
            return Err(SchedulerError::Config(
                "phase1MaxSeconds must not be below phase1MinSeconds".into(),
            ));
        }
        if !self.grasp_smoothing.is_finite() || self.grasp_smoothing < 0.0 {
            return Err(SchedulerError::Config("graspSmoothing must be non-negative".into()));
        }
        if self.grasp_workers == 0 {
            return Err(SchedulerError::Config("graspWorkers must be at least 1".into()));
        }
        if self.solver.threads < 1 {
            return Err(SchedulerError::Config("solver.threads must be at least 1".into()));
        }
        Ok(())
    }

    pub fn phase1_min_time(&self) -> Duration {
        Duration::from_secs_f64(self.phase1_min_seconds)
    }

    pub fn phase1_bonus(&self) -> Duration {
        Duration::from_secs_f64(self.phase1_bonus_seconds)
    }

    pub fn phase1_max_time(&self) -> Duration {
        Duration::from_secs_f64(self.phase1_max_seconds)
    }

    pub fn phase2_time(&self) -> Duration {
        Duration::from_secs_f64(self.phase2_seconds)
    }

    pub fn grasp_time(&self) -> Duration {
        Duration::from_secs_f64(self.grasp_seconds)
    }
}
