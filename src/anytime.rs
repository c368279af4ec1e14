//! Anytime solving: re-run a model round after round, each round asked to beat the best objective so far, until the
//! time budget is spent or a round proves the incumbent optimal.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::params::{Assignment, ProblemParams};
use crate::phase2::BadnessTally;

/// A new incumbent must beat the previous one by more than this.
pub const IMPROVEMENT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    One,
    Two,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::One => write!(f, "Phase 1"),
            Phase::Two => write!(f, "Phase 2"),
        }
    }
}

/// A complete feasible mapping for the groups of one model.
#[derive(Debug, Clone, PartialEq)]
pub struct Incumbent {
    pub objective: f64,
    pub assignment: Assignment,
    /// Per-category badness, only known for Phase-2 solutions.
    pub tally: Option<BadnessTally>,
    pub proven_optimal: bool,
}

/// What a single solver round produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RoundOutcome {
    /// No mapping exists, or none below the requested bound.
    Infeasible,
    /// The round ran out of time without a usable mapping.
    NoIncumbent,
    Incumbent(Incumbent),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SolveOutcome {
    Infeasible,
    NoSolution,
    Solved(Incumbent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDecision {
    Keep,
    /// Replace the total budget, measured from the start of the run.
    SetTotal(Duration),
}

/// Notified of every improving incumbent.
pub trait IncumbentSink {
    fn on_incumbent(&mut self, incumbent: &Incumbent, elapsed: Duration) -> Result<BudgetDecision>;
}

impl<T: IncumbentSink + ?Sized> IncumbentSink for &mut T {
    fn on_incumbent(&mut self, incumbent: &Incumbent, elapsed: Duration) -> Result<BudgetDecision> {
        (**self).on_incumbent(incumbent, elapsed)
    }
}

/// Phase-1 budget rule: every improvement buys `bonus` more time, never less than `min_time` in total and never
/// more than `ceiling`.
#[derive(Debug, Clone)]
pub struct ExtendBudget {
    pub min_time: Duration,
    pub bonus: Duration,
    pub ceiling: Duration,
}

impl IncumbentSink for ExtendBudget {
    fn on_incumbent(&mut self, incumbent: &Incumbent, elapsed: Duration) -> Result<BudgetDecision> {
        let total = (elapsed + self.bonus).max(self.min_time).min(self.ceiling);
        debug!(
            "Incumbent {:.4} after {:.2?}, budget now {:.2?}",
            incumbent.objective, elapsed, total
        );
        Ok(BudgetDecision::SetTotal(total))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotAnalysis {
    #[serde(flatten)]
    tally: BadnessTally,
    objective: f64,
}

fn snapshot_paths(dir: &Path, k: usize) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("Fixed{}_best_solution.json", k)),
        dir.join(format!("Fixed{}_analysis.json", k)),
    )
}

/// Phase-2 sink: write every incumbent of the worker seeded by subset size `k` to disk so that it survives a
/// crashed worker.
pub struct PersistSnapshot<'a> {
    params: &'a ProblemParams,
    dir: Option<PathBuf>,
    k: usize,
}

impl<'a> PersistSnapshot<'a> {
    pub fn new(params: &'a ProblemParams, dir: Option<PathBuf>, k: usize) -> Self {
        PersistSnapshot { params, dir, k }
    }

    fn write(&self, dir: &Path, incumbent: &Incumbent) -> Result<()> {
        fs::create_dir_all(dir)?;
        let (mapping_path, analysis_path) = snapshot_paths(dir, self.k);
        let mapping = self.params.named(&incumbent.assignment);
        fs::write(&mapping_path, serde_json::to_string_pretty(&mapping)?)?;
        let analysis = SnapshotAnalysis {
            tally: incumbent.tally.unwrap_or_default(),
            objective: incumbent.objective,
        };
        fs::write(&analysis_path, serde_json::to_string_pretty(&analysis)?)?;
        Ok(())
    }
}

impl IncumbentSink for PersistSnapshot<'_> {
    fn on_incumbent(&mut self, incumbent: &Incumbent, elapsed: Duration) -> Result<BudgetDecision> {
        match &self.dir {
            Some(dir) => {
                if let Err(e) = self.write(dir, incumbent) {
                    warn!("Could not write snapshot for k={}: {}", self.k, e);
                } else {
                    debug!("Snapshot for k={} written after {:.2?}", self.k, elapsed);
                }
            }
            None => info!(
                "Phase 2 (k={}) incumbent {:.4} after {:.2?}",
                self.k, incumbent.objective, elapsed
            ),
        }
        Ok(BudgetDecision::Keep)
    }
}

/// Remove snapshots a previous run left behind for subset size `k`.
pub fn clear_snapshot(dir: &Path, k: usize) -> Result<()> {
    let (mapping_path, analysis_path) = snapshot_paths(dir, k);
    for path in [mapping_path, analysis_path] {
        if path.exists() {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Load the last snapshot written for subset size `k`, if there is one.
pub fn read_snapshot(params: &ProblemParams, dir: &Path, k: usize) -> Result<Option<Incumbent>> {
    let (mapping_path, analysis_path) = snapshot_paths(dir, k);
    if !mapping_path.exists() || !analysis_path.exists() {
        return Ok(None);
    }
    let mapping = serde_json::from_str(&fs::read_to_string(&mapping_path)?)?;
    let analysis: SnapshotAnalysis = serde_json::from_str(&fs::read_to_string(&analysis_path)?)?;
    let assignment = params.resolve_mapping(&mapping)?;
    Ok(Some(Incumbent {
        objective: analysis.objective,
        assignment,
        tally: Some(analysis.tally),
        proven_optimal: false,
    }))
}

pub struct AnytimeDriver<S> {
    phase: Phase,
    budget: Duration,
    ceiling: Duration,
    sink: S,
    best: Option<Incumbent>,
}

impl<S: IncumbentSink> AnytimeDriver<S> {
    /// `budget` is the initial total time. A run that finds nothing within it is extended once to `ceiling`.
    pub fn new(phase: Phase, budget: Duration, ceiling: Duration, sink: S) -> Self {
        AnytimeDriver {
            phase,
            budget: budget.min(ceiling),
            ceiling,
            sink,
            best: None,
        }
    }

    /// Start from a known mapping; later rounds must beat it.
    pub fn with_warm_start(mut self, incumbent: Incumbent) -> Self {
        self.best = Some(incumbent);
        self
    }

    fn extend_once(&mut self, extended: &mut bool) -> bool {
        if *extended || self.ceiling <= self.budget {
            return false;
        }
        *extended = true;
        info!(
            "{}: no mapping after {:.2?}, extending the budget to {:.2?}",
            self.phase, self.budget, self.ceiling
        );
        self.budget = self.ceiling;
        true
    }

    /// Drive rounds of `round(limit, bound)` until the budget is spent. A round receives the remaining time and,
    /// once an incumbent exists, the objective it has to stay below.
    pub fn run<F>(mut self, mut round: F) -> Result<SolveOutcome>
    where
        F: FnMut(Duration, Option<f64>) -> Result<RoundOutcome>,
    {
        let start = Instant::now();
        let mut extended = false;
        loop {
            let elapsed = start.elapsed();
            if elapsed >= self.budget {
                if self.best.is_none() && self.extend_once(&mut extended) {
                    continue;
                }
                debug!("{}: budget of {:.2?} spent", self.phase, self.budget);
                break;
            }
            let limit = self.budget - elapsed;
            let bound = self.best.as_ref().map(|b| b.objective - IMPROVEMENT_TOLERANCE);

            match round(limit, bound)? {
                RoundOutcome::Infeasible => match self.best.as_mut() {
                    None => {
                        info!("{}: model is infeasible", self.phase);
                        return Ok(SolveOutcome::Infeasible);
                    }
                    Some(best) => {
                        info!("{}: nothing beats {:.4}, incumbent is optimal", self.phase, best.objective);
                        best.proven_optimal = true;
                        break;
                    }
                },
                RoundOutcome::NoIncumbent => {
                    if self.best.is_none() && self.extend_once(&mut extended) {
                        continue;
                    }
                    break;
                }
                RoundOutcome::Incumbent(incumbent) => {
                    if let Some(best) = self.best.as_mut() {
                        if incumbent.objective >= best.objective - IMPROVEMENT_TOLERANCE {
                            debug!(
                                "{}: round returned {:.4}, no better than {:.4}",
                                self.phase, incumbent.objective, best.objective
                            );
                            // an optimal round matching the incumbent proves it optimal too
                            let matches = incumbent.objective <= best.objective + IMPROVEMENT_TOLERANCE;
                            if incumbent.proven_optimal && matches {
                                best.proven_optimal = true;
                            }
                            break;
                        }
                    }
                    if let BudgetDecision::SetTotal(total) = self.sink.on_incumbent(&incumbent, start.elapsed())? {
                        self.budget = total.min(self.ceiling);
                    }
                    let done = incumbent.proven_optimal;
                    self.best = Some(incumbent);
                    if done {
                        break;
                    }
                }
            }
        }
        Ok(match self.best {
            Some(best) => SolveOutcome::Solved(best),
            None => SolveOutcome::NoSolution,
        })
    }
}
