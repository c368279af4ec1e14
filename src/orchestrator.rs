//! Runs the two-phase search once per Phase-1 subset size in parallel and keeps the best complete timetable.

use log::{debug, info, warn};
use rand::SeedableRng;
use rand::rngs::SmallRng;
use std::collections::BTreeMap;
use std::sync::mpsc;
use std::thread;

use crate::analyze::analyze;
use crate::anytime::{
    AnytimeDriver, ExtendBudget, Incumbent, PersistSnapshot, Phase, SolveOutcome, clear_snapshot, read_snapshot,
};
use crate::config::{Phase1Strategy, SolverConfig};
use crate::constraints::Placement;
use crate::data::{AnalyzeInput, ConflictReport, PenaltyProfile, ScheduleInput, ScheduleOutput, SolveStatus};
use crate::error::{Result, SchedulerError};
use crate::grasp::{GraspProblem, GraspSolution};
use crate::params::{Assignment, GroupId, ProblemParams};
use crate::phase1::{Phase1Model, select_groups};
use crate::phase2::Phase2Model;

/// What one worker sends back when it is done.
#[derive(Debug)]
pub struct WorkerReport<T> {
    pub k: usize,
    pub result: Result<T>,
}

/// Run `work(k)` for every key on its own scoped thread and collect the reports in ascending `k` order. A panicking
/// worker is reported as [`SchedulerError::WorkerFailed`].
pub fn run_workers<T, F>(phase: Phase, keys: &[usize], work: F) -> Vec<WorkerReport<T>>
where
    T: Send,
    F: Fn(usize) -> Result<T> + Sync,
{
    let (tx, rx) = mpsc::channel();
    thread::scope(|scope| {
        let handles: Vec<_> = keys
            .iter()
            .map(|&k| {
                let tx = tx.clone();
                let work = &work;
                let handle = scope.spawn(move || {
                    let result = work(k);
                    // the receiver outlives the scope
                    let _ = tx.send(WorkerReport { k, result });
                });
                (k, handle)
            })
            .collect();
        for (k, handle) in handles {
            if handle.join().is_err() {
                warn!("{} worker for k={} panicked", phase, k);
                let _ = tx.send(WorkerReport {
                    k,
                    result: Err(SchedulerError::WorkerFailed {
                        k,
                        reason: "worker panicked".into(),
                    }),
                });
            }
        }
    });
    drop(tx);
    let mut reports: Vec<_> = rx.into_iter().collect();
    reports.sort_by_key(|r| r.k);
    reports
}

/// The usable results of one phase.
#[derive(Debug, Default)]
struct Collected {
    results: BTreeMap<usize, Incumbent>,
    failed: Vec<usize>,
    infeasible: bool,
}

/// Lowest objective, ties going to the smallest `k`.
fn pick_best(results: BTreeMap<usize, Incumbent>) -> Option<(usize, Incumbent)> {
    let mut best: Option<(usize, Incumbent)> = None;
    for (k, incumbent) in results {
        if best.as_ref().is_none_or(|(_, b)| incumbent.objective < b.objective) {
            best = Some((k, incumbent));
        }
    }
    best
}

pub struct Orchestrator<'a> {
    params: &'a ProblemParams,
    penalties: &'a PenaltyProfile,
    placement: &'a Placement,
    config: &'a SolverConfig,
    capacity: u32,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        params: &'a ProblemParams,
        penalties: &'a PenaltyProfile,
        placement: &'a Placement,
        config: &'a SolverConfig,
    ) -> Self {
        let capacity = config.max_students_per_slot.max(params.max_group_size());
        if capacity > config.max_students_per_slot {
            warn!(
                "Largest group has {} students, raising the slot capacity from {}",
                capacity, config.max_students_per_slot
            );
        }
        Orchestrator {
            params,
            penalties,
            placement,
            config,
            capacity,
        }
    }

    /// Configured subset sizes, clamped to the number of groups, sorted and deduplicated.
    pub fn subset_sizes(&self) -> Vec<usize> {
        let mut sizes: Vec<usize> = self
            .config
            .phase1_subset_sizes
            .iter()
            .map(|k| (*k).min(self.params.num_groups()))
            .collect();
        sizes.sort_unstable();
        sizes.dedup();
        sizes
    }

    pub fn run(&self) -> Result<ScheduleOutput> {
        if self.params.num_groups() == 0 {
            info!("No exam groups to schedule");
            let empty = Incumbent {
                objective: 0.0,
                assignment: Assignment::new(),
                tally: None,
                proven_optimal: true,
            };
            return Ok(self.output(None, empty, Vec::new()));
        }

        let sizes = self.subset_sizes();
        info!(
            "Phase 1 ({:?}) for subset sizes {:?} with capacity {}",
            self.config.phase1_strategy, sizes, self.capacity
        );
        let phase1 = self.collect(Phase::One, run_workers(Phase::One, &sizes, |k| self.phase1_worker(k)));
        if phase1.infeasible {
            return Ok(ScheduleOutput::infeasible());
        }
        if phase1.results.is_empty() {
            return Err(SchedulerError::AllWorkersFailed(sizes.len()));
        }

        let keys: Vec<usize> = phase1.results.keys().copied().collect();
        if let Some(dir) = &self.config.snapshot_dir {
            for &k in &keys {
                clear_snapshot(dir, k)?;
            }
        }
        info!("Phase 2 for subset sizes {:?}", keys);
        let reports = run_workers(Phase::Two, &keys, |k| match phase1.results.get(&k) {
            Some(partial) => self.phase2_worker(k, &partial.assignment),
            None => Err(SchedulerError::WorkerFailed {
                k,
                reason: "no Phase 1 result".into(),
            }),
        });
        let phase2 = self.collect(Phase::Two, reports);

        let mut failed = phase1.failed;
        failed.extend(phase2.failed);
        failed.sort_unstable();
        failed.dedup();

        match pick_best(phase2.results) {
            Some((k, best)) => {
                info!("Best timetable comes from k={} with objective {:.4}", k, best.objective);
                Ok(self.output(Some(k), best, failed))
            }
            None if phase2.infeasible => Ok(ScheduleOutput {
                failed_workers: failed,
                ..ScheduleOutput::infeasible()
            }),
            None => Err(SchedulerError::AllWorkersFailed(keys.len())),
        }
    }

    fn phase1_worker(&self, k: usize) -> Result<SolveOutcome> {
        let config = self.config;
        if config.phase1_strategy == Phase1Strategy::Grasp {
            let groups = select_groups(self.params, self.placement, k);
            let solution = self.grasp_search(k, &groups)?;
            info!("GRASP for k={} found cost {:.4}", k, solution.cost);
            return Ok(SolveOutcome::Solved(solution.into()));
        }

        let model = Phase1Model::new(
            self.params,
            self.penalties,
            self.placement,
            &config.solver,
            config.seed,
            k,
            self.capacity,
        );
        let sink = ExtendBudget {
            min_time: config.phase1_min_time(),
            bonus: config.phase1_bonus(),
            ceiling: config.phase1_max_time(),
        };
        let mut driver = AnytimeDriver::new(Phase::One, config.phase1_min_time(), config.phase1_max_time(), sink);
        let mut start = None;
        if config.phase1_strategy == Phase1Strategy::IlpWithGrasp {
            let grasp = GraspProblem::new(
                self.params,
                self.penalties,
                self.placement,
                model.groups(),
                self.capacity,
                config.grasp_smoothing,
            );
            let mut rng = SmallRng::seed_from_u64(config.seed.wrapping_add(k as u64));
            match grasp.run(&mut rng, config.grasp_time()) {
                Ok(solution) => {
                    info!("Warm start for k={} with GRASP cost {:.4}", k, solution.cost);
                    start = Some(solution.assignment.clone());
                    driver = driver.with_warm_start(solution.into());
                }
                Err(e) => warn!("GRASP warm start for k={} failed, starting cold: {}", k, e),
            }
        }
        // the first round searches from the GRASP mapping, later rounds must beat the incumbent
        driver.run(|limit, bound| match start.take() {
            Some(mapping) => model.solve_round_from(limit, &mapping),
            None => model.solve_round(limit, bound),
        })
    }

    fn phase2_worker(&self, k: usize, preplaced: &Assignment) -> Result<SolveOutcome> {
        let config = self.config;
        let model = Phase2Model::new(
            self.params,
            self.penalties,
            self.placement,
            &config.solver,
            config.seed,
            self.capacity,
            preplaced,
        );
        let sink = PersistSnapshot::new(self.params, config.snapshot_dir.clone(), k);
        AnytimeDriver::new(Phase::Two, config.phase2_time(), config.phase2_time(), sink)
            .run(|limit, bound| model.solve_round(limit, bound))
    }

    /// GRASP over `groups` on `grasp_workers` threads, seeded `seed + worker index`. Keeps the cheapest mapping.
    pub fn grasp_search(&self, k: usize, groups: &[GroupId]) -> Result<GraspSolution> {
        let config = self.config;
        let problem = GraspProblem::new(
            self.params,
            self.penalties,
            self.placement,
            groups,
            self.capacity,
            config.grasp_smoothing,
        );
        let workers = config.grasp_workers.max(1);
        let budget = config.grasp_time();

        let results: Vec<Result<GraspSolution>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|w| {
                    let problem = &problem;
                    let seed = config.seed.wrapping_add(w as u64);
                    scope.spawn(move || problem.run(&mut SmallRng::seed_from_u64(seed), budget))
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| {
                    handle.join().unwrap_or_else(|_| {
                        Err(SchedulerError::WorkerFailed {
                            k,
                            reason: "GRASP worker panicked".into(),
                        })
                    })
                })
                .collect()
        });

        let mut best: Option<GraspSolution> = None;
        let mut first_error = None;
        for result in results {
            match result {
                Ok(solution) => {
                    if best.as_ref().is_none_or(|b| solution.cost < b.cost) {
                        best = Some(solution);
                    }
                }
                Err(e) => {
                    debug!("GRASP worker for k={} failed: {}", k, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        best.ok_or_else(|| first_error.unwrap_or(SchedulerError::AllWorkersFailed(workers)))
    }

    fn collect(&self, phase: Phase, reports: Vec<WorkerReport<SolveOutcome>>) -> Collected {
        let mut collected = Collected::default();
        for report in reports {
            let k = report.k;
            match report.result {
                Ok(SolveOutcome::Solved(incumbent)) => {
                    debug!("{} worker for k={} returned {:.4}", phase, k, incumbent.objective);
                    collected.results.insert(k, incumbent);
                    continue;
                }
                Ok(SolveOutcome::Infeasible) => {
                    info!("{} model for k={} is infeasible", phase, k);
                    collected.infeasible = true;
                    continue;
                }
                Ok(SolveOutcome::NoSolution) => warn!("{} worker for k={} found no mapping in time", phase, k),
                Err(e) => warn!("{} worker for k={} failed: {}", phase, k, e),
            }
            collected.failed.push(k);
            if let Some(recovered) = self.recover(phase, k) {
                collected.results.insert(k, recovered);
            }
        }
        collected
    }

    /// The last persisted Phase-2 incumbent of a failed worker.
    fn recover(&self, phase: Phase, k: usize) -> Option<Incumbent> {
        let dir = self.config.snapshot_dir.as_ref().filter(|_| phase == Phase::Two)?;
        match read_snapshot(self.params, dir, k) {
            Ok(Some(incumbent)) => {
                info!("Recovered snapshot for k={} with objective {:.4}", k, incumbent.objective);
                Some(incumbent)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Could not read snapshot for k={}: {}", k, e);
                None
            }
        }
    }

    fn output(&self, k: Option<usize>, best: Incumbent, failed: Vec<usize>) -> ScheduleOutput {
        let report = analyze(self.params, &best.assignment);
        let analyzed = report.weighted_penalty(self.penalties);
        if (analyzed - best.objective).abs() > 1e-6 {
            debug!(
                "Analyzed penalty {:.4} differs from the model objective {:.4}",
                analyzed, best.objective
            );
        }
        ScheduleOutput {
            status: SolveStatus::Optimized,
            group_to_slot: self.params.named(&best.assignment),
            objective: Some(best.objective),
            phase1_size: k,
            failed_workers: failed,
            report: Some(report),
        }
    }
}

/// Derive the tables, validate the constraints and run the full search.
pub fn optimize(input: &ScheduleInput, config: &SolverConfig) -> Result<ScheduleOutput> {
    config.validate()?;
    input.penalties.validate()?;
    let params = ProblemParams::derive(&input.semester, &input.students, &input.courses)?;
    let placement = Placement::resolve(&input.constraints, &input.policies, &params)?;
    info!(
        "Scheduling {} groups for {} students over {} slots",
        params.num_groups(),
        params.students().len(),
        params.calendar.num_slots()
    );
    if let Some(g) = placement.first_unplaceable(&params) {
        warn!("Group `{}` has no allowed slot left", params.group_name(g));
        return Ok(ScheduleOutput::infeasible());
    }
    Orchestrator::new(&params, &input.penalties, &placement, config).run()
}

/// Analyze a given group-to-slot mapping without optimizing.
pub fn analyze_mapping(input: &AnalyzeInput) -> Result<ConflictReport> {
    let schedule = &input.schedule;
    let params = ProblemParams::derive(&schedule.semester, &schedule.students, &schedule.courses)?;
    let assignment = params.resolve_mapping(&input.group_to_slot)?;
    Ok(analyze(&params, &assignment))
}
