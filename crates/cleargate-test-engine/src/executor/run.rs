//! Core execution loop: admits ready units and collects their results.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::StreamExt;
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;

use super::ExecutorConfig;
use super::unit::{UnitFixtures, UnitJob, UnitReport, run_unit};
use crate::context::{Ambient, HookCtx, ScopeInfo};
use crate::dispatch::Dispatchers;
use crate::graph::{DependencyGraph, Readiness};
use crate::hooks::{
    BatchOutcome, HookRegistry, HookRunner, ScopeEntry, ScopeTracker, Transition, notify_scope,
};
use crate::lifecycle::FixtureManager;
use crate::run_event::{EventSink, RunEvent};
use crate::scheduler::{AdaptiveCeiling, Candidate, Scheduler, spawn_controller};
use crate::traits::LoadProbe;
use crate::types::*;

// ---------------------------------------------------------------------------
// Internal execution context
// ---------------------------------------------------------------------------

pub(crate) struct RunContext {
    pub run_id: String,
    pub graph: DependencyGraph,
    pub hooks: Arc<HookRegistry>,
    pub dispatchers: Arc<Dispatchers>,
    pub config: ExecutorConfig,
    pub load_probe: Arc<dyn LoadProbe>,
    pub events: EventSink,
    pub cancel_rx: oneshot::Receiver<()>,
    /// Nearest class-ancestry affinity, falling back to the assembly's.
    pub class_affinity: HashMap<String, String>,
    pub assembly_affinity: HashMap<String, String>,
}

/// State unit tasks share with the coordinator.
pub(crate) struct RunShared {
    pub run_id: String,
    pub hooks: Arc<HookRegistry>,
    pub runner: HookRunner,
    pub fixtures: FixtureManager,
    pub scopes: ScopeTracker,
    /// Root of every ambient; session hooks publish into it directly.
    pub session_ambient: Ambient,
    /// Parent of every body and Before hook token.
    pub cancel: CancellationToken,
    pub test_timeout: Option<Duration>,
    classes: HashMap<String, Arc<ClassDescriptor>>,
    class_affinity: HashMap<String, String>,
    assembly_affinity: HashMap<String, String>,
    /// Failures of class, assembly and session hooks.
    hook_failures: Mutex<Vec<HookFailureRecord>>,
}

impl RunShared {
    fn affinity(&self, info: &ScopeInfo) -> Option<&str> {
        match info.scope {
            HookScope::Class => info
                .class
                .as_ref()
                .and_then(|c| self.class_affinity.get(c)),
            HookScope::Assembly => info
                .assembly
                .as_ref()
                .and_then(|a| self.assembly_affinity.get(a)),
            _ => None,
        }
        .map(String::as_str)
    }

    fn receivers_for(&self, info: &ScopeInfo) -> Vec<Arc<dyn crate::traits::EventReceiver>> {
        match info.scope {
            HookScope::Class => self.hooks.receivers(info.class.as_deref()),
            _ => self.hooks.receivers(None),
        }
    }

    fn record(&self, outcome: &BatchOutcome) {
        if !outcome.failures.is_empty() {
            self.hook_failures
                .lock()
                .extend(outcome.failures.iter().cloned());
        }
    }

    /// Start receivers and the Before batch of a class, assembly or the
    /// session, around `ambient`.
    async fn open_scope(&self, info: &ScopeInfo, ambient: &Ambient) -> Option<String> {
        let ctx = HookCtx::scope(info.clone(), ambient.clone(), self.cancel.child_token());
        let receivers = self.receivers_for(info);
        let chain = self.hooks.chain(info.scope, HookTiming::Before, info);

        let mut outcome =
            notify_scope(&receivers, ReceiverStage::Early, Transition::Start, &ctx).await;
        outcome.merge(self.runner.run_batch(&chain, &ctx, self.affinity(info)).await);
        outcome.merge(notify_scope(&receivers, ReceiverStage::Late, Transition::Start, &ctx).await);
        self.record(&outcome);

        match outcome.fatal() {
            Some(fatal) => Some(format!(
                "{} hook `{}` failed: {}",
                info.scope, fatal.hook, fatal.message
            )),
            None => outcome.skip,
        }
    }

    /// End receivers and the After batch. Never cancelled by the run.
    async fn close_scope(&self, info: &ScopeInfo, ambient: &Ambient) {
        let ctx = HookCtx::scope(info.clone(), ambient.clone(), CancellationToken::new());
        let receivers = self.receivers_for(info);
        let chain = self.hooks.chain(info.scope, HookTiming::After, info);

        let mut outcome =
            notify_scope(&receivers, ReceiverStage::Early, Transition::End, &ctx).await;
        outcome.merge(self.runner.run_batch(&chain, &ctx, self.affinity(info)).await);
        outcome.merge(notify_scope(&receivers, ReceiverStage::Late, Transition::End, &ctx).await);
        self.record(&outcome);
    }

    /// Enter a class or assembly scope, running its Before batch if this
    /// unit is the first to get here.
    pub async fn enter_scope(&self, info: ScopeInfo, parent: &Ambient) -> ScopeEntry {
        let name = info.target();
        let entry = self
            .scopes
            .enter(info.scope, &name, || async {
                let ambient = parent.fork();
                let failure = self.open_scope(&info, &ambient).await;
                ScopeEntry { ambient, failure }
            })
            .await;
        entry.cloned().unwrap_or_else(|| ScopeEntry {
            ambient: parent.fork(),
            failure: None,
        })
    }

    /// Count `unit` out of its class, then its assembly, closing whichever
    /// it was the last unit of.
    pub async fn leave_scopes(&self, unit: &TestUnit) {
        if let Some(entry) = self.scopes.leave(HookScope::Class, unit.class_name()) {
            let ambient = entry.ambient.clone();
            self.close_scope(&ScopeInfo::class(&unit.class), &ambient).await;
        }
        if let Some(entry) = self.scopes.leave(HookScope::Assembly, unit.assembly()) {
            let ambient = entry.ambient.clone();
            self.close_scope(&ScopeInfo::assembly(unit.assembly()), &ambient)
                .await;
        }
    }

    pub async fn unit_started(&self, unit: &TestUnit, attempt: u32) {
        self.runner
            .events()
            .emit(RunEvent::UnitStarted {
                seq: 0,
                schema_version: RUN_EVENT_SCHEMA_VERSION,
                run_id: self.run_id.clone(),
                unit_id: unit.id.clone(),
                display_name: unit.display_name.clone(),
                attempt,
                timestamp: Utc::now(),
            })
            .await;
    }

    pub async fn unit_retrying(
        &self,
        unit: &TestUnit,
        attempt: u32,
        error: &TestError,
        backoff: Duration,
    ) {
        self.runner
            .events()
            .emit(RunEvent::UnitRetrying {
                seq: 0,
                schema_version: RUN_EVENT_SCHEMA_VERSION,
                run_id: self.run_id.clone(),
                unit_id: unit.id.clone(),
                attempt,
                error: error.to_string(),
                backoff_ms: backoff.as_millis() as u64,
                timestamp: Utc::now(),
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Core execution loop
// ---------------------------------------------------------------------------

type UnitTask = BoxFuture<'static, (usize, Result<UnitReport, tokio::task::JoinError>)>;

pub(crate) async fn execute_run(mut ctx: RunContext) -> RunSummary {
    let started_at = Utc::now();
    let clock = Instant::now();
    let graph = ctx.graph;
    let n = graph.len();
    let events = ctx.events.clone();

    tracing::info!(run_id = %ctx.run_id, units = n, "test run started");
    events
        .emit(RunEvent::RunStarted {
            seq: 0,
            schema_version: RUN_EVENT_SCHEMA_VERSION,
            run_id: ctx.run_id.clone(),
            total_units: n,
            max_parallelism: ctx.config.max_parallelism,
            timestamp: started_at,
        })
        .await;

    let shared = Arc::new(RunShared {
        run_id: ctx.run_id.clone(),
        hooks: Arc::clone(&ctx.hooks),
        runner: HookRunner::new(
            Arc::clone(&ctx.dispatchers),
            ctx.config.hook_timeout(),
            events.clone(),
        ),
        fixtures: FixtureManager::new(),
        scopes: ScopeTracker::new(graph.units().iter().map(|u| u.as_ref())),
        session_ambient: Ambient::new(),
        cancel: CancellationToken::new(),
        test_timeout: ctx.config.test_timeout(),
        classes: graph
            .units()
            .iter()
            .map(|u| (u.class_name().to_string(), Arc::clone(&u.class)))
            .collect(),
        class_affinity: ctx.class_affinity,
        assembly_affinity: ctx.assembly_affinity,
        hook_failures: Mutex::new(Vec::new()),
    });

    for unit in graph.units() {
        UnitFixtures::for_unit(unit).announce(&shared.fixtures);
    }

    let session_info = ScopeInfo::session();
    let session_failure = shared
        .open_scope(&session_info, &shared.session_ambient)
        .await;
    if let Some(reason) = &session_failure {
        tracing::warn!(run_id = %shared.run_id, %reason, "session setup failed");
    }

    // Adaptive ceiling.
    let controller_cancel = CancellationToken::new();
    let mut ceiling_rx: Option<watch::Receiver<usize>> = None;
    let controller = ctx.config.adaptive.clone().map(|adaptive| {
        let policy = AdaptiveCeiling::new(ctx.config.max_parallelism, adaptive);
        let (tx, rx) = watch::channel(policy.static_count());
        ceiling_rx = Some(rx);
        spawn_controller(
            policy,
            Arc::clone(&ctx.load_probe),
            tx,
            controller_cancel.clone(),
        )
    });

    let mut scheduler = Scheduler::new(
        graph.units().iter().map(|u| u.as_ref()),
        ctx.config.max_parallelism,
    );
    let mut outcomes: Vec<Option<Outcome>> = vec![None; n];
    let mut results: Vec<Option<TestResult>> = vec![None; n];
    let mut dispatched = vec![false; n];
    let mut running: FuturesUnordered<UnitTask> = FuturesUnordered::new();
    let mut cancelled = false;
    let mut halted = false;

    loop {
        if !cancelled && check_cancel(&mut ctx.cancel_rx) {
            cancelled = true;
            shared.cancel.cancel();
        }

        if !cancelled {
            let mut skips: HashMap<usize, Option<String>> = HashMap::new();
            let mut candidates = Vec::new();
            for i in (0..n).filter(|&i| !dispatched[i]) {
                let skip = if let Some(reason) = &session_failure {
                    Some(reason.clone())
                } else if halted {
                    Some("run stopped after the first failure".to_string())
                } else {
                    match graph.readiness(i, &outcomes) {
                        Readiness::Waiting => continue,
                        Readiness::Ready => graph.unit(i).skip.clone(),
                        Readiness::Blocked(reason) => Some(reason),
                    }
                };
                candidates.push(Candidate {
                    index: i,
                    unit: graph.unit(i).as_ref(),
                    light: skip.is_some(),
                });
                skips.insert(i, skip);
            }

            for i in scheduler.admit(&candidates) {
                dispatched[i] = true;
                let unit = Arc::clone(graph.unit(i));
                tracing::debug!(unit_id = %unit.id, "unit admitted");
                let job = UnitJob {
                    index: i,
                    dependencies: graph.dependency_records(i, &outcomes),
                    skip: skips.remove(&i).flatten(),
                    unit,
                };
                let handle = tokio::spawn(run_unit(Arc::clone(&shared), job));
                running.push(async move { (i, handle.await) }.boxed());
            }
        }

        if running.is_empty() {
            let pending: Vec<usize> = (0..n).filter(|&i| !dispatched[i]).collect();
            if pending.is_empty() || cancelled {
                break;
            }
            // Nothing in flight and nothing admissible.
            tracing::warn!(
                run_id = %shared.run_id,
                pending = pending.len(),
                "scheduling deadlock"
            );
            for i in pending {
                let unit = graph.unit(i);
                let reason = format!(
                    "scheduling deadlock: {} could not be admitted while nothing was running",
                    unit.id
                );
                let result = never_ran(unit, Outcome::failed(FailureKind::Deadlock, reason));
                abandon(&shared, &mut scheduler, unit).await;
                finish(&events, &mut outcomes, &mut results, &mut dispatched, i, result).await;
            }
            continue;
        }

        tokio::select! {
            Some((i, joined)) = running.next() => {
                scheduler.complete(i);
                let result = match joined {
                    Ok(report) => report.result,
                    Err(e) => never_ran(
                        graph.unit(i),
                        Outcome::failed(FailureKind::Body, format!("unit task panicked: {e}")),
                    ),
                };
                if result.outcome.is_failed() && ctx.config.fail_fast && !halted {
                    tracing::info!(unit_id = %result.unit_id, "fail-fast: stopping run");
                    halted = true;
                }
                finish(&events, &mut outcomes, &mut results, &mut dispatched, i, result).await;
            }
            _ = &mut ctx.cancel_rx, if !cancelled => {
                cancelled = true;
                shared.cancel.cancel();
            }
            changed = ceiling_changed(&mut ceiling_rx) => match changed {
                Some(ceiling) => scheduler.set_ceiling(ceiling),
                None => ceiling_rx = None,
            },
        }
    }

    // Units never dispatched because of cancellation.
    let undispatched: Vec<usize> = (0..n).filter(|&i| !dispatched[i]).collect();
    for i in undispatched {
        let unit = graph.unit(i);
        let result = never_ran(unit, Outcome::failed(FailureKind::Cancelled, "run cancelled"));
        abandon(&shared, &mut scheduler, unit).await;
        finish(&events, &mut outcomes, &mut results, &mut dispatched, i, result).await;
    }

    for (scope, name, entry) in shared.scopes.unfinished() {
        let info = match scope {
            HookScope::Class => match shared.classes.get(&name) {
                Some(class) => ScopeInfo::class(class),
                None => continue,
            },
            _ => ScopeInfo::assembly(name),
        };
        shared.close_scope(&info, &entry.ambient).await;
    }
    shared
        .close_scope(&session_info, &shared.session_ambient)
        .await;
    shared.fixtures.shutdown().await;

    controller_cancel.cancel();
    if let Some(controller) = controller {
        let _ = controller.await;
    }

    let results: Vec<TestResult> = results.into_iter().flatten().collect();
    let hook_failures = std::mem::take(&mut *shared.hook_failures.lock());
    let status = if cancelled {
        RunStatus::Cancelled
    } else if results.iter().any(|r| r.outcome.is_failed()) || hook_failures.iter().any(|f| f.fatal)
    {
        RunStatus::Failed
    } else {
        RunStatus::Completed
    };

    let summary = RunSummary {
        run_id: shared.run_id.clone(),
        status,
        results,
        hook_failures,
        started_at,
        completed_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
    };
    tracing::info!(
        run_id = %summary.run_id,
        status = ?summary.status,
        passed = summary.passed(),
        failed = summary.failed(),
        skipped = summary.skipped(),
        "test run finished"
    );
    events
        .emit(RunEvent::RunCompleted {
            seq: 0,
            schema_version: RUN_EVENT_SCHEMA_VERSION,
            run_id: summary.run_id.clone(),
            status: summary.status,
            passed: summary.passed(),
            failed: summary.failed(),
            skipped: summary.skipped(),
            duration_ms: summary.duration_ms,
            timestamp: summary.completed_at,
        })
        .await;
    events.flush().await;
    summary
}

async fn finish(
    events: &EventSink,
    outcomes: &mut [Option<Outcome>],
    results: &mut [Option<TestResult>],
    dispatched: &mut [bool],
    i: usize,
    result: TestResult,
) {
    dispatched[i] = true;
    outcomes[i] = Some(result.outcome.clone());
    events
        .emit(RunEvent::UnitCompleted {
            seq: 0,
            schema_version: RUN_EVENT_SCHEMA_VERSION,
            run_id: events.run_id().to_string(),
            result: result.clone(),
            timestamp: result.completed_at,
        })
        .await;
    results[i] = Some(result);
}

/// Withdraw a unit that will never be dispatched.
async fn abandon(shared: &RunShared, scheduler: &mut Scheduler, unit: &TestUnit) {
    scheduler.forfeit(unit);
    for key in UnitFixtures::for_unit(unit).keys() {
        shared.fixtures.forfeit(key).await;
    }
}

fn never_ran(unit: &TestUnit, outcome: Outcome) -> TestResult {
    TestResult {
        unit_id: unit.id.clone(),
        class: unit.class_name().to_string(),
        method: unit.method.clone(),
        display_name: unit.display_name.clone(),
        outcome,
        attempts: 0,
        started_at: None,
        completed_at: Utc::now(),
        duration_ms: 0,
        hook_failures: Vec::new(),
        output: String::new(),
    }
}

async fn ceiling_changed(rx: &mut Option<watch::Receiver<usize>>) -> Option<usize> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => std::future::pending().await,
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

fn check_cancel(cancel_rx: &mut oneshot::Receiver<()>) -> bool {
    matches!(
        cancel_rx.try_recv(),
        Ok(()) | Err(oneshot::error::TryRecvError::Closed)
    )
}
