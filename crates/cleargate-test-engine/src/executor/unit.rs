//! Execution of one test unit: scope entry, fixtures, the attempt loop and
//! teardown in the order the pipeline guarantees.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::run::RunShared;
use crate::context::{HookCtx, ResolvedArg, ScopeInfo, TestCtx};
use crate::errors::FixtureError;
use crate::hooks::{Transition, notify_test};
use crate::lifecycle::{Consumer, FixtureKey, FixtureManager};
use crate::traits::{EventReceiver, Fixture};
use crate::types::*;

/// A unit the coordinator has admitted.
pub(crate) struct UnitJob {
    pub index: usize,
    pub unit: Arc<TestUnit>,
    pub dependencies: Vec<DependencyRecord>,
    /// Set when the unit only records a skip: static skip, blocked
    /// dependency, failed session or fail-fast.
    pub skip: Option<String>,
}

pub(crate) struct UnitReport {
    pub index: usize,
    pub result: TestResult,
}

// ---------------------------------------------------------------------------
// Fixture slots
// ---------------------------------------------------------------------------

struct FixtureSlot {
    key: FixtureKey,
    request: FixtureRequest,
    consumer: Consumer,
}

/// Every shared instance a unit consumes, in acquisition order: class
/// arguments, method arguments, then the class instance.
pub(crate) struct UnitFixtures {
    slots: Vec<FixtureSlot>,
    has_instance: bool,
}

impl UnitFixtures {
    pub fn for_unit(unit: &TestUnit) -> Self {
        let mut slots = Vec::new();
        let mut push = |slot: String, request: FixtureRequest| {
            let consumer = Consumer {
                slot,
                class: unit.class_name().to_string(),
                assembly: unit.assembly().to_string(),
            };
            slots.push(FixtureSlot {
                key: FixtureKey::resolve(&request, &consumer),
                request,
                consumer,
            });
        };
        for (i, arg) in unit.class_args.iter().enumerate() {
            if let Argument::Fixture(request) = arg {
                push(format!("{}/class/{i}", unit.id), request.clone());
            }
        }
        for (i, arg) in unit.method_args.iter().enumerate() {
            if let Argument::Fixture(request) = arg {
                push(format!("{}/arg/{i}", unit.id), request.clone());
            }
        }
        if let Some(factory) = &unit.instance {
            push(
                format!("{}/instance", unit.id),
                FixtureRequest::shared(Arc::clone(factory), SharingScope::None),
            );
        }
        Self {
            has_instance: unit.instance.is_some(),
            slots,
        }
    }

    /// Announce every slot to the manager, nested fixtures included.
    pub fn announce(&self, fixtures: &FixtureManager) {
        for slot in &self.slots {
            fixtures.expect_request(&slot.key, &slot.request, &slot.consumer);
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &FixtureKey> {
        self.slots.iter().map(|s| &s.key)
    }

    fn instance_key(&self) -> Option<&FixtureKey> {
        if self.has_instance {
            self.slots.last().map(|s| &s.key)
        } else {
            None
        }
    }

    fn argument_slots(&self) -> &[FixtureSlot] {
        let end = self.slots.len() - usize::from(self.has_instance);
        &self.slots[..end]
    }

    /// Acquire every slot. On failure nothing stays held and every slot
    /// not reached is forfeited.
    async fn acquire(&self, shared: &RunShared) -> Result<Vec<Arc<dyn Fixture>>, FixtureError> {
        let mut instances = Vec::with_capacity(self.slots.len());
        for (i, slot) in self.slots.iter().enumerate() {
            match shared
                .fixtures
                .acquire(&slot.key, &slot.request, &slot.consumer)
                .await
            {
                Ok((instance, _)) => instances.push(instance),
                Err(e) => {
                    for held in self.slots[..i].iter().rev() {
                        shared.fixtures.release(&held.key).await;
                    }
                    for rest in &self.slots[i + 1..] {
                        shared.fixtures.forfeit(&rest.key).await;
                    }
                    return Err(e);
                }
            }
        }
        Ok(instances)
    }

    async fn forfeit(&self, shared: &RunShared) {
        for slot in &self.slots {
            shared.fixtures.forfeit(&slot.key).await;
        }
    }
}

fn resolve_args(
    args: &[Argument],
    instances: &mut impl Iterator<Item = Arc<dyn Fixture>>,
) -> Vec<ResolvedArg> {
    args.iter()
        .map(|arg| match arg {
            Argument::Value(v) => ResolvedArg::Value(v.clone()),
            Argument::Fixture(_) => instances
                .next()
                .map(ResolvedArg::Fixture)
                .unwrap_or(ResolvedArg::Value(Value::Null)),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Unit task
// ---------------------------------------------------------------------------

pub(crate) async fn run_unit(shared: Arc<RunShared>, job: UnitJob) -> UnitReport {
    let UnitJob {
        index,
        unit,
        dependencies,
        skip,
    } = job;
    let fixtures = UnitFixtures::for_unit(&unit);
    let receivers = shared.hooks.receivers(Some(unit.class_name()));

    if let Some(reason) = skip {
        return skipped(&shared, index, unit, dependencies, &fixtures, &receivers, reason).await;
    }

    let assembly = shared
        .enter_scope(ScopeInfo::assembly(unit.assembly()), &shared.session_ambient)
        .await;
    if let Some(reason) = assembly.failure {
        return skipped(&shared, index, unit, dependencies, &fixtures, &receivers, reason).await;
    }
    let class = shared
        .enter_scope(ScopeInfo::class(&unit.class), &assembly.ambient)
        .await;
    if let Some(reason) = class.failure {
        return skipped(&shared, index, unit, dependencies, &fixtures, &receivers, reason).await;
    }

    let started_at = Utc::now();
    let clock = Instant::now();
    let instances = match fixtures.acquire(&shared).await {
        Ok(instances) => instances,
        Err(e) => {
            tracing::warn!(unit_id = %unit.id, error = %e, "fixture acquisition failed");
            shared.leave_scopes(&unit).await;
            let outcome = Outcome::failed(FailureKind::Fixture, e.to_string());
            return UnitReport {
                index,
                result: result_for(&unit, outcome, 0, Some(started_at), clock, Vec::new(), String::new()),
            };
        }
    };
    let mut instances = instances.into_iter();
    let class_args = resolve_args(&unit.class_args, &mut instances);
    let args = resolve_args(&unit.method_args, &mut instances);
    let instance = if fixtures.has_instance {
        instances.next()
    } else {
        None
    };

    let ctx = TestCtx::new(
        shared.run_id.clone(),
        Arc::clone(&unit),
        class_args,
        args,
        instance,
        class.ambient.fork(),
        dependencies,
        shared.cancel.child_token(),
    );

    let mut attempt = 0;
    let last = loop {
        attempt += 1;
        ctx.set_attempt(attempt);
        ctx.set_outcome(None);
        shared.unit_started(&unit, attempt).await;

        let outcome = run_attempt(&shared, &ctx, &receivers).await;
        let Some(error) = &outcome.error else {
            break outcome;
        };
        if ctx.is_cancelled() || !unit.retry.should_retry(error, attempt) {
            break outcome;
        }
        let backoff = unit.retry.backoff(attempt);
        tracing::debug!(unit_id = %unit.id, attempt, error = %error, "retrying unit");
        shared.unit_retrying(&unit, attempt, error, backoff).await;
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = ctx.cancellation().cancelled() => break outcome,
        }
    };

    // The instance goes only after every After(Test) hook has finished.
    if let Some(key) = fixtures.instance_key() {
        shared.fixtures.release(key).await;
    }
    shared.leave_scopes(&unit).await;
    for slot in fixtures.argument_slots().iter().rev() {
        shared.fixtures.release(&slot.key).await;
    }

    UnitReport {
        index,
        result: result_for(
            &unit,
            last.outcome,
            attempt,
            Some(started_at),
            clock,
            last.failures,
            ctx.output(),
        ),
    }
}

async fn skipped(
    shared: &RunShared,
    index: usize,
    unit: Arc<TestUnit>,
    dependencies: Vec<DependencyRecord>,
    fixtures: &UnitFixtures,
    receivers: &[Arc<dyn EventReceiver>],
    reason: String,
) -> UnitReport {
    let clock = Instant::now();
    fixtures.forfeit(shared).await;

    let ctx = TestCtx::new(
        shared.run_id.clone(),
        Arc::clone(&unit),
        Vec::new(),
        Vec::new(),
        None,
        shared.session_ambient.fork(),
        dependencies,
        shared.cancel.child_token(),
    );
    let outcome = Outcome::skipped(reason);
    ctx.set_outcome(Some(outcome.clone()));
    for receiver in receivers {
        receiver.on_test_skipped(&ctx).await;
    }
    shared.leave_scopes(&unit).await;

    UnitReport {
        index,
        result: result_for(&unit, outcome, 0, None, clock, Vec::new(), String::new()),
    }
}

fn result_for(
    unit: &TestUnit,
    outcome: Outcome,
    attempts: u32,
    started_at: Option<chrono::DateTime<Utc>>,
    clock: Instant,
    hook_failures: Vec<HookFailureRecord>,
    output: String,
) -> TestResult {
    TestResult {
        unit_id: unit.id.clone(),
        class: unit.class_name().to_string(),
        method: unit.method.clone(),
        display_name: unit.display_name.clone(),
        outcome,
        attempts,
        started_at,
        completed_at: Utc::now(),
        duration_ms: clock.elapsed().as_millis() as u64,
        hook_failures,
        output,
    }
}

// ---------------------------------------------------------------------------
// One attempt
// ---------------------------------------------------------------------------

struct Attempt {
    outcome: Outcome,
    /// What a retry policy is consulted with. `None` when the attempt
    /// passed, skipped or was cancelled.
    error: Option<TestError>,
    failures: Vec<HookFailureRecord>,
}

/// Early start receivers, Before(Test), late start receivers, body, then
/// the mirror image on the way out.
async fn run_attempt(
    shared: &RunShared,
    ctx: &TestCtx,
    receivers: &[Arc<dyn EventReceiver>],
) -> Attempt {
    let unit = ctx.unit();
    let affinity = unit.affinity.as_deref();
    let info = ctx.info();

    let hook_ctx = HookCtx::for_test(ctx);
    let mut before = notify_test(receivers, ReceiverStage::Early, Transition::Start, ctx).await;
    let chain = shared.hooks.chain(HookScope::Test, HookTiming::Before, &info);
    before.merge(shared.runner.run_batch(&chain, &hook_ctx, affinity).await);
    before.merge(notify_test(receivers, ReceiverStage::Late, Transition::Start, ctx).await);

    let (mut outcome, mut error) = if ctx.is_cancelled() {
        (cancelled(), None)
    } else if let Some(fatal) = before.fatal() {
        hook_failure("before", fatal)
    } else if let Some(reason) = before.skip.take() {
        (Outcome::skipped(reason), None)
    } else {
        run_body(shared, ctx).await
    };
    ctx.set_outcome(Some(outcome.clone()));

    // Teardown is not cut short by run cancellation.
    let end_ctx = ctx.with_cancel(CancellationToken::new());
    let end_hook_ctx = HookCtx::for_test(&end_ctx);
    let mut after = notify_test(receivers, ReceiverStage::Early, Transition::End, &end_ctx).await;
    let chain = shared.hooks.chain(HookScope::Test, HookTiming::After, &info);
    after.merge(shared.runner.run_batch(&chain, &end_hook_ctx, affinity).await);
    after.merge(notify_test(receivers, ReceiverStage::Late, Transition::End, &end_ctx).await);

    if outcome.is_passed() {
        if let Some(fatal) = after.fatal() {
            (outcome, error) = hook_failure("after", fatal);
            ctx.set_outcome(Some(outcome.clone()));
        }
    }
    before.merge(after);
    Attempt {
        outcome,
        error,
        failures: before.failures,
    }
}

fn hook_failure(stage: &str, fatal: &HookFailureRecord) -> (Outcome, Option<TestError>) {
    let error = TestError::new(
        "hook",
        format!("{stage} hook `{}` failed: {}", fatal.hook, fatal.message),
    );
    let outcome = Outcome::failed(
        FailureKind::Hook {
            hook: fatal.hook.clone(),
        },
        error.message.clone(),
    );
    (outcome, Some(error))
}

fn cancelled() -> Outcome {
    Outcome::failed(FailureKind::Cancelled, "run cancelled")
}

async fn run_body(shared: &RunShared, ctx: &TestCtx) -> (Outcome, Option<TestError>) {
    let unit = ctx.unit();
    let token = ctx.cancellation().child_token();
    let body_ctx = ctx.with_cancel(token.clone());
    let body = Arc::clone(&unit.body);
    let work = async move { body.run(&body_ctx).await }.boxed();
    let running = shared
        .runner
        .dispatchers()
        .run(unit.affinity.as_deref(), work);
    let guarded = async {
        tokio::select! {
            result = running => result,
            _ = token.cancelled() => Err(TestError::cancelled()),
        }
    };

    let result = match unit.timeout.or(shared.test_timeout) {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(result) => result,
            Err(_) => {
                token.cancel();
                let error = TestError::timeout(limit);
                let outcome = Outcome::failed(
                    FailureKind::Timeout {
                        after_ms: limit.as_millis() as u64,
                    },
                    error.message.clone(),
                );
                return (outcome, Some(error));
            }
        },
        None => guarded.await,
    };

    match result {
        Ok(()) => (Outcome::Passed, None),
        Err(e) if e.is_skip() => (Outcome::skipped(e.message), None),
        Err(e) if e.is(TestError::CANCELLED) && ctx.is_cancelled() => (cancelled(), None),
        Err(e) => (Outcome::failed(FailureKind::Body, e.to_string()), Some(e)),
    }
}
