//! Runs one Before/After batch and the receivers staged around it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::FutureExt;

use crate::context::{HookCtx, TestCtx};
use crate::dispatch::Dispatchers;
use crate::run_event::{EventSink, HookStatus, RunEvent};
use crate::traits::EventReceiver;
use crate::types::*;

/// What a batch left behind.
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub failures: Vec<HookFailureRecord>,
    /// Set when a Before hook asked for the scope to be skipped.
    pub skip: Option<String>,
}

impl BatchOutcome {
    /// First failure that fails the scope.
    pub fn fatal(&self) -> Option<&HookFailureRecord> {
        self.failures.iter().find(|f| f.fatal)
    }

    pub fn merge(&mut self, other: BatchOutcome) {
        self.failures.extend(other.failures);
        if self.skip.is_none() {
            self.skip = other.skip;
        }
    }
}

/// Whether receivers are told about a start or an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Transition {
    Start,
    End,
}

impl Transition {
    fn timing(self) -> HookTiming {
        match self {
            Transition::Start => HookTiming::Before,
            Transition::End => HookTiming::After,
        }
    }
}

pub(crate) struct HookRunner {
    dispatchers: Arc<Dispatchers>,
    default_timeout: Option<Duration>,
    events: EventSink,
}

impl HookRunner {
    pub fn new(
        dispatchers: Arc<Dispatchers>,
        default_timeout: Option<Duration>,
        events: EventSink,
    ) -> Self {
        Self {
            dispatchers,
            default_timeout,
            events,
        }
    }

    pub fn dispatchers(&self) -> &Arc<Dispatchers> {
        &self.dispatchers
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    /// Run `hooks` one after another. Every hook runs even when an earlier
    /// one failed; a skip predicate only removes its own hook.
    ///
    /// Each hook gets a child of `ctx`'s token, cancelled if the hook times
    /// out. `fallback_affinity` applies to hooks that declare none.
    pub async fn run_batch(
        &self,
        hooks: &[Arc<HookDescriptor>],
        ctx: &HookCtx,
        fallback_affinity: Option<&str>,
    ) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let target = ctx.info().target();
        for hook in hooks {
            if let Some(condition) = &hook.skip {
                if let Some(reason) = condition.evaluate(ctx.info()).await {
                    tracing::debug!(hook = %hook.name, %target, %reason, "hook skipped");
                    self.emit(hook, &target, HookStatus::Skipped, 0, Some(reason))
                        .await;
                    continue;
                }
            }

            let started = Instant::now();
            let token = ctx.cancellation().child_token();
            let hook_ctx = ctx.with_cancel(token.clone());
            let body = Arc::clone(&hook.body);
            let work = async move { body.run(&hook_ctx).await }.boxed();
            let affinity = hook.affinity.as_deref().or(fallback_affinity);
            let running = self.dispatchers.run(affinity, work);

            let guarded = async {
                tokio::select! {
                    result = running => result,
                    _ = token.cancelled() => Err(TestError::cancelled()),
                }
            };
            let result = match hook.timeout.or(self.default_timeout) {
                Some(limit) => match tokio::time::timeout(limit, guarded).await {
                    Ok(result) => result,
                    Err(_) => {
                        token.cancel();
                        Err(TestError::timeout(limit))
                    }
                },
                None => guarded.await,
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            match result {
                Ok(()) => {
                    self.emit(hook, &target, HookStatus::Passed, duration_ms, None)
                        .await;
                }
                Err(e) if e.is_skip() && hook.timing == HookTiming::Before => {
                    self.emit(
                        hook,
                        &target,
                        HookStatus::Skipped,
                        duration_ms,
                        Some(e.message.clone()),
                    )
                    .await;
                    if outcome.skip.is_none() {
                        outcome.skip = Some(e.message);
                    }
                }
                Err(e) => {
                    let timed_out = e.is(TestError::TIMEOUT);
                    tracing::warn!(
                        hook = %hook.name,
                        scope = %hook.scope,
                        %target,
                        error = %e,
                        "hook failed"
                    );
                    let status = if timed_out {
                        HookStatus::TimedOut
                    } else {
                        HookStatus::Failed
                    };
                    self.emit(hook, &target, status, duration_ms, Some(e.to_string()))
                        .await;
                    outcome.failures.push(HookFailureRecord {
                        hook: hook.name.clone(),
                        scope: hook.scope,
                        timing: hook.timing,
                        target: target.clone(),
                        message: e.to_string(),
                        timed_out,
                        fatal: hook.on_failure == HookFailurePolicy::FailScope,
                    });
                }
            }
        }
        outcome
    }

    async fn emit(
        &self,
        hook: &HookDescriptor,
        target: &str,
        status: HookStatus,
        duration_ms: u64,
        message: Option<String>,
    ) {
        self.events
            .emit(RunEvent::HookCompleted {
                seq: 0,
                schema_version: RUN_EVENT_SCHEMA_VERSION,
                run_id: self.events.run_id().to_string(),
                hook: hook.name.clone(),
                scope: hook.scope,
                timing: hook.timing,
                target: target.to_string(),
                status,
                duration_ms,
                message,
                timestamp: Utc::now(),
            })
            .await;
    }
}

// ---------------------------------------------------------------------------
// Receivers
// ---------------------------------------------------------------------------

/// Test start/end callbacks of the receivers in `stage`, in order. Errors
/// fail the test like a Before/After hook would.
pub(crate) async fn notify_test(
    receivers: &[Arc<dyn EventReceiver>],
    stage: ReceiverStage,
    transition: Transition,
    ctx: &TestCtx,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for receiver in receivers.iter().filter(|r| r.stage() == stage) {
        let result = match transition {
            Transition::Start => receiver.on_test_start(ctx).await,
            Transition::End => receiver.on_test_end(ctx).await,
        };
        if let Err(e) = result {
            record_receiver_failure(
                &mut outcome,
                receiver.as_ref(),
                HookScope::Test,
                transition,
                ctx.id().to_string(),
                e,
            );
        }
    }
    outcome
}

/// Scope start/end callbacks for classes, assemblies and the session.
pub(crate) async fn notify_scope(
    receivers: &[Arc<dyn EventReceiver>],
    stage: ReceiverStage,
    transition: Transition,
    ctx: &HookCtx,
) -> BatchOutcome {
    let mut outcome = BatchOutcome::default();
    for receiver in receivers.iter().filter(|r| r.stage() == stage) {
        let result = match transition {
            Transition::Start => receiver.on_scope_start(ctx).await,
            Transition::End => receiver.on_scope_end(ctx).await,
        };
        if let Err(e) = result {
            record_receiver_failure(
                &mut outcome,
                receiver.as_ref(),
                ctx.scope_kind(),
                transition,
                ctx.info().target(),
                e,
            );
        }
    }
    outcome
}

fn record_receiver_failure(
    outcome: &mut BatchOutcome,
    receiver: &dyn EventReceiver,
    scope: HookScope,
    transition: Transition,
    target: String,
    error: TestError,
) {
    if error.is_skip() && transition == Transition::Start {
        if outcome.skip.is_none() {
            outcome.skip = Some(error.message);
        }
        return;
    }
    tracing::warn!(receiver = receiver.name(), %scope, %target, error = %error, "receiver failed");
    outcome.failures.push(HookFailureRecord {
        hook: receiver.name().to_string(),
        scope,
        timing: transition.timing(),
        target,
        message: error.to_string(),
        timed_out: false,
        fatal: true,
    });
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use tokio::sync::broadcast;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::context::{Ambient, ScopeInfo};
    use crate::dispatch::{InlineDispatcher, current_dispatcher};
    use crate::test_support::Recorder;
    use crate::traits::hook_fn;

    fn runner() -> (HookRunner, broadcast::Receiver<RunEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let mut dispatchers = Dispatchers::default();
        dispatchers.insert(Arc::new(InlineDispatcher::new("ui")));
        let runner = HookRunner::new(
            Arc::new(dispatchers),
            None,
            EventSink::new("r".into(), tx, Vec::new()),
        );
        (runner, rx)
    }

    fn session_ctx() -> HookCtx {
        HookCtx::scope(ScopeInfo::session(), Ambient::new(), CancellationToken::new())
    }

    fn recording(name: &str, recorder: &Recorder) -> HookDescriptor {
        let recorder = recorder.clone();
        let label = name.to_string();
        HookDescriptor::before(
            HookScope::TestSession,
            name,
            hook_fn(move |_| {
                let recorder = recorder.clone();
                let label = label.clone();
                async move {
                    recorder.push(label);
                    Ok(())
                }
            }),
        )
    }

    #[tokio::test]
    async fn failure_does_not_stop_siblings() {
        let (runner, _rx) = runner();
        let recorder = Recorder::default();
        let hooks = vec![
            Arc::new(HookDescriptor::before(
                HookScope::TestSession,
                "boom",
                hook_fn(|_| async { Err(TestError::failure("boom")) }),
            )),
            Arc::new(recording("after-boom", &recorder)),
        ];
        let outcome = runner.run_batch(&hooks, &session_ctx(), None).await;
        assert_eq!(recorder.events(), vec!["after-boom"]);
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.fatal().is_some());
    }

    #[tokio::test]
    async fn continue_policy_is_not_fatal() {
        let (runner, _rx) = runner();
        let hooks = vec![Arc::new(
            HookDescriptor::before(
                HookScope::TestSession,
                "soft",
                hook_fn(|_| async { Err(TestError::failure("meh")) }),
            )
            .continue_on_failure(),
        )];
        let outcome = runner.run_batch(&hooks, &session_ctx(), None).await;
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.fatal().is_none());
    }

    #[tokio::test]
    async fn skip_predicate_removes_only_its_hook() {
        let (runner, mut rx) = runner();
        let recorder = Recorder::default();
        let hooks = vec![
            Arc::new(
                recording("skipped", &recorder)
                    .skip_when(|_: &ScopeInfo| Some("not today".to_string())),
            ),
            Arc::new(recording("ran", &recorder)),
        ];
        let outcome = runner.run_batch(&hooks, &session_ctx(), None).await;
        assert!(outcome.failures.is_empty());
        assert_eq!(recorder.events(), vec!["ran"]);

        let RunEvent::HookCompleted { status, message, .. } = rx.recv().await.unwrap() else {
            panic!("expected hook event");
        };
        assert_eq!(status, HookStatus::Skipped);
        assert_eq!(message.as_deref(), Some("not today"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_cancels_only_the_hook() {
        let (runner, _rx) = runner();
        let observed = Arc::new(parking_lot::Mutex::new(false));
        let seen = observed.clone();
        let hooks = vec![Arc::new(
            HookDescriptor::before(
                HookScope::TestSession,
                "slow",
                hook_fn(move |ctx| {
                    let seen = seen.clone();
                    async move {
                        let token = ctx.cancellation().clone();
                        tokio::spawn(async move {
                            token.cancelled().await;
                            *seen.lock() = true;
                        });
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    }
                }),
            )
            .timeout(Duration::from_millis(50)),
        )];
        let ctx = session_ctx();
        let outcome = runner.run_batch(&hooks, &ctx, None).await;
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }

        assert!(outcome.failures[0].timed_out);
        assert!(*observed.lock());
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn fallback_affinity_applies() {
        let (runner, _rx) = runner();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let s = seen.clone();
        let hooks = vec![Arc::new(HookDescriptor::before(
            HookScope::TestSession,
            "where",
            hook_fn(move |_| {
                let s = s.clone();
                async move {
                    *s.lock() = current_dispatcher();
                    Ok(())
                }
            }),
        ))];
        runner.run_batch(&hooks, &session_ctx(), Some("ui")).await;
        assert_eq!(seen.lock().as_deref(), Some("ui"));
    }

    struct Staged {
        name: &'static str,
        stage: ReceiverStage,
        recorder: Recorder,
        fail: bool,
    }

    #[async_trait]
    impl EventReceiver for Staged {
        fn name(&self) -> &str {
            self.name
        }

        fn stage(&self) -> ReceiverStage {
            self.stage
        }

        async fn on_scope_start(&self, _ctx: &HookCtx) -> Result<(), TestError> {
            self.recorder.push(self.name);
            if self.fail {
                return Err(TestError::failure("receiver broke"));
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn receivers_run_by_stage() {
        let recorder = Recorder::default();
        let receivers: Vec<Arc<dyn EventReceiver>> = vec![
            Arc::new(Staged {
                name: "late",
                stage: ReceiverStage::Late,
                recorder: recorder.clone(),
                fail: true,
            }),
            Arc::new(Staged {
                name: "early",
                stage: ReceiverStage::Early,
                recorder: recorder.clone(),
                fail: false,
            }),
        ];
        let ctx = session_ctx();
        let early = notify_scope(&receivers, ReceiverStage::Early, Transition::Start, &ctx).await;
        recorder.push("hooks");
        let late = notify_scope(&receivers, ReceiverStage::Late, Transition::Start, &ctx).await;

        assert_eq!(recorder.events(), vec!["early", "hooks", "late"]);
        assert!(early.failures.is_empty());
        assert_eq!(late.fatal().map(|f| f.hook.as_str()), Some("late"));
    }
}
