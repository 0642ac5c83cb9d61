//! Engine: the single entry point for planning and running tests.
//!
//! ```rust,ignore
//! let engine = Engine::builder()
//!     .class(ClassDecl::new("Checkout").not_in_parallel("db"))
//!     .test(TestTemplate::new("Checkout", "pays", body_fn(|_| async { Ok(()) })))
//!     .build()?;
//!
//! let summary = engine.run().await?;
//! ```

mod builder;
pub mod error;

pub use builder::EngineBuilder;
pub use error::EngineError;

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, oneshot};

use crate::context::{Ambient, DiscoveryCtx, HookCtx, RegistrationCtx, ScopeInfo};
use crate::dispatch::Dispatchers;
use crate::errors::DiscoveryError;
use crate::executor::ExecutionHandle;
use crate::executor::run::{RunContext, execute_run};
use crate::expand::{ClassContext, expand_signature, expand_template};
use crate::graph::DependencyGraph;
use crate::hooks::{BatchOutcome, HookRegistry, HookRunner};
use crate::run_event::EventSink;
use crate::traits::{LoadProbe, Reporter};
use crate::types::*;

pub(crate) type UnitFilter = dyn Fn(&TestUnit) -> bool + Send + Sync;

/// Registered tests and the plug-ins that run them. Constructed via
/// [`Engine::builder()`]; reusable for any number of runs.
pub struct Engine {
    pub(super) classes: Arc<Vec<ClassDecl>>,
    pub(super) templates: Arc<Vec<TestTemplate>>,
    pub(super) hooks: Arc<HookRegistry>,
    pub(super) reporters: Vec<Arc<dyn Reporter>>,
    pub(super) dispatchers: Arc<Dispatchers>,
    pub(super) assembly_affinity: HashMap<String, String>,
    pub(super) filter: Option<Arc<UnitFilter>>,
    pub(super) config: crate::executor::ExecutorConfig,
    pub(super) load_probe: Arc<dyn LoadProbe>,
}

/// Expanded, validated units ready to run.
#[derive(Debug)]
pub struct TestPlan {
    graph: DependencyGraph,
    class_affinity: HashMap<String, String>,
}

impl TestPlan {
    /// Units in plan order.
    pub fn units(&self) -> &[Arc<TestUnit>] {
        self.graph.units()
    }

    pub fn len(&self) -> usize {
        self.graph.len()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.is_empty()
    }

    pub fn unit(&self, id: &str) -> Option<&TestUnit> {
        self.graph
            .index_of(&UnitId::new(id))
            .map(|i| self.graph.unit(i).as_ref())
    }

    /// Every unit `id` depends on, directly or transitively.
    pub fn dependencies(&self, id: &str) -> Vec<DependencyRecord> {
        let none = vec![None; self.graph.len()];
        self.graph
            .index_of(&UnitId::new(id))
            .map(|i| self.graph.dependency_records(i, &none))
            .unwrap_or_default()
    }
}

impl Engine {
    /// Create a new [`EngineBuilder`].
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &crate::executor::ExecutorConfig {
        &self.config
    }

    /// Run discovery: discovery hooks, data expansion, dependency
    /// resolution, filtering and registration callbacks.
    pub async fn plan(&self) -> Result<TestPlan, EngineError> {
        // Discovery hooks report through logs only; runs have their own sink.
        let (tx, _) = broadcast::channel(1);
        let runner = HookRunner::new(
            Arc::clone(&self.dispatchers),
            self.config.hook_timeout(),
            EventSink::new("discovery".to_string(), tx, Vec::new()),
        );
        let discovery = DiscoveryCtx::default();
        let hook_ctx = HookCtx::for_discovery(discovery.clone(), Ambient::new());
        let info = ScopeInfo::discovery();

        let before = self
            .hooks
            .chain(HookScope::TestDiscovery, HookTiming::Before, &info);
        discovery_hooks_passed(runner.run_batch(&before, &hook_ctx, None).await)?;

        let mut templates: Vec<TestTemplate> = self.templates.iter().cloned().collect();
        templates.extend(discovery.take_added());

        let classes: HashMap<&str, &ClassDecl> =
            self.classes.iter().map(|c| (c.name(), c)).collect();
        let mut contexts: HashMap<String, ClassContext> = HashMap::new();
        let mut units = Vec::new();
        let mut seq = 0;
        for template in &templates {
            let name = template.class_name();
            if !contexts.contains_key(name) {
                let decl = classes
                    .get(name)
                    .ok_or_else(|| DiscoveryError::UnknownClass {
                        name: name.to_string(),
                    })?;
                let context = self.class_context(decl, &classes).await?;
                contexts.insert(name.to_string(), context);
            }
            let Some(class) = contexts.get(name) else {
                continue;
            };
            for mut unit in expand_template(template, class, &mut seq).await? {
                if unit.skip.is_none() {
                    if let Some(condition) = unit.skip_when.clone() {
                        unit.skip = condition.evaluate(&ScopeInfo::test(&unit)).await;
                    }
                }
                units.push(Arc::new(unit));
            }
        }

        let mut graph = DependencyGraph::build(units)?;
        graph.check_order_conflicts()?;
        if let Some(filter) = &self.filter {
            let keep = graph.select_with_dependencies(|unit| filter(unit));
            graph = graph.retain(&keep)?;
        }

        for unit in graph.units() {
            if let Some(id) = &unit.affinity {
                if !self.dispatchers.contains(id) {
                    return Err(DiscoveryError::UnknownDispatcher { id: id.clone() }.into());
                }
            }
        }

        let none = vec![None; graph.len()];
        for i in 0..graph.len() {
            let unit = Arc::clone(graph.unit(i));
            let receivers = self.hooks.receivers(Some(unit.class_name()));
            if receivers.is_empty() {
                continue;
            }
            let mut registration = RegistrationCtx::new(
                ScopeInfo::test(&unit),
                graph.dependency_records(i, &none),
                unit.skip.clone(),
            );
            for receiver in &receivers {
                receiver.on_test_registered(&mut registration).await;
            }
            let skip = registration.into_skip();
            if skip != unit.skip {
                tracing::debug!(unit_id = %unit.id, reason = ?skip, "skip set at registration");
                graph.set_skip(i, skip);
            }
        }

        discovery.set_discovered(graph.units().iter().map(|u| ScopeInfo::test(u)).collect());
        let after = self
            .hooks
            .chain(HookScope::TestDiscovery, HookTiming::After, &info);
        discovery_hooks_passed(runner.run_batch(&after, &hook_ctx, None).await)?;

        tracing::info!(units = graph.len(), "test plan built");
        Ok(TestPlan {
            graph,
            class_affinity: contexts
                .into_iter()
                .filter_map(|(name, context)| context.affinity.map(|a| (name, a)))
                .collect(),
        })
    }

    async fn class_context(
        &self,
        decl: &ClassDecl,
        classes: &HashMap<&str, &ClassDecl>,
    ) -> Result<ClassContext, DiscoveryError> {
        let affinity = self
            .hooks
            .ancestry(decl.name())
            .iter()
            .rev()
            .find_map(|name| {
                classes
                    .get(name.as_str())
                    .and_then(|c| c.descriptor.affinity.clone())
            })
            .or_else(|| self.assembly_affinity.get(&decl.descriptor.assembly).cloned());
        let rows = expand_signature(decl.name(), &decl.ctor).await?;
        Ok(ClassContext {
            descriptor: Arc::new(decl.descriptor.clone()),
            decl: decl.clone(),
            affinity,
            rows,
        })
    }

    /// Plan and start a run. Returns immediately with an
    /// [`ExecutionHandle`] for live events and cancellation.
    pub async fn execute(&self) -> Result<ExecutionHandle, EngineError> {
        let plan = self.plan().await?;
        Ok(self.execute_plan(plan))
    }

    /// Start a run of an already built plan.
    pub fn execute_plan(&self, plan: TestPlan) -> ExecutionHandle {
        let run_id = uuid::Uuid::new_v4().to_string();
        let (tx, events) = broadcast::channel(self.config.event_channel_capacity.max(1));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let ctx = RunContext {
            run_id: run_id.clone(),
            graph: plan.graph,
            hooks: Arc::clone(&self.hooks),
            dispatchers: Arc::clone(&self.dispatchers),
            config: self.config.clone(),
            load_probe: Arc::clone(&self.load_probe),
            events: EventSink::new(run_id.clone(), tx, self.reporters.clone()),
            cancel_rx,
            class_affinity: plan.class_affinity,
            assembly_affinity: self.assembly_affinity.clone(),
        };
        let completion = tokio::spawn(execute_run(ctx));

        ExecutionHandle {
            run_id,
            events,
            cancel: Some(cancel_tx),
            completion,
        }
    }

    /// Plan, run and wait for the summary.
    pub async fn run(&self) -> Result<RunSummary, EngineError> {
        let handle = self.execute().await?;
        Ok(handle.wait().await?)
    }
}

fn discovery_hooks_passed(outcome: BatchOutcome) -> Result<(), DiscoveryError> {
    match outcome.fatal() {
        Some(failure) => Err(DiscoveryError::DiscoveryHook {
            hook: failure.hook.clone(),
            message: failure.message.clone(),
        }),
        None => Ok(()),
    }
}
