//! Engine builder: collects classes, tests, hooks and plug-ins.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::error::EngineError;
use super::{Engine, UnitFilter};
use crate::defaults::LoadAvgProbe;
use crate::dispatch::Dispatchers;
use crate::errors::DiscoveryError;
use crate::executor::ExecutorConfig;
use crate::hooks::HookRegistry;
use crate::traits::{Dispatcher, EventReceiver, LoadProbe, Reporter};
use crate::types::{ClassDecl, HookDescriptor, HookLevel, TestTemplate, TestUnit};

/// Builder for assembling the [`Engine`].
///
/// Plug-in slots are optional; defaults are applied during
/// [`build()`](EngineBuilder::build).
pub struct EngineBuilder {
    classes: Vec<ClassDecl>,
    templates: Vec<TestTemplate>,
    hooks: Vec<HookDescriptor>,
    receivers: Vec<Arc<dyn EventReceiver>>,
    reporters: Vec<Arc<dyn Reporter>>,
    dispatchers: Dispatchers,
    assembly_affinity: HashMap<String, String>,
    filter: Option<Arc<UnitFilter>>,
    executor_config: ExecutorConfig,
    load_probe: Option<Arc<dyn LoadProbe>>,
}

impl EngineBuilder {
    pub(super) fn new() -> Self {
        Self {
            classes: Vec::new(),
            templates: Vec::new(),
            hooks: Vec::new(),
            receivers: Vec::new(),
            reporters: Vec::new(),
            dispatchers: Dispatchers::default(),
            assembly_affinity: HashMap::new(),
            filter: None,
            executor_config: ExecutorConfig::default(),
            load_probe: None,
        }
    }

    /// Register a test class.
    pub fn class(mut self, class: ClassDecl) -> Self {
        self.classes.push(class);
        self
    }

    /// Register a test method. Its class must be registered too.
    pub fn test(mut self, template: TestTemplate) -> Self {
        self.templates.push(template);
        self
    }

    pub fn hook(mut self, hook: HookDescriptor) -> Self {
        self.hooks.push(hook);
        self
    }

    /// Register an event receiver that applies to every test and scope.
    pub fn receiver(mut self, receiver: impl EventReceiver + 'static) -> Self {
        self.receivers.push(Arc::new(receiver));
        self
    }

    pub fn reporter(mut self, reporter: impl Reporter + 'static) -> Self {
        self.reporters.push(Arc::new(reporter));
        self
    }

    /// Same as [`reporter`](Self::reporter), for a reporter the caller
    /// keeps a handle to.
    pub fn shared_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporters.push(reporter);
        self
    }

    /// Register a dispatcher affinities can name. Keyed by `id()`.
    pub fn dispatcher(mut self, dispatcher: impl Dispatcher + 'static) -> Self {
        self.dispatchers.insert(Arc::new(dispatcher));
        self
    }

    /// Pin every class of `assembly` that declares no affinity of its own.
    pub fn assembly_affinity(
        mut self,
        assembly: impl Into<String>,
        dispatcher: impl Into<String>,
    ) -> Self {
        self.assembly_affinity
            .insert(assembly.into(), dispatcher.into());
        self
    }

    /// Run only the units `filter` accepts, plus everything they depend on.
    pub fn filter(mut self, filter: impl Fn(&TestUnit) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    /// Set executor configuration. Default: [`ExecutorConfig::default()`].
    pub fn executor_config(mut self, config: ExecutorConfig) -> Self {
        self.executor_config = config;
        self
    }

    /// Set the CPU signal for the adaptive ceiling. Default: [`LoadAvgProbe`].
    pub fn load_probe(mut self, probe: impl LoadProbe + 'static) -> Self {
        self.load_probe = Some(Arc::new(probe));
        self
    }

    /// Validate registrations and assemble the engine.
    ///
    /// Class ancestry and every affinity known at this point are checked
    /// here; method affinities are checked when planning.
    pub fn build(self) -> Result<Engine, EngineError> {
        if self.executor_config.max_parallelism == 0 {
            return Err(EngineError::Build {
                message: "max_parallelism must be at least 1".to_string(),
            });
        }

        let mut names = HashSet::new();
        for class in &self.classes {
            if !names.insert(class.name()) {
                return Err(EngineError::Build {
                    message: format!("class `{}` registered twice", class.name()),
                });
            }
        }
        for hook in &self.hooks {
            if let HookLevel::Class(class) = &hook.level {
                if !names.contains(class.as_str()) {
                    return Err(DiscoveryError::UnknownClass {
                        name: class.clone(),
                    }
                    .into());
                }
            }
        }

        let affinities = self
            .hooks
            .iter()
            .filter_map(|h| h.affinity.as_deref())
            .chain(
                self.classes
                    .iter()
                    .filter_map(|c| c.descriptor.affinity.as_deref()),
            )
            .chain(self.assembly_affinity.values().map(String::as_str));
        for id in affinities {
            if !self.dispatchers.contains(id) {
                return Err(DiscoveryError::UnknownDispatcher { id: id.to_string() }.into());
            }
        }

        let hooks = HookRegistry::new(self.hooks, &self.classes, self.receivers)?;
        tracing::debug!(
            classes = self.classes.len(),
            tests = self.templates.len(),
            "engine built"
        );

        Ok(Engine {
            classes: Arc::new(self.classes),
            templates: Arc::new(self.templates),
            hooks: Arc::new(hooks),
            reporters: self.reporters,
            dispatchers: Arc::new(self.dispatchers),
            assembly_affinity: self.assembly_affinity,
            filter: self.filter,
            config: self.executor_config,
            load_probe: self
                .load_probe
                .unwrap_or_else(|| Arc::new(LoadAvgProbe::default())),
        })
    }
}
