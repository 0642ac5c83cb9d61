//! Hook pipeline.
//!
//! [`HookRegistry`] builds the ordered chain for a scope once, from the
//! class ancestry: Before runs `Every` hooks, then assembly hooks, then
//! class hooks base to derived; After walks the levels the other way. Within
//! a level hooks always run in ascending `order`, ties in declaration order.

mod pipeline;
mod scopes;

use std::collections::HashMap;
use std::sync::Arc;

pub(crate) use pipeline::{BatchOutcome, HookRunner, Transition, notify_scope, notify_test};
pub(crate) use scopes::{ScopeEntry, ScopeTracker};

use crate::context::ScopeInfo;
use crate::errors::DiscoveryError;
use crate::traits::EventReceiver;
use crate::types::*;

pub struct HookRegistry {
    hooks: Vec<Arc<HookDescriptor>>,
    /// Class name to its ancestry, base first, the class itself last.
    ancestry: HashMap<String, Vec<String>>,
    assemblies: HashMap<String, String>,
    global_receivers: Vec<Arc<dyn EventReceiver>>,
    class_receivers: HashMap<String, Vec<Arc<dyn EventReceiver>>>,
}

impl HookRegistry {
    pub fn new(
        hooks: Vec<HookDescriptor>,
        classes: &[ClassDecl],
        global_receivers: Vec<Arc<dyn EventReceiver>>,
    ) -> Result<Self, DiscoveryError> {
        let by_name: HashMap<&str, &ClassDecl> = classes.iter().map(|c| (c.name(), c)).collect();
        let mut ancestry = HashMap::new();
        for class in classes {
            ancestry.insert(class.name().to_string(), resolve_ancestry(class, &by_name)?);
        }
        let hooks = hooks
            .into_iter()
            .enumerate()
            .map(|(seq, mut hook)| {
                hook.seq = seq;
                Arc::new(hook)
            })
            .collect();
        Ok(Self {
            hooks,
            ancestry,
            assemblies: classes
                .iter()
                .map(|c| (c.name().to_string(), c.descriptor.assembly.clone()))
                .collect(),
            global_receivers,
            class_receivers: classes
                .iter()
                .map(|c| (c.name().to_string(), c.receivers.clone()))
                .collect(),
        })
    }

    /// Base first, `class` last. Unknown classes have no ancestry.
    pub fn ancestry(&self, class: &str) -> &[String] {
        self.ancestry.get(class).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Ordered hooks of `scope`/`timing` that apply to `target`.
    pub fn chain(
        &self,
        scope: HookScope,
        timing: HookTiming,
        target: &ScopeInfo,
    ) -> Vec<Arc<HookDescriptor>> {
        let mut chain: Vec<(usize, &Arc<HookDescriptor>)> = self
            .hooks
            .iter()
            .filter(|h| h.scope == scope && h.timing == timing)
            .filter_map(|h| self.level_rank(h, target).map(|rank| (rank, h)))
            .collect();
        chain.sort_by_key(|(rank, h)| {
            let rank = match timing {
                HookTiming::Before => *rank as i64,
                HookTiming::After => -(*rank as i64),
            };
            (rank, h.order, h.seq)
        });
        chain.into_iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    /// Whether any hook is registered for `scope`/`timing`.
    pub fn has(&self, scope: HookScope, timing: HookTiming) -> bool {
        self.hooks
            .iter()
            .any(|h| h.scope == scope && h.timing == timing)
    }

    /// Engine-wide receivers, then those of the class ancestry, base first.
    pub fn receivers(&self, class: Option<&str>) -> Vec<Arc<dyn EventReceiver>> {
        let mut receivers = self.global_receivers.clone();
        if let Some(class) = class {
            for name in self.ancestry(class) {
                if let Some(own) = self.class_receivers.get(name) {
                    receivers.extend(own.iter().cloned());
                }
            }
        }
        receivers
    }

    /// Level position: 0 for `Every`, 1 for the assembly, then one per
    /// ancestry step. `None` when the hook does not apply.
    fn level_rank(&self, hook: &HookDescriptor, target: &ScopeInfo) -> Option<usize> {
        match &hook.level {
            HookLevel::Every => Some(0),
            HookLevel::Assembly(assembly) => match target.scope {
                HookScope::TestSession | HookScope::TestDiscovery => Some(1),
                _ => (target.assembly.as_deref() == Some(assembly.as_str())).then_some(1),
            },
            HookLevel::Class(class) => match target.scope {
                HookScope::Test | HookScope::Class => {
                    let own = target.class.as_deref()?;
                    self.ancestry(own)
                        .iter()
                        .position(|c| c == class)
                        .map(|depth| depth + 2)
                }
                // Assembly hooks declared on a class belong to the class's
                // assembly.
                HookScope::Assembly => {
                    let assembly = self.assemblies.get(class)?;
                    (target.assembly.as_deref() == Some(assembly.as_str())).then_some(2)
                }
                HookScope::TestSession | HookScope::TestDiscovery => Some(2),
            },
        }
    }
}

fn resolve_ancestry(
    class: &ClassDecl,
    by_name: &HashMap<&str, &ClassDecl>,
) -> Result<Vec<String>, DiscoveryError> {
    let mut chain = vec![class.name().to_string()];
    let mut current = class;
    while let Some(base) = &current.descriptor.base {
        if chain.iter().any(|c| c == base) {
            return Err(DiscoveryError::InheritanceCycle {
                class: class.name().to_string(),
            });
        }
        current = by_name
            .get(base.as_str())
            .ok_or_else(|| DiscoveryError::UnknownClass { name: base.clone() })?;
        chain.push(base.clone());
    }
    chain.reverse();
    Ok(chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::hook_fn;

    fn hook(timing: HookTiming, scope: HookScope, name: &str) -> HookDescriptor {
        let body = hook_fn(|_| async { Ok(()) });
        match timing {
            HookTiming::Before => HookDescriptor::before(scope, name, body),
            HookTiming::After => HookDescriptor::after(scope, name, body),
        }
    }

    fn names(chain: &[Arc<HookDescriptor>]) -> Vec<&str> {
        chain.iter().map(|h| h.name.as_str()).collect()
    }

    fn three_levels() -> Vec<ClassDecl> {
        vec![
            ClassDecl::new("Base"),
            ClassDecl::new("Middle").inherits("Base"),
            ClassDecl::new("Derived").inherits("Middle"),
        ]
    }

    fn declare(timing: HookTiming) -> Vec<HookDescriptor> {
        let mut hooks = Vec::new();
        for (class, orders) in [
            ("Derived", [5, -1, 0]),
            ("Base", [2, -3, 0]),
            ("Middle", [0, 1, -2]),
        ] {
            for order in orders {
                hooks.push(
                    hook(timing, HookScope::Test, &format!("{class}{order}"))
                        .on_class(class)
                        .order(order),
                );
            }
        }
        hooks
    }

    fn derived_test() -> ScopeInfo {
        ScopeInfo {
            class: Some("Derived".into()),
            ..ScopeInfo::class(&ClassDescriptor {
                name: "Derived".into(),
                assembly: DEFAULT_ASSEMBLY.into(),
                base: Some("Middle".into()),
                affinity: None,
            })
        }
    }

    #[test]
    fn before_chain_runs_base_first_ascending() {
        let registry =
            HookRegistry::new(declare(HookTiming::Before), &three_levels(), Vec::new()).unwrap();
        let mut info = derived_test();
        info.scope = HookScope::Test;
        let chain = registry.chain(HookScope::Test, HookTiming::Before, &info);
        assert_eq!(
            names(&chain),
            vec![
                "Base-3", "Base0", "Base2", "Middle-2", "Middle0", "Middle1", "Derived-1",
                "Derived0", "Derived5"
            ]
        );
    }

    #[test]
    fn after_chain_runs_derived_first_still_ascending() {
        let registry =
            HookRegistry::new(declare(HookTiming::After), &three_levels(), Vec::new()).unwrap();
        let mut info = derived_test();
        info.scope = HookScope::Test;
        let chain = registry.chain(HookScope::Test, HookTiming::After, &info);
        assert_eq!(
            names(&chain),
            vec![
                "Derived-1", "Derived0", "Derived5", "Middle-2", "Middle0", "Middle1", "Base-3",
                "Base0", "Base2"
            ]
        );
    }

    #[test]
    fn every_and_assembly_levels_wrap_class_hooks() {
        let hooks = vec![
            hook(HookTiming::Before, HookScope::Class, "class").on_class("Base"),
            hook(HookTiming::Before, HookScope::Class, "asm").on_assembly(DEFAULT_ASSEMBLY),
            hook(HookTiming::Before, HookScope::Class, "every").order(10),
            hook(HookTiming::After, HookScope::Class, "class-after").on_class("Base"),
            hook(HookTiming::After, HookScope::Class, "every-after"),
            hook(HookTiming::Before, HookScope::Class, "other-asm").on_assembly("elsewhere"),
        ];
        let registry = HookRegistry::new(hooks, &three_levels(), Vec::new()).unwrap();
        let info = derived_test();
        assert_eq!(
            names(&registry.chain(HookScope::Class, HookTiming::Before, &info)),
            vec!["every", "asm", "class"]
        );
        assert_eq!(
            names(&registry.chain(HookScope::Class, HookTiming::After, &info)),
            vec!["class-after", "every-after"]
        );
    }

    #[test]
    fn ties_keep_declaration_order() {
        let hooks = vec![
            hook(HookTiming::Before, HookScope::TestSession, "first"),
            hook(HookTiming::Before, HookScope::TestSession, "second"),
            hook(HookTiming::Before, HookScope::TestSession, "early").order(-1),
        ];
        let registry = HookRegistry::new(hooks, &[], Vec::new()).unwrap();
        assert_eq!(
            names(&registry.chain(HookScope::TestSession, HookTiming::Before, &ScopeInfo::session())),
            vec!["early", "first", "second"]
        );
    }

    #[test]
    fn unrelated_classes_do_not_inherit() {
        let mut classes = three_levels();
        classes.push(ClassDecl::new("Other"));
        let hooks = vec![hook(HookTiming::Before, HookScope::Test, "base").on_class("Base")];
        let registry = HookRegistry::new(hooks, &classes, Vec::new()).unwrap();
        let mut info = ScopeInfo::session();
        info.scope = HookScope::Test;
        info.class = Some("Other".into());
        assert!(registry.chain(HookScope::Test, HookTiming::Before, &info).is_empty());
    }

    #[test]
    fn ancestry_errors() {
        let err = HookRegistry::new(Vec::new(), &[ClassDecl::new("A").inherits("Ghost")], Vec::new())
            .err()
            .unwrap();
        assert_eq!(err, DiscoveryError::UnknownClass { name: "Ghost".into() });

        let looped = [ClassDecl::new("A").inherits("B"), ClassDecl::new("B").inherits("A")];
        let err = HookRegistry::new(Vec::new(), &looped, Vec::new()).err().unwrap();
        assert!(matches!(err, DiscoveryError::InheritanceCycle { .. }));
    }
}
