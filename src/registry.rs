//! Role registry and built-in role bootstrap.

use crate::agent::LlmAgent;
use crate::error::Result;
use crate::exec_ctx::ExecCtx;
use crate::merge::MergeConfig;
use crate::producer::{LlmProducer, LocateMode, RuleProducer};
use crate::prompt::{DETECT_TEMPLATE, REVIEW_TEMPLATE, SYSTEM_PROMPT};
use crate::role::{ids, ProducerRole, ReviewerRole, Role};
use crate::types::ErrorType;
use std::collections::HashMap;
use std::sync::Arc;

/// Map from role id to role.
///
/// Filled at startup, then shared read-only behind an `Arc`.
#[derive(Default)]
pub struct RoleRegistry {
    roles: HashMap<String, Arc<dyn Role>>,
}

impl RoleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `role` unless its id is taken. Returns whether it was inserted.
    pub fn register(&mut self, role: Arc<dyn Role>) -> bool {
        let id = role.id().to_string();
        if self.roles.contains_key(&id) {
            return false;
        }
        self.roles.insert(id, role);
        true
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Role>> {
        self.roles.get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.roles.contains_key(id)
    }

    /// Registered ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.roles.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.roles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }
}

impl std::fmt::Debug for RoleRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoleRegistry").field("roles", &self.ids()).finish()
    }
}

/// What the built-in roles are built from.
#[derive(Debug, Clone)]
pub struct BuiltinDeps {
    pub ctx: Arc<ExecCtx>,
    /// Default model of the LLM roles.
    pub model: String,
    pub basic_locate: LocateMode,
    pub reviewer_locate: LocateMode,
    /// Stream `basic` replies and report partial results.
    pub streaming: bool,
    pub merge: MergeConfig,
}

impl BuiltinDeps {
    pub fn new(ctx: Arc<ExecCtx>, model: impl Into<String>) -> Self {
        Self {
            ctx,
            model: model.into(),
            basic_locate: LocateMode::UniqueSubstring,
            reviewer_locate: LocateMode::ExactIndex,
            streaming: true,
            merge: MergeConfig::default(),
        }
    }
}

/// Register `basic`, `rules` and `reviewer`.
///
/// Ids already present are left alone, so calling this twice is harmless.
/// Returns how many roles were added.
pub fn register_builtin_roles(registry: &mut RoleRegistry, deps: &BuiltinDeps) -> Result<usize> {
    let mut added = 0;

    if !registry.contains(ids::BASIC) {
        let agent = LlmAgent::new(ids::BASIC, DETECT_TEMPLATE)
            .with_system(SYSTEM_PROMPT)
            .with_streaming(deps.streaming);
        let producer = LlmProducer::new(agent, Arc::clone(&deps.ctx), deps.basic_locate)
            .with_types(&ErrorType::builtin());
        let role = ProducerRole::new(ids::BASIC, Arc::new(producer))
            .with_name("基础校对")
            .with_default_model(&deps.model);
        added += usize::from(registry.register(Arc::new(role)));
    }

    if !registry.contains(ids::RULES) {
        let role = ProducerRole::new(ids::RULES, Arc::new(RuleProducer::new()?))
            .with_name("规则检查")
            .with_capabilities(vec![ErrorType::Spelling, ErrorType::Punctuation, ErrorType::Fluency]);
        added += usize::from(registry.register(Arc::new(role)));
    }

    if !registry.contains(ids::REVIEWER) {
        let agent = LlmAgent::new(ids::REVIEWER, REVIEW_TEMPLATE).with_system(SYSTEM_PROMPT);
        let role = ReviewerRole::new(agent, Arc::clone(&deps.ctx))
            .with_default_model(&deps.model)
            .with_locate(deps.reviewer_locate)
            .with_merge(deps.merge.clone());
        added += usize::from(registry.register(Arc::new(role)));
    }

    tracing::debug!(added, roles = ?registry.ids(), "built-in roles registered");
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MockBackend};

    fn deps() -> BuiltinDeps {
        let backend: Arc<dyn Backend> = Arc::new(MockBackend::fixed("[]"));
        let ctx = ExecCtx::builder("http://unused").backend(backend).build().unwrap();
        BuiltinDeps::new(Arc::new(ctx), "test-model")
    }

    #[test]
    fn test_register_is_insert_if_absent() {
        let mut registry = RoleRegistry::new();
        let rules = || -> Arc<dyn Role> {
            Arc::new(ProducerRole::new("rules", Arc::new(RuleProducer::new().unwrap())).with_name("first"))
        };
        assert!(registry.register(rules()));
        assert!(!registry.register(rules()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("rules").unwrap().name(), "first");
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_builtin_registration_is_idempotent() {
        let deps = deps();
        let mut registry = RoleRegistry::new();
        assert_eq!(register_builtin_roles(&mut registry, &deps).unwrap(), 3);
        assert_eq!(register_builtin_roles(&mut registry, &deps).unwrap(), 0);
        assert_eq!(registry.ids(), vec!["basic", "reviewer", "rules"]);
        assert_eq!(registry.get("basic").unwrap().default_model(), "test-model");
    }

    #[test]
    fn test_existing_role_is_kept() {
        let deps = deps();
        let mut registry = RoleRegistry::new();
        let custom: Arc<dyn Role> =
            Arc::new(ProducerRole::new("basic", Arc::new(RuleProducer::new().unwrap())).with_name("custom"));
        registry.register(custom);
        assert_eq!(register_builtin_roles(&mut registry, &deps).unwrap(), 2);
        assert_eq!(registry.get("basic").unwrap().name(), "custom");
    }
}
