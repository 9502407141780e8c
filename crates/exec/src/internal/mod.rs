//! Checks implemented inside the worker process
//!
//! A command whose program path ends in `/<name>` for a registered check
//! is not spawned; the check runs in process under the job deadline.

mod dummy;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

pub use dummy::DummyCheck;

/// Result of an internal check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckOutcome {
    pub return_code: i32,
    pub output: String,
}

impl CheckOutcome {
    pub fn new(return_code: i32, output: impl Into<String>) -> Self {
        Self {
            return_code,
            output: output.into(),
        }
    }
}

/// A check that runs in the worker process
#[async_trait]
pub trait InternalCheck: Send + Sync {
    /// Program basename the check answers to, e.g. `check_dummy`
    fn name(&self) -> &'static str;

    /// Run the check with the arguments following the program path
    async fn check(&self, args: &[String]) -> CheckOutcome;
}

/// Registered internal checks keyed by name
#[derive(Clone, Default)]
pub struct CheckRegistry {
    checks: BTreeMap<&'static str, Arc<dyn InternalCheck>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the bundled checks enabled by the flags
    pub fn with_builtins(check_dummy: bool) -> Self {
        let mut registry = Self::new();
        if check_dummy {
            registry.register(Arc::new(DummyCheck));
        }
        registry
    }

    /// Add or replace a check
    pub fn register(&mut self, check: Arc<dyn InternalCheck>) {
        self.checks.insert(check.name(), check);
    }

    /// Name of the check a program path refers to
    pub fn match_program(&self, program: &str) -> Option<&'static str> {
        self.checks
            .keys()
            .copied()
            .find(|name| program.strip_suffix(name).is_some_and(|p| p.ends_with('/')))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn InternalCheck>> {
        self.checks.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.checks.keys().copied().collect()
    }
}

impl std::fmt::Debug for CheckRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.checks.keys()).finish()
    }
}
