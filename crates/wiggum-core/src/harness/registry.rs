//! Harness registry — a named collection of available harness adapters.
//!
//! The registry lets the pipeline runner look up the harness a step's
//! `agent` field names at run time.

use std::collections::HashMap;

use super::trait_def::Harness;

#[derive(Default)]
pub struct HarnessRegistry {
    harnesses: HashMap<String, Box<dyn Harness>>,
}

impl HarnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a harness adapter under the name returned by
    /// [`Harness::name`]. Replaces and returns any harness already
    /// registered under that name.
    pub fn register(&mut self, harness: impl Harness + 'static) -> Option<Box<dyn Harness>> {
        let name = harness.name().to_string();
        self.harnesses.insert(name, Box::new(harness))
    }

    pub fn get(&self, name: &str) -> Option<&dyn Harness> {
        self.harnesses.get(name).map(|b| b.as_ref())
    }

    pub fn list(&self) -> Vec<&str> {
        self.harnesses.keys().map(|s| s.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.harnesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.harnesses.is_empty()
    }
}

impl std::fmt::Debug for HarnessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HarnessRegistry")
            .field("harnesses", &self.harnesses.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::{GateResult, StepResult};
    use crate::harness::trait_def::Invocation;
    use anyhow::Result;
    use async_trait::async_trait;

    struct FakeHarness {
        harness_name: String,
    }

    impl FakeHarness {
        fn new(name: &str) -> Self {
            Self {
                harness_name: name.to_string(),
            }
        }
    }

    #[async_trait]
    impl Harness for FakeHarness {
        fn name(&self) -> &str {
            &self.harness_name
        }

        async fn run_step(&self, _invocation: &Invocation) -> Result<StepResult> {
            Ok(StepResult {
                gate_result: GateResult::Pass,
                outputs: serde_json::Value::Null,
                errors: Vec::new(),
            })
        }
    }

    #[test]
    fn registry_starts_empty() {
        let registry = HarnessRegistry::new();
        assert!(registry.is_empty());
    }

    #[test]
    fn register_and_get() {
        let mut registry = HarnessRegistry::new();
        assert!(registry.register(FakeHarness::new("alpha")).is_none());
        assert_eq!(registry.get("alpha").unwrap().name(), "alpha");
    }

    #[test]
    fn register_replaces_existing() {
        let mut registry = HarnessRegistry::new();
        registry.register(FakeHarness::new("alpha"));
        let old = registry.register(FakeHarness::new("alpha"));
        assert!(old.is_some());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_missing_returns_none() {
        assert!(HarnessRegistry::new().get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_names() {
        let mut registry = HarnessRegistry::new();
        registry.register(FakeHarness::new("alpha"));
        registry.register(FakeHarness::new("beta"));
        let mut names = registry.list();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }
}
