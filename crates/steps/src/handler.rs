use std::collections::HashMap;
use std::sync::Arc;

use crate::input::{StepInput, StepType};
use crate::output::StepOutput;

/// Executes one pipeline step.
///
/// Failures are reported through the output's result code, not by panicking.
pub trait StepHandler: Send + Sync + 'static {
    fn step_type(&self) -> StepType;

    /// Name of the external dependency this step calls (breaker key).
    fn dependency(&self) -> &str {
        self.step_type().as_str()
    }

    fn run(&self, input: &StepInput) -> StepOutput;
}

struct FnStep<F> {
    step_type: StepType,
    dependency: String,
    f: F,
}

impl<F> StepHandler for FnStep<F>
where
    F: Fn(&StepInput) -> StepOutput + Send + Sync + 'static,
{
    fn step_type(&self) -> StepType {
        self.step_type
    }

    fn dependency(&self) -> &str {
        &self.dependency
    }

    fn run(&self, input: &StepInput) -> StepOutput {
        (self.f)(input)
    }
}

/// Step handlers by step type.
#[derive(Clone, Default)]
pub struct StepRegistry {
    handlers: HashMap<StepType, Arc<dyn StepHandler>>,
}

impl StepRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same step type.
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) -> &mut Self {
        self.handlers.insert(handler.step_type(), handler);
        self
    }

    /// Register a closure as the handler for `step_type`.
    pub fn register_fn<F>(&mut self, step_type: StepType, dependency: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&StepInput) -> StepOutput + Send + Sync + 'static,
    {
        self.register(Arc::new(FnStep {
            step_type,
            dependency: dependency.into(),
            f,
        }))
    }

    pub fn get(&self, step_type: StepType) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(&step_type).cloned()
    }

    pub fn contains(&self, step_type: StepType) -> bool {
        self.handlers.contains_key(&step_type)
    }
}

impl core::fmt::Debug for StepRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut steps: Vec<_> = self.handlers.keys().map(|s| s.as_str()).collect();
        steps.sort_unstable();
        f.debug_struct("StepRegistry").field("steps", &steps).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::RunContext;
    use patchflow_core::{RunId, TenantId};

    #[test]
    fn registered_closure_runs_with_dependency_name() {
        let mut registry = StepRegistry::new();
        registry.register_fn(StepType::Code, "model-provider", |input| {
            StepOutput::ok(format!("coded attempt {}", input.attempt))
        });

        let handler = registry.get(StepType::Code).expect("registered");
        assert_eq!(handler.dependency(), "model-provider");
        let input = StepInput::new(RunId::new(), TenantId::new(), StepType::Code, RunContext::default());
        assert_eq!(handler.run(&input).summary, "coded attempt 1");
        assert!(registry.get(StepType::Apply).is_none());
    }
}
