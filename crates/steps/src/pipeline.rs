use patchflow_core::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

use crate::input::StepType;

/// Ordered, finite step sequence of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pipeline(Vec<StepType>);

impl Default for Pipeline {
    /// triage → plan → code → test → review → apply
    fn default() -> Self {
        Self(StepType::ALL.to_vec())
    }
}

impl Pipeline {
    pub fn new(steps: Vec<StepType>) -> DomainResult<Self> {
        if steps.is_empty() {
            return Err(DomainError::validation("pipeline must contain at least one step"));
        }
        Ok(Self(steps))
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> DomainResult<Self> {
        let steps = names
            .iter()
            .map(|n| n.as_ref().parse::<StepType>())
            .collect::<DomainResult<Vec<_>>>()?;
        Self::new(steps)
    }

    pub fn steps(&self) -> &[StepType] {
        &self.0
    }

    pub fn get(&self, index: usize) -> Option<StepType> {
        self.0.get(index).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_pipeline_order() {
        let p = Pipeline::default();
        assert_eq!(p.get(0), Some(StepType::Triage));
        assert_eq!(p.get(5), Some(StepType::Apply));
        assert_eq!(p.get(6), None);
    }

    #[test]
    fn from_names_rejects_unknown_and_empty() {
        assert!(Pipeline::from_names(&["triage", "code"]).is_ok());
        assert!(Pipeline::from_names(&["triage", "deploy"]).is_err());
        assert!(Pipeline::from_names::<&str>(&[]).is_err());
    }
}
