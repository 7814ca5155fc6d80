//! `patchflow-steps`
//!
//! **Responsibility:** the step execution contract.
//!
//! Every pipeline step (triage, plan, code, test, review, apply) receives a
//! [`StepInput`] and answers with a [`StepOutput`] carrying a [`ResultCode`].
//! The orchestrator only looks at the envelope; what a step does internally
//! (model calls, patch synthesis) is the handler's business.
//!
//! This crate performs no IO.

pub mod approval;
pub mod handler;
pub mod input;
pub mod output;
pub mod pipeline;

pub use approval::{content_hash, ApprovalRecord};
pub use handler::{StepHandler, StepRegistry};
pub use input::{RiskMode, RunContext, StepInput, StepType};
pub use output::{
    Artifact, ContractViolation, CostAccounting, ResultCode, StepError, StepOutput, Timing,
};
pub use pipeline::Pipeline;
