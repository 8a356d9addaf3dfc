//! # promptloop-core
//!
//! The post-call improvement pipeline: simulate the agent prompt against a
//! persona suite, score each conversation and the recorded call, propose a
//! candidate prompt, validate it, and promote it only if it does not regress.
//!
//! ## Key Types
//!
//! - [`PipelineRunner`] - Runs the pipeline for one call
//! - [`EvaluationHarness`] - Persona simulations plus judge scoring
//! - [`PromptImprover`] - Candidate prompt generation
//! - [`PromptValidator`] - Structural gate for candidates
//! - [`IterationManager`] - Versioning, promotion and rollback
//! - [`PipelineQueue`] - Background processing of completed calls

mod analysis;
mod baseline;
mod calls;
mod error;
mod harness;
mod improver;
mod iterations;
mod outcome;
mod personas;
mod pipeline;
mod prompts;
mod queue;
mod reporting;
mod validator;

pub use analysis::{CallAnalysis, Findings};
pub use baseline::DEFAULT_BASELINE_PROMPT;
pub use calls::{Call, CallSummary, TranscriptSegment};
pub use error::{FailureKind, HarnessError, ImproverError, IterationError, PipelineError};
pub use harness::{
    render_placeholders, Completion, EvaluationHarness, EvaluationRun, HarnessConfig, RunOutcome,
    Speaker, Turn,
};
pub use improver::{ImprovementRequest, PromptImprover};
pub use iterations::{prompt_hash, BotIteration, IterationManager, PromotionDecision};
pub use outcome::{PipelineOutcome, PipelineResult, RollbackReason};
pub use personas::{
    Archetype, CustomerReply, Persona, PersonaPolicy, PersonaSuite, ReplyEffect, RiskLevel,
};
pub use pipeline::{PipelineRunner, PipelineSettings, StatusReport};
pub use prompts::{ImproverPrompts, SimulationPrompts};
pub use queue::{CallCompleted, PipelineQueue, QueueError};
pub use reporting::{
    rank_by_frequency, DimensionSummary, PerformanceReport, PerformanceSnapshot, Trend,
    TrendReport,
};
pub use validator::{
    default_sections, placeholders, CheckKind, ParagraphChange, PromptValidator, SectionSpec, ValidationResult,
    ValidatorConfig, Violation,
};

pub use promptloop_db::IterationStatus;
