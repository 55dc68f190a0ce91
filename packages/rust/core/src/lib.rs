//! Core pipeline orchestration and domain logic for bbqscan.
//!
//! This crate ties together page discovery, extraction with validation
//! consensus, two-stage classification, and result persistence into the
//! end-to-end `run` workflow.

pub mod accumulator;
pub mod batching;
pub mod classifier;
pub mod consensus;
pub mod evaluation;
pub mod orchestrator;
pub mod pages;
pub mod retry;

pub use classifier::{
    ClassificationCache, ClassificationReport, ClassifierStats, NoCache, TwoStageClassifier,
};
pub use consensus::ConsensusEngine;
pub use orchestrator::{
    Collaborators, ProgressReporter, RunOutcome, RunStats, SilentProgress, run_pipeline,
};
pub use pages::{PageRenderer, PdftoppmRenderer, PrerenderedPages};
