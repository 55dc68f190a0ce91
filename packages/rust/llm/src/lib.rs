//! Extraction and classification capabilities for bbqscan.
//!
//! The pipeline only sees the [`ExtractionService`] and [`ClassificationService`]
//! traits. [`OpenAiClient`] talks to an OpenAI-compatible endpoint;
//! [`StubClient`] answers locally for tests and dry runs.

pub mod capability;
pub mod openai;
pub mod prompts;
pub mod stub;

pub use capability::{ClassificationService, ExtractionService, PageImage};
pub use openai::OpenAiClient;
pub use stub::StubClient;
