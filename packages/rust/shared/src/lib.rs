//! Shared types, error model, and configuration for bbqscan.
//!
//! This crate is the foundation depended on by all other bbqscan crates.
//! It provides:
//! - [`BbqScanError`]: the unified error type
//! - Domain types ([`ProductRecord`], [`ValidationEntry`], [`CategoryAssignment`], [`ResultTable`])
//! - Configuration ([`AppConfig`], [`RunConfig`], config loading)

pub mod config;
pub mod error;
pub mod natural;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ClassificationConfig, ClassifierSettings, DefaultsConfig, MismatchPolicy,
    OpenAiConfig, RenderingConfig, RetryConfig, RetryPolicy, RunConfig, config_dir,
    config_file_path, init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{BbqScanError, Result};
pub use natural::natural_cmp;
pub use types::{
    CategoryAssignment, CoarseCategory, CoarseVerdict, FieldName, FieldValue, FinalCategory,
    FinalClassification, GrillVerdict, PageGroupState, ProductRecord, ReconciledField, ResultRow,
    ResultTable, RunId, ValidationEntry, parse_field, parse_price_text,
};
