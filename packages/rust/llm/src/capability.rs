//! The remote extraction and classification capabilities, seen from the pipeline.
//!
//! Both traits are batch-in, batch-out. Implementations never retry and never
//! check result counts; the caller owns both concerns.

use std::path::Path;

use async_trait::async_trait;
use bbqscan_shared::{BbqScanError, CoarseCategory, CoarseVerdict, GrillVerdict, ProductRecord, Result};
use serde_json::Value;

/// One page image, loaded once and shared by every call made for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    /// File name within the page-group.
    pub name: String,
    /// MIME type for the data URL.
    pub media_type: &'static str,
    pub bytes: Vec<u8>,
}

impl PageImage {
    pub fn new(name: impl Into<String>, bytes: Vec<u8>) -> Self {
        let name = name.into();
        let media_type = media_type_for(Path::new(&name));
        Self {
            name,
            media_type,
            bytes,
        }
    }

    /// Read the image from disk.
    pub async fn load(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| BbqScanError::io(path, e))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(Self::new(name, bytes))
    }
}

fn media_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

/// Reads product records off a leaflet page.
#[async_trait]
pub trait ExtractionService: Send + Sync {
    /// Primary extraction: every product visible on the page, in reading order.
    async fn extract(&self, image: &PageImage) -> Result<Vec<Value>>;

    /// Re-read the page, correcting `primary`. Entries are expected in the
    /// same order as `primary`.
    async fn validate(&self, image: &PageImage, primary: &[ProductRecord]) -> Result<Vec<Value>>;
}

/// Classifies product names. Answers must follow input order exactly.
#[async_trait]
pub trait ClassificationService: Send + Sync {
    /// Identifier of the model behind the answers, used as a cache key part.
    fn model_id(&self) -> &str;

    /// Stage 1: one coarse category per name.
    async fn categorize(&self, names: &[String]) -> Result<Vec<CoarseVerdict>>;

    /// Stage 2: grill suitability per name, judged with the rules for `category`.
    async fn classify_grill(
        &self,
        category: CoarseCategory,
        names: &[String],
    ) -> Result<Vec<GrillVerdict>>;
}

// ---------------------------------------------------------------------------
// Answer parsing shared by remote implementations
// ---------------------------------------------------------------------------

fn results_array<'a>(answer: &'a Value, key: &str) -> Result<&'a Vec<Value>> {
    answer
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| BbqScanError::Capability(format!("answer has no `{key}` array")))
}

fn certainty(item: &Value, key: &str) -> Result<u8> {
    let raw = item
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| BbqScanError::contract(format!("result without numeric `{key}`: {item}")))?;
    Ok(raw.round().clamp(0.0, 100.0) as u8)
}

/// Parse `{"results": [{"category", "certainty"}]}`.
pub fn parse_coarse_answer(answer: &Value) -> Result<Vec<CoarseVerdict>> {
    results_array(answer, "results")?
        .iter()
        .map(|item| {
            let category = item
                .get("category")
                .and_then(Value::as_str)
                .ok_or_else(|| BbqScanError::contract(format!("result without category: {item}")))?;
            Ok(CoarseVerdict {
                category: category.to_string(),
                certainty: certainty(item, "certainty")?,
            })
        })
        .collect()
}

/// Parse `{"results": [{"is_grill", "certainty_is_grill"}]}`.
pub fn parse_grill_answer(answer: &Value) -> Result<Vec<GrillVerdict>> {
    results_array(answer, "results")?
        .iter()
        .map(|item| {
            let is_grill = item
                .get("is_grill")
                .and_then(Value::as_bool)
                .ok_or_else(|| BbqScanError::contract(format!("result without is_grill: {item}")))?;
            Ok(GrillVerdict {
                is_grill,
                certainty: certainty(item, "certainty_is_grill")?,
            })
        })
        .collect()
}

/// Parse `{"all_products": [...]}` into raw product objects.
pub fn parse_products_answer(answer: &Value) -> Result<Vec<Value>> {
    Ok(results_array(answer, "all_products")?.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn media_type_from_extension() {
        assert_eq!(PageImage::new("page-1.PNG", vec![]).media_type, "image/png");
        assert_eq!(PageImage::new("scan.jpeg", vec![]).media_type, "image/jpeg");
        assert_eq!(PageImage::new("scan.JPG", vec![]).media_type, "image/jpeg");
    }

    #[test]
    fn coarse_answer_clamps_certainty() {
        let answer = json!({"results": [
            {"category": "Rind", "certainty": 104.2},
            {"category": "Dessert", "certainty": 55.6}
        ]});
        let verdicts = parse_coarse_answer(&answer).unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].certainty, 100);
        assert_eq!(verdicts[1].category, "Dessert");
        assert_eq!(verdicts[1].certainty, 56);
    }

    #[test]
    fn grill_answer_requires_flag() {
        let answer = json!({"results": [{"certainty_is_grill": 80}]});
        let err = parse_grill_answer(&answer).unwrap_err();
        assert!(matches!(err, BbqScanError::Contract { .. }));
    }

    #[test]
    fn missing_results_key_is_capability_error() {
        let err = parse_products_answer(&json!({"products": []})).unwrap_err();
        assert!(matches!(err, BbqScanError::Capability(_)));
    }
}
