//! Deterministic stand-in for the remote capability (`--use-test-client`).

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bbqscan_shared::{CoarseCategory, CoarseVerdict, GrillVerdict, ProductRecord, Result};
use serde_json::{Value, json};

use crate::capability::{ClassificationService, ExtractionService, PageImage};

/// Answers every call locally. Every page yields the same two products and
/// validation always agrees with them; categories cycle through the nine
/// labels in call order.
#[derive(Debug, Default)]
pub struct StubClient {
    categorized: AtomicUsize,
    grill_checked: AtomicUsize,
}

impl StubClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn products() -> Vec<Value> {
        vec![
            json!({
                "product_name": "meat",
                "original_price": "1.99",
                "discount_price": "1.59",
                "percentage_discount": 20,
                "discount_details": "pro 100g"
            }),
            json!({
                "product_name": "cheese",
                "original_price": "2.99",
                "discount_price": "1.49",
                "percentage_discount": 50,
                "discount_details": null
            }),
        ]
    }
}

#[async_trait]
impl ExtractionService for StubClient {
    async fn extract(&self, _image: &PageImage) -> Result<Vec<Value>> {
        Ok(Self::products())
    }

    async fn validate(&self, _image: &PageImage, _primary: &[ProductRecord]) -> Result<Vec<Value>> {
        Ok(Self::products())
    }
}

#[async_trait]
impl ClassificationService for StubClient {
    fn model_id(&self) -> &str {
        "stub"
    }

    async fn categorize(&self, names: &[String]) -> Result<Vec<CoarseVerdict>> {
        let start = self.categorized.fetch_add(names.len(), Ordering::SeqCst);
        let count = CoarseCategory::ALL.len();
        Ok((start..start + names.len())
            .map(|n| CoarseVerdict {
                category: CoarseCategory::ALL[n % count].label().to_string(),
                certainty: ((n % count) * 10) as u8,
            })
            .collect())
    }

    async fn classify_grill(
        &self,
        _category: CoarseCategory,
        names: &[String],
    ) -> Result<Vec<GrillVerdict>> {
        let start = self.grill_checked.fetch_add(names.len(), Ordering::SeqCst);
        Ok((start..start + names.len())
            .map(|n| GrillVerdict {
                is_grill: n % 2 == 1,
                certainty: 50 + ((n % 5) * 10) as u8,
            })
            .collect())
    }
}
