//! Accuracy of the classifier against a hand-labelled product list.

use std::path::Path;

use bbqscan_shared::{BbqScanError, FinalCategory, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::classifier::{ClassifierStats, TwoStageClassifier};

/// One labelled product.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelledProduct {
    pub name: String,
    pub category: String,
    pub is_grill: bool,
}

#[derive(Debug, Deserialize)]
struct LabelRow {
    product_name: String,
    solution_category: String,
    solution_is_grill: String,
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "yes" | "ja" | "1" => Some(true),
        "false" | "no" | "nein" | "0" => Some(false),
        _ => None,
    }
}

/// Read a CSV with `product_name`, `solution_category` and `solution_is_grill` columns.
pub fn read_labels(path: &Path) -> Result<Vec<LabelledProduct>> {
    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| BbqScanError::parse(format!("{}: {e}", path.display())))?;

    let mut labels = Vec::new();
    for (line, row) in reader.deserialize::<LabelRow>().enumerate() {
        let row = row.map_err(|e| BbqScanError::parse(format!("{}: {e}", path.display())))?;
        let is_grill = parse_flag(&row.solution_is_grill).ok_or_else(|| {
            BbqScanError::parse(format!(
                "{} row {}: unreadable solution_is_grill '{}'",
                path.display(),
                line + 1,
                row.solution_is_grill
            ))
        })?;
        labels.push(LabelledProduct {
            name: row.product_name.trim().to_string(),
            category: row.solution_category.trim().to_string(),
            is_grill,
        });
    }
    Ok(labels)
}

/// Matched out of total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Accuracy {
    pub matched: usize,
    pub total: usize,
}

impl Accuracy {
    fn record(&mut self, hit: bool) {
        self.total += 1;
        if hit {
            self.matched += 1;
        }
    }

    /// `None` when nothing was counted.
    pub fn ratio(&self) -> Option<f64> {
        (self.total > 0).then(|| self.matched as f64 / self.total as f64)
    }
}

impl std::fmt::Display for Accuracy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.ratio() {
            Some(r) => write!(f, "{}/{} ({:.1}%)", self.matched, self.total, r * 100.0),
            None => write!(f, "-"),
        }
    }
}

/// A product the classifier got at least partly wrong.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mismatch {
    pub name: String,
    pub expected_category: String,
    pub predicted_category: Option<FinalCategory>,
    pub expected_is_grill: bool,
    pub predicted_is_grill: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EvaluationReport {
    pub category: Accuracy,
    pub grill: Accuracy,
    /// Restricted to products labelled as grill products.
    pub category_when_grill: Accuracy,
    pub grill_when_grill: Accuracy,
    /// Restricted to products labelled as not for the grill.
    pub category_when_not_grill: Accuracy,
    pub grill_when_not_grill: Accuracy,
    pub mismatches: Vec<Mismatch>,
    pub classifier: ClassifierStats,
}

/// Classify every labelled name and compare with the labels.
///
/// Categories compare against the reduced final category, ignoring case.
/// Rows left unclassified count as misses in every measure.
pub async fn evaluate(
    labels: &[LabelledProduct],
    classifier: &TwoStageClassifier<'_>,
) -> Result<EvaluationReport> {
    let names: Vec<String> = labels.iter().map(|l| l.name.clone()).collect();
    let classified = classifier.classify(&names).await?;

    let mut report = EvaluationReport {
        classifier: classified.stats,
        ..Default::default()
    };

    for (label, assignment) in labels.iter().zip(&classified.assignments) {
        let predicted_category = assignment.and_then(|a| a.reduce()).map(|f| f.category);
        let predicted_is_grill = assignment.and_then(|a| a.grill).map(|g| g.is_grill);

        let category_hit = predicted_category
            .is_some_and(|c| c.label().to_lowercase() == label.category.to_lowercase());
        let grill_hit = predicted_is_grill == Some(label.is_grill);

        report.category.record(category_hit);
        report.grill.record(grill_hit);
        if label.is_grill {
            report.category_when_grill.record(category_hit);
            report.grill_when_grill.record(grill_hit);
        } else {
            report.category_when_not_grill.record(category_hit);
            report.grill_when_not_grill.record(grill_hit);
        }

        if !(category_hit && grill_hit) {
            report.mismatches.push(Mismatch {
                name: label.name.clone(),
                expected_category: label.category.clone(),
                predicted_category,
                expected_is_grill: label.is_grill,
                predicted_is_grill,
            });
        }
    }

    info!(
        products = labels.len(),
        category = %report.category,
        grill = %report.grill,
        "evaluation complete"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::NoCache;
    use async_trait::async_trait;
    use bbqscan_llm::ClassificationService;
    use bbqscan_shared::{
        ClassifierSettings, CoarseCategory, CoarseVerdict, GrillVerdict, MismatchPolicy,
        RetryPolicy,
    };

    /// Everything is cheese; names containing "grill" are grill products.
    struct CheeseOnly;

    #[async_trait]
    impl ClassificationService for CheeseOnly {
        fn model_id(&self) -> &str {
            "cheese-only"
        }

        async fn categorize(&self, names: &[String]) -> Result<Vec<CoarseVerdict>> {
            Ok(names
                .iter()
                .map(|_| CoarseVerdict {
                    category: "Käse".into(),
                    certainty: 80,
                })
                .collect())
        }

        async fn classify_grill(&self, _c: CoarseCategory, names: &[String]) -> Result<Vec<GrillVerdict>> {
            Ok(names
                .iter()
                .map(|n| GrillVerdict {
                    is_grill: n.to_lowercase().contains("grill"),
                    certainty: 70,
                })
                .collect())
        }
    }

    fn write_labels(content: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("bbq-labels-{}.csv", uuid::Uuid::now_v7()));
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn reads_label_file_with_flag_variants() {
        let path = write_labels(
            "product_name,solution_category,solution_is_grill\n\
             Grillkäse,Käse,true\n\
             Rahmquark,Kein Grillprodukt,nein\n\
             Halloumi, Käse ,1\n",
        );
        let labels = read_labels(&path).unwrap();
        assert_eq!(labels.len(), 3);
        assert!(labels[0].is_grill);
        assert!(!labels[1].is_grill);
        assert_eq!(labels[2].category, "Käse");
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_unreadable_flag() {
        let path = write_labels("product_name,solution_category,solution_is_grill\nX,Käse,maybe\n");
        assert!(matches!(read_labels(&path), Err(BbqScanError::Parse { .. })));
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn reports_overall_and_conditional_accuracy() {
        let labels = vec![
            LabelledProduct { name: "Grillkäse".into(), category: "Käse".into(), is_grill: true },
            LabelledProduct { name: "Grill-Halloumi".into(), category: "käse".into(), is_grill: true },
            LabelledProduct { name: "Rahmquark".into(), category: "Kein Grillprodukt".into(), is_grill: false },
            LabelledProduct { name: "Cervelat".into(), category: "Schwein".into(), is_grill: true },
        ];
        let settings = ClassifierSettings {
            batch_size: 5,
            max_concurrent_batches: 2,
            mismatch_policy: MismatchPolicy::Stage,
            retry: RetryPolicy::immediate(1),
        };
        let classifier = TwoStageClassifier::new(&CheeseOnly, &NoCache, settings);
        let report = evaluate(&labels, &classifier).await.unwrap();

        assert_eq!(report.category, Accuracy { matched: 3, total: 4 });
        assert_eq!(report.grill, Accuracy { matched: 3, total: 4 });
        assert_eq!(report.category_when_grill, Accuracy { matched: 2, total: 3 });
        assert_eq!(report.category_when_not_grill, Accuracy { matched: 1, total: 1 });
        assert_eq!(report.grill_when_not_grill.ratio(), Some(1.0));
        assert_eq!(report.mismatches.len(), 1);
        assert_eq!(report.mismatches[0].name, "Cervelat");
        assert_eq!(
            report.mismatches[0].predicted_category,
            Some(FinalCategory::NoGrillProduct)
        );
        assert_eq!(Accuracy::default().to_string(), "-");
    }
}
