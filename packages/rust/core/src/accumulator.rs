//! Builds the result table of one page-group.

use bbqscan_shared::{CategoryAssignment, ProductRecord, ResultRow, ResultTable, ValidationEntry};
use chrono::{Datelike, NaiveDate};
use rand::Rng;

use crate::consensus::ConsensusEngine;

/// Collects rows page by page, then takes classification and metadata.
#[derive(Debug)]
pub struct PageGroupAccumulator {
    folder: String,
    rows: Vec<ResultRow>,
}

impl PageGroupAccumulator {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            rows: Vec::new(),
        }
    }

    /// Append one row per primary record, with its reconciled fields.
    ///
    /// `validations[k][i]` is pass `k`'s observation of `primary[i]`.
    pub fn add_page<R: Rng>(
        &mut self,
        page: &str,
        primary: &[ProductRecord],
        validations: &[Vec<ValidationEntry>],
        engine: &mut ConsensusEngine<R>,
    ) {
        for (i, record) in primary.iter().enumerate() {
            let observations: Vec<ValidationEntry> = validations
                .iter()
                .filter_map(|pass| pass.get(i).cloned())
                .collect();
            let mut row = ResultRow::extracted(&self.folder, page, i as u32, record);
            for (field, reconciled) in engine.reconcile_record(record, &observations) {
                row.set_reconciled(field, &reconciled);
            }
            self.rows.push(row);
        }
    }

    /// Names in row order, for the classifier.
    pub fn classification_names(&self) -> Vec<String> {
        self.rows
            .iter()
            .map(|r| r.classification_name().to_string())
            .collect()
    }

    /// Attach classifier output; `assignments[i]` belongs to row `i`.
    pub fn apply_assignments(&mut self, assignments: &[Option<CategoryAssignment>]) {
        for (row, assignment) in self.rows.iter_mut().zip(assignments) {
            if let Some(assignment) = assignment {
                row.set_assignment(assignment);
            }
        }
    }

    /// Stamp the collection date and its ISO calendar week on every row.
    pub fn stamp(&mut self, collected_on: NaiveDate) {
        let week = collected_on.iso_week().week();
        for row in &mut self.rows {
            row.date_collected = Some(collected_on);
            row.calendar_week = Some(week);
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn finish(self) -> ResultTable {
        ResultTable::new(self.rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bbqscan_shared::{CoarseCategory, FieldValue, FinalCategory, GrillVerdict};
    use rust_decimal::Decimal;

    fn cervelat() -> ProductRecord {
        let mut r = ProductRecord::named("Cervelat");
        r.original_price = Some(Decimal::new(450, 2));
        r.discount_price = Some(Decimal::new(350, 2));
        r
    }

    #[test]
    fn rows_carry_reconciled_fields_and_provenance() {
        let mut acc = PageGroupAccumulator::new("coop-kw23");
        let mut engine = ConsensusEngine::seeded(5);
        let primary = vec![cervelat(), ProductRecord::named("Halloumi")];

        let mut disagree = ValidationEntry::from(&primary[0]);
        disagree.discount_price = Some(FieldValue::Decimal(Decimal::new(399, 2)));
        let passes = vec![
            vec![disagree.clone(), ValidationEntry::from(&primary[1])],
            vec![disagree, ValidationEntry::from(&primary[1])],
            vec![ValidationEntry::from(&primary[0])],
        ];
        acc.add_page("page-3.png", &primary, &passes, &mut engine);

        let table = acc.finish();
        assert_eq!(table.len(), 2);
        let row = &table.rows[0];
        assert_eq!((row.folder.as_str(), row.page.as_str(), row.index), ("coop-kw23", "page-3.png", 0));
        assert_eq!(row.final_discount_price, Some(Decimal::new(399, 2)));
        assert!((row.confidence_discount_price.unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(row.final_original_price, Some(Decimal::new(450, 2)));

        // the short third pass does not vote for the second product
        assert_eq!(table.rows[1].confidence_product_name, Some(1.0));
        assert_eq!(table.rows[1].index, 1);
    }

    #[test]
    fn assignments_and_stamp_fill_remaining_columns() {
        let mut acc = PageGroupAccumulator::new("g");
        let mut engine = ConsensusEngine::seeded(1);
        acc.add_page("p.png", &[cervelat(), ProductRecord::named("Zahnpasta")], &[], &mut engine);
        assert_eq!(acc.classification_names(), ["Cervelat", "Zahnpasta"]);

        acc.apply_assignments(&[
            Some(CategoryAssignment {
                category: CoarseCategory::Pork,
                certainty: 90,
                grill: Some(GrillVerdict { is_grill: true, certainty: 70 }),
            }),
            None,
        ]);
        acc.stamp(NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());

        let table = acc.finish();
        assert_eq!(table.rows[0].final_category, Some(FinalCategory::Pork));
        assert_eq!(table.rows[0].final_certainty, Some(70));
        assert_eq!(table.rows[1].category, None);
        for row in &table.rows {
            assert_eq!(row.calendar_week, Some(23));
            assert!(row.date_collected.is_some());
        }
        // no validation passes: primary kept, confidence unknown
        assert_eq!(table.rows[0].final_product_name.as_deref(), Some("Cervelat"));
        assert_eq!(table.rows[0].confidence_product_name, None);
    }
}
