//! Field-level majority voting across validation passes.

use bbqscan_shared::{FieldName, FieldValue, ProductRecord, ReconciledField, ValidationEntry};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::Value;
use tracing::{debug, warn};

/// Reconciles primary extraction values against N validation passes.
///
/// Ties that do not include the primary value are broken with the engine's
/// random source; seed it for reproducible runs.
pub struct ConsensusEngine<R: Rng = StdRng> {
    rng: R,
}

impl ConsensusEngine<StdRng> {
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    /// Seeded when `seed` is given, OS randomness otherwise.
    pub fn for_seed(seed: Option<u64>) -> Self {
        match seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_os_rng(),
        }
    }
}

impl<R: Rng> ConsensusEngine<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }

    /// Majority-vote one field.
    ///
    /// Malformed observations (`None`) do not count towards N. With no usable
    /// observation the primary value is kept and confidence is `None`.
    pub fn reconcile(
        &mut self,
        primary: &FieldValue,
        validations: &[ValidationEntry],
        field: FieldName,
    ) -> ReconciledField {
        // first-seen order keeps the tie set deterministic for a given seed
        let mut tally: Vec<(&FieldValue, usize)> = Vec::new();
        let mut total = 0usize;
        for value in validations.iter().filter_map(|v| v.get(field)) {
            total += 1;
            match tally.iter_mut().find(|(seen, _)| *seen == value) {
                Some((_, count)) => *count += 1,
                None => tally.push((value, 1)),
            }
        }

        if total == 0 {
            return ReconciledField {
                value: primary.clone(),
                confidence: None,
            };
        }

        let top = tally.iter().map(|(_, c)| *c).max().unwrap_or(0);
        let tied: Vec<&FieldValue> = tally
            .iter()
            .filter(|(_, c)| *c == top)
            .map(|(v, _)| *v)
            .collect();

        let value = if tied.len() == 1 {
            tied[0].clone()
        } else if tied.contains(&primary) {
            primary.clone()
        } else {
            let pick = self.rng.random_range(0..tied.len());
            debug!(field = field.key(), candidates = tied.len(), "tie broken at random");
            tied[pick].clone()
        };

        ReconciledField {
            value,
            confidence: Some(top as f64 / total as f64),
        }
    }

    /// Reconcile every voted field of one record, in [`FieldName::ALL`] order.
    pub fn reconcile_record(
        &mut self,
        primary: &ProductRecord,
        validations: &[ValidationEntry],
    ) -> Vec<(FieldName, ReconciledField)> {
        FieldName::ALL
            .iter()
            .map(|&field| {
                let primary_value = primary.field(field);
                (field, self.reconcile(&primary_value, validations, field))
            })
            .collect()
    }
}

/// Line up one validation pass with the primary records by position.
///
/// Surplus entries are dropped. Missing entries come back fully malformed so
/// that they simply do not vote.
pub fn align_pass(primary_len: usize, pass: &[Value], page: &str, pass_no: u32) -> Vec<ValidationEntry> {
    if pass.len() != primary_len {
        warn!(
            page,
            pass = pass_no,
            expected = primary_len,
            received = pass.len(),
            "validation pass length differs from primary extraction"
        );
    }
    (0..primary_len)
        .map(|i| pass.get(i).map(ValidationEntry::from_json).unwrap_or_default())
        .collect()
}
