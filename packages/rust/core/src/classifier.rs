//! Two-stage product classification.
//!
//! Stage 1 assigns one of nine coarse categories to every name. Stage 2 then
//! asks, per category, whether each product is a grill product, using that
//! category's rules. Both stages send fixed-size batches concurrently and
//! require exactly one answer per name. A stage-1 batch that answers with any
//! other count is rejected according to the configured [`MismatchPolicy`]; a
//! rejected stage-2 batch only loses its own rows' verdicts.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bbqscan_llm::ClassificationService;
use bbqscan_shared::{
    BbqScanError, CategoryAssignment, ClassifierSettings, CoarseCategory, CoarseVerdict,
    GrillVerdict, MismatchPolicy, Result,
};
use bbqscan_storage::Storage;
use futures::{StreamExt, TryStreamExt, stream};
use serde::Serialize;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::batching::{chunk_indices, group_by_key};
use crate::retry::with_retry;

// ---------------------------------------------------------------------------
// Answer cache
// ---------------------------------------------------------------------------

/// Stores accepted batch answers keyed by batch hash and model.
#[async_trait]
pub trait ClassificationCache: Send + Sync {
    async fn get(&self, batch_hash: &str, model_id: &str) -> Result<Option<String>>;
    async fn set(&self, batch_hash: &str, model_id: &str, answer_json: &str) -> Result<()>;
}

#[async_trait]
impl ClassificationCache for Storage {
    async fn get(&self, batch_hash: &str, model_id: &str) -> Result<Option<String>> {
        self.get_classification_cache(batch_hash, model_id).await
    }

    async fn set(&self, batch_hash: &str, model_id: &str, answer_json: &str) -> Result<()> {
        self.set_classification_cache(batch_hash, model_id, answer_json)
            .await
    }
}

/// A cache that never hits.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

#[async_trait]
impl ClassificationCache for NoCache {
    async fn get(&self, _batch_hash: &str, _model_id: &str) -> Result<Option<String>> {
        Ok(None)
    }

    async fn set(&self, _batch_hash: &str, _model_id: &str, _answer_json: &str) -> Result<()> {
        Ok(())
    }
}

/// Hash identifying one batch question for one model.
fn batch_hash(mode: &str, names: &[String], model_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(mode.as_bytes());
    for name in names {
        hasher.update(b"\n");
        hasher.update(name.as_bytes());
    }
    hasher.update(b"\n");
    hasher.update(model_id.as_bytes());
    format!("{:x}", hasher.finalize())
}

// ---------------------------------------------------------------------------
// Classifier
// ---------------------------------------------------------------------------

/// Counters for one classification call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClassifierStats {
    pub batches: usize,
    pub remote_calls: usize,
    pub cache_hits: usize,
    pub rejected_batches: usize,
}

impl ClassifierStats {
    pub fn merge(&mut self, other: &ClassifierStats) {
        self.batches += other.batches;
        self.remote_calls += other.remote_calls;
        self.cache_hits += other.cache_hits;
        self.rejected_batches += other.rejected_batches;
    }
}

#[derive(Default)]
struct Counters {
    batches: AtomicUsize,
    remote_calls: AtomicUsize,
    cache_hits: AtomicUsize,
    rejected_batches: AtomicUsize,
}

impl Counters {
    fn bump(counter: &AtomicUsize) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ClassifierStats {
        ClassifierStats {
            batches: self.batches.load(Ordering::Relaxed),
            remote_calls: self.remote_calls.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            rejected_batches: self.rejected_batches.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of classifying a list of names.
///
/// `assignments[i]` belongs to `names[i]`. `None` means stage 1 was rejected
/// for that row; an assignment without `grill` means stage 2 was rejected.
#[derive(Debug, Clone, Default)]
pub struct ClassificationReport {
    pub assignments: Vec<Option<CategoryAssignment>>,
    pub stats: ClassifierStats,
}

/// Batched, concurrent two-stage classifier.
pub struct TwoStageClassifier<'a> {
    service: &'a dyn ClassificationService,
    cache: &'a dyn ClassificationCache,
    settings: ClassifierSettings,
}

impl<'a> TwoStageClassifier<'a> {
    pub fn new(
        service: &'a dyn ClassificationService,
        cache: &'a dyn ClassificationCache,
        settings: ClassifierSettings,
    ) -> Self {
        Self {
            service,
            cache,
            settings,
        }
    }

    /// Classify `names`, keeping their order.
    ///
    /// Only rejected answers are tolerated. Exhausted retries and other
    /// failures abort the whole call.
    #[instrument(skip_all, fields(names = names.len()))]
    pub async fn classify(&self, names: &[String]) -> Result<ClassificationReport> {
        let counters = Counters::default();
        let mut assignments: Vec<Option<CategoryAssignment>> = vec![None; names.len()];
        if names.is_empty() {
            return Ok(ClassificationReport {
                assignments,
                stats: counters.snapshot(),
            });
        }

        // --- Stage 1: coarse category ---
        let all: Vec<usize> = (0..names.len()).collect();
        let batches = chunk_indices(&all, self.settings.batch_size);
        let outcomes: Vec<(Vec<usize>, Option<Vec<CoarseVerdict>>)> =
            stream::iter(batches.into_iter().enumerate())
                .map(|(batch_no, indices)| {
                    let counters = &counters;
                    let batch_names = pick(names, &indices);
                    async move {
                        let answer = self
                            .answer_batch("coarse", batch_no, &batch_names, counters, || {
                                self.service.categorize(&batch_names)
                            })
                            .await?;
                        Ok::<_, BbqScanError>((indices, answer))
                    }
                })
                .buffer_unordered(self.settings.max_concurrent_batches.max(1))
                .try_collect()
                .await?;

        if !self.accept_coarse_stage(&outcomes) {
            return Ok(ClassificationReport {
                assignments,
                stats: counters.snapshot(),
            });
        }
        for (indices, answer) in outcomes {
            let Some(verdicts) = answer else { continue };
            for (index, verdict) in indices.into_iter().zip(verdicts) {
                let category = CoarseCategory::from_label(&verdict.category).unwrap_or_else(|| {
                    warn!(
                        product = %names[index],
                        label = %verdict.category,
                        "unknown category label, using 'other'"
                    );
                    CoarseCategory::Other
                });
                assignments[index] = Some(CategoryAssignment {
                    category,
                    certainty: verdict.certainty,
                    grill: None,
                });
            }
        }

        // --- Stage 2: grill check per category ---
        let groups = group_by_key(
            assignments
                .iter()
                .enumerate()
                .filter_map(|(i, a)| a.map(|a| (i, a.category))),
        );
        let grill_batches: Vec<(CoarseCategory, Vec<usize>)> = groups
            .into_iter()
            .flat_map(|(category, members)| {
                chunk_indices(&members, self.settings.batch_size)
                    .into_iter()
                    .map(move |batch| (category, batch))
            })
            .collect();
        debug!(batches = grill_batches.len(), "starting grill stage");

        let outcomes: Vec<(Vec<usize>, Option<Vec<GrillVerdict>>)> =
            stream::iter(grill_batches.into_iter().enumerate())
                .map(|(batch_no, (category, indices))| {
                    let counters = &counters;
                    let batch_names = pick(names, &indices);
                    async move {
                        let mode = format!("grill:{}", category.label());
                        let answer = self
                            .answer_batch(&mode, batch_no, &batch_names, counters, || {
                                self.service.classify_grill(category, &batch_names)
                            })
                            .await?;
                        Ok::<_, BbqScanError>((indices, answer))
                    }
                })
                .buffer_unordered(self.settings.max_concurrent_batches.max(1))
                .try_collect()
                .await?;

        for (indices, answer) in outcomes {
            let Some(verdicts) = answer else { continue };
            for (index, verdict) in indices.into_iter().zip(verdicts) {
                if let Some(assignment) = assignments[index].as_mut() {
                    assignment.grill = Some(verdict);
                }
            }
        }

        let stats = counters.snapshot();
        info!(
            batches = stats.batches,
            remote_calls = stats.remote_calls,
            cache_hits = stats.cache_hits,
            rejected = stats.rejected_batches,
            "classification complete"
        );
        Ok(ClassificationReport { assignments, stats })
    }

    /// Whether any stage-1 answer may be used at all.
    fn accept_coarse_stage<T>(&self, outcomes: &[(Vec<usize>, Option<T>)]) -> bool {
        let rejected = outcomes.iter().filter(|(_, a)| a.is_none()).count();
        if rejected == 0 {
            return true;
        }
        match self.settings.mismatch_policy {
            MismatchPolicy::Stage => {
                warn!(
                    rejected_batches = rejected,
                    "discarding every coarse category answer"
                );
                false
            }
            MismatchPolicy::Batch => true,
        }
    }

    /// Answer one batch from cache or the capability.
    ///
    /// Returns `Ok(None)` when the answer was rejected.
    async fn answer_batch<T, F, Fut>(
        &self,
        mode: &str,
        batch_no: usize,
        names: &[String],
        counters: &Counters,
        call: F,
    ) -> Result<Option<Vec<T>>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        Counters::bump(&counters.batches);
        let model_id = self.service.model_id();
        let hash = batch_hash(mode, names, model_id);

        match self.cache.get(&hash, model_id).await {
            Ok(Some(cached)) => match serde_json::from_str::<Vec<T>>(&cached) {
                Ok(answer) if answer.len() == names.len() => {
                    Counters::bump(&counters.cache_hits);
                    return Ok(Some(answer));
                }
                _ => debug!(mode, batch = batch_no, "ignoring unusable cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(mode, error = %e, "classification cache lookup failed"),
        }

        Counters::bump(&counters.remote_calls);
        let answer = match with_retry(&self.settings.retry, mode, call).await {
            Ok(answer) => answer,
            Err(e) if e.is_unusable_answer() => {
                warn!(mode, batch = batch_no, size = names.len(), error = %e, "rejecting batch answer");
                Counters::bump(&counters.rejected_batches);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if answer.len() != names.len() {
            warn!(
                mode,
                batch = batch_no,
                expected = names.len(),
                received = answer.len(),
                first_product = names.first().map(String::as_str).unwrap_or_default(),
                "answer count does not match batch size, rejecting batch"
            );
            Counters::bump(&counters.rejected_batches);
            return Ok(None);
        }

        match serde_json::to_string(&answer) {
            Ok(json) => {
                if let Err(e) = self.cache.set(&hash, model_id, &json).await {
                    warn!(mode, error = %e, "failed to store classification answer");
                }
            }
            Err(e) => warn!(mode, error = %e, "failed to encode classification answer"),
        }
        Ok(Some(answer))
    }
}

fn pick(names: &[String], indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| names[i].clone()).collect()
}
