//! End-to-end `run` pipeline: discover → render → extract + validate →
//! reconcile → classify → persist, one page-group at a time.

use std::time::Instant;

use bbqscan_llm::{ClassificationService, ExtractionService, PageImage};
use bbqscan_shared::{
    PageGroupState, ProductRecord, Result, ResultTable, RunConfig, RunId,
};
use bbqscan_storage::{ResultStore, Storage, StoreKey};
use chrono::Local;
use rand::Rng;
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::accumulator::PageGroupAccumulator;
use crate::classifier::{ClassificationCache, ClassifierStats, TwoStageClassifier};
use crate::consensus::{ConsensusEngine, align_pass};
use crate::pages::{PageGroup, PageRenderer, discover_groups, list_images};
use crate::retry::with_retry;

/// Everything the pipeline talks to.
pub struct Collaborators<'a> {
    pub extraction: &'a dyn ExtractionService,
    pub classification: &'a dyn ClassificationService,
    pub store: &'a dyn ResultStore,
    pub renderer: &'a dyn PageRenderer,
    /// Run ledger; `None` disables state tracking.
    pub ledger: Option<&'a Storage>,
    pub cache: &'a dyn ClassificationCache,
}

/// Counters reported at the end of a run and stored in the ledger.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunStats {
    pub groups_total: usize,
    pub groups_processed: usize,
    pub groups_skipped: usize,
    pub pages: usize,
    pub rows: usize,
    pub combined_rows: usize,
    pub classifier: ClassifierStats,
    pub elapsed_ms: u64,
}

/// Result of a `run`.
#[derive(Debug)]
pub enum RunOutcome {
    /// A combined table already existed and overwrite was off.
    Skipped,
    Completed {
        combined: ResultTable,
        stats: RunStats,
    },
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called before a page-group is processed.
    fn group_started(&self, key: &str, current: usize, total: usize);
    /// Called when a page-group is resumed from its stored table.
    fn group_skipped(&self, key: &str);
    /// Called after each page image is extracted and reconciled.
    fn page_processed(&self, page: &str, current: usize, total: usize);
    /// Called when the pipeline completes.
    fn done(&self, stats: &RunStats);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn group_started(&self, _key: &str, _current: usize, _total: usize) {}
    fn group_skipped(&self, _key: &str) {}
    fn page_processed(&self, _page: &str, _current: usize, _total: usize) {}
    fn done(&self, _stats: &RunStats) {}
}

/// Ledger writes never fail the run.
struct Ledger<'a> {
    storage: Option<&'a Storage>,
    root: String,
    run_id: Option<RunId>,
}

impl Ledger<'_> {
    async fn mark(&self, group: &str, state: PageGroupState, rows: Option<usize>) {
        let Some(storage) = self.storage else { return };
        if let Err(e) = storage
            .set_group_state(
                &self.root,
                group,
                state,
                self.run_id.as_ref(),
                rows.map(|r| r as u64),
            )
            .await
        {
            warn!(group, state = %state, error = %e, "failed to record page-group state");
        }
    }

    async fn finish(&self, outcome: &str, stats: Option<&RunStats>) {
        let (Some(storage), Some(run_id)) = (self.storage, self.run_id.as_ref()) else {
            return;
        };
        let stats_json = stats.and_then(|s| serde_json::to_string(s).ok());
        if let Err(e) = storage
            .finish_run(run_id, outcome, stats_json.as_deref())
            .await
        {
            warn!(%run_id, error = %e, "failed to record run outcome");
        }
    }
}

/// Run the full pipeline over `config.root`.
///
/// Page-groups with a stored table are resumed rather than recomputed unless
/// `config.overwrite` is set. A group's table is written exactly once, after
/// its classification is complete, so an aborted run leaves only whole tables.
#[instrument(skip_all, fields(root = %config.root.display()))]
pub async fn run_pipeline(
    config: &RunConfig,
    collab: &Collaborators<'_>,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    // --- Phase 1: Whole-run skip ---
    if !config.overwrite && collab.store.exists(&StoreKey::Run)? {
        info!("combined result table exists, nothing to do");
        return Ok(RunOutcome::Skipped);
    }

    let root = config.root.display().to_string();
    let run_id = match collab.ledger {
        Some(storage) => match storage.insert_run(&root).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(error = %e, "failed to record run start");
                None
            }
        },
        None => None,
    };
    let ledger = Ledger {
        storage: collab.ledger,
        root,
        run_id,
    };

    match run_groups(config, collab, &ledger, progress).await {
        Ok(outcome) => {
            if let RunOutcome::Completed { stats, .. } = &outcome {
                ledger.finish("completed", Some(stats)).await;
            }
            Ok(outcome)
        }
        Err(e) => {
            ledger.finish("failed", None).await;
            Err(e)
        }
    }
}

async fn run_groups(
    config: &RunConfig,
    collab: &Collaborators<'_>,
    ledger: &Ledger<'_>,
    progress: &dyn ProgressReporter,
) -> Result<RunOutcome> {
    let start = Instant::now();
    let mut stats = RunStats::default();
    let mut engine = ConsensusEngine::for_seed(config.seed);
    let collected_on = config
        .collected_on
        .unwrap_or_else(|| Local::now().date_naive());

    // --- Phase 2: Discover page-groups ---
    progress.phase("Discovering page-groups");
    let groups = discover_groups(&config.root, &config.results_file)?;
    stats.groups_total = groups.len();
    info!(groups = groups.len(), "starting run");

    // --- Phase 3: Process each page-group ---
    for (i, group) in groups.iter().enumerate() {
        let key = StoreKey::Group(group.key.clone());
        if !config.overwrite && collab.store.exists(&key)? {
            info!(group = %group.key, "page-group already persisted, skipping");
            stats.groups_skipped += 1;
            progress.group_skipped(&group.key);
            ledger.mark(&group.key, PageGroupState::Persisted, None).await;
            continue;
        }

        progress.group_started(&group.key, i + 1, groups.len());
        let table = process_group(
            config,
            collab,
            ledger,
            progress,
            group,
            &mut engine,
            &mut stats,
            collected_on,
        )
        .await?;

        collab.store.write(&key, &table)?;
        ledger
            .mark(&group.key, PageGroupState::Persisted, Some(table.len()))
            .await;
        stats.groups_processed += 1;
        stats.rows += table.len();
    }

    // --- Phase 4: Combine ---
    progress.phase("Writing combined table");
    let combined = ResultTable::concat(
        collab
            .store
            .read_all()?
            .into_iter()
            .map(|(_, table)| table),
    );
    collab.store.write(&StoreKey::Run, &combined)?;
    stats.combined_rows = combined.len();
    stats.elapsed_ms = start.elapsed().as_millis() as u64;

    info!(
        processed = stats.groups_processed,
        skipped = stats.groups_skipped,
        rows = stats.combined_rows,
        elapsed_ms = stats.elapsed_ms,
        "run complete"
    );
    progress.done(&stats);
    Ok(RunOutcome::Completed { combined, stats })
}

#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(group = %group.key))]
async fn process_group<R: Rng>(
    config: &RunConfig,
    collab: &Collaborators<'_>,
    ledger: &Ledger<'_>,
    progress: &dyn ProgressReporter,
    group: &PageGroup,
    engine: &mut ConsensusEngine<R>,
    stats: &mut RunStats,
    collected_on: chrono::NaiveDate,
) -> Result<ResultTable> {
    ledger.mark(&group.key, PageGroupState::Untouched, None).await;

    if let Some(pdf) = &group.source_pdf {
        collab
            .renderer
            .render(pdf, &group.image_dir, config.overwrite)
            .await?;
    }
    let images = list_images(&group.image_dir)?;
    if images.is_empty() {
        warn!(dir = %group.image_dir.display(), "page-group has no images");
    }
    ledger.mark(&group.key, PageGroupState::ImagesPrepared, None).await;

    let mut acc = PageGroupAccumulator::new(&group.key);
    for (n, path) in images.iter().enumerate() {
        // one buffer per image, shared by extraction and every validation pass
        let image = PageImage::load(path).await?;
        let primary = extract_primary(config, collab, &image).await?;

        let mut passes = Vec::with_capacity(config.validations as usize);
        if !primary.is_empty() {
            for pass_no in 1..=config.validations {
                let answer = match with_retry(&config.retry, "validate", || {
                    collab.extraction.validate(&image, &primary)
                })
                .await
                {
                    Ok(answer) => answer,
                    Err(e) if e.is_unusable_answer() => {
                        warn!(page = %image.name, pass = pass_no, error = %e, "unusable validation answer, pass does not vote");
                        Vec::new()
                    }
                    Err(e) => return Err(e),
                };
                passes.push(align_pass(primary.len(), &answer, &image.name, pass_no));
            }
        }

        acc.add_page(&image.name, &primary, &passes, engine);
        stats.pages += 1;
        progress.page_processed(&image.name, n + 1, images.len());
    }
    ledger
        .mark(&group.key, PageGroupState::Extracted, Some(acc.len()))
        .await;

    if config.categorize && !acc.is_empty() {
        progress.phase("Classifying products");
        let classifier =
            TwoStageClassifier::new(collab.classification, collab.cache, config.classifier);
        let report = classifier.classify(&acc.classification_names()).await?;
        acc.apply_assignments(&report.assignments);
        stats.classifier.merge(&report.stats);
        ledger.mark(&group.key, PageGroupState::Classified, None).await;
    }

    acc.stamp(collected_on);
    Ok(acc.finish())
}

/// Primary extraction of one image. Records without a name are dropped.
async fn extract_primary(
    config: &RunConfig,
    collab: &Collaborators<'_>,
    image: &PageImage,
) -> Result<Vec<ProductRecord>> {
    let answer = match with_retry(&config.retry, "extract", || collab.extraction.extract(image)).await {
        Ok(answer) => answer,
        Err(e) if e.is_unusable_answer() => {
            warn!(page = %image.name, error = %e, "unusable extraction answer, page yields no products");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    Ok(answer
        .iter()
        .filter_map(|value| match ProductRecord::from_json(value) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(page = %image.name, error = %e, "dropping extracted product");
                None
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::NoCache;
    use crate::pages::PrerenderedPages;
    use async_trait::async_trait;
    use bbqscan_llm::StubClient;
    use bbqscan_shared::{
        BbqScanError, ClassifierSettings, CoarseCategory, CoarseVerdict, FinalCategory,
        GrillVerdict, MismatchPolicy, RetryPolicy,
    };
    use bbqscan_storage::CsvResultStore;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use serde_json::{Value, json};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn temp_root() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("bbq-run-test-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_image(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, [0x89, b'P', b'N', b'G']).unwrap();
    }

    fn run_config(root: &Path, validations: u32) -> RunConfig {
        RunConfig {
            root: root.to_path_buf(),
            validations,
            categorize: true,
            overwrite: false,
            results_file: "results.csv".into(),
            retry: RetryPolicy::immediate(2),
            classifier: ClassifierSettings {
                batch_size: 5,
                max_concurrent_batches: 2,
                mismatch_policy: MismatchPolicy::Stage,
                retry: RetryPolicy::immediate(2),
            },
            seed: Some(11),
            collected_on: NaiveDate::from_ymd_opt(2024, 5, 14),
        }
    }

    /// Returns the same products for every page and every pass.
    struct FixedExtraction {
        products: Vec<Value>,
        extract_calls: AtomicUsize,
        validate_calls: AtomicUsize,
    }

    impl FixedExtraction {
        fn new(products: Vec<Value>) -> Self {
            Self {
                products,
                extract_calls: AtomicUsize::new(0),
                validate_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ExtractionService for FixedExtraction {
        async fn extract(&self, _image: &PageImage) -> Result<Vec<Value>> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.products.clone())
        }

        async fn validate(&self, _image: &PageImage, _primary: &[ProductRecord]) -> Result<Vec<Value>> {
            self.validate_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.products.clone())
        }
    }

    /// Answers from a fixed table: name → (label, certainty, is_grill, grill certainty).
    struct TableClassifier {
        rows: Vec<(&'static str, &'static str, u8, bool, u8)>,
        calls: AtomicUsize,
    }

    impl TableClassifier {
        fn row(&self, name: &str) -> (&'static str, &'static str, u8, bool, u8) {
            *self.rows.iter().find(|r| r.0 == name).unwrap()
        }
    }

    #[async_trait]
    impl ClassificationService for TableClassifier {
        fn model_id(&self) -> &str {
            "table"
        }

        async fn categorize(&self, names: &[String]) -> Result<Vec<CoarseVerdict>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(names
                .iter()
                .map(|n| {
                    let r = self.row(n);
                    CoarseVerdict {
                        category: r.1.into(),
                        certainty: r.2,
                    }
                })
                .collect())
        }

        async fn classify_grill(&self, _c: CoarseCategory, names: &[String]) -> Result<Vec<GrillVerdict>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(names
                .iter()
                .map(|n| {
                    let r = self.row(n);
                    GrillVerdict {
                        is_grill: r.3,
                        certainty: r.4,
                    }
                })
                .collect())
        }
    }

    fn two_products() -> Vec<Value> {
        vec![
            json!({"product_name": "Pouletflügeli", "original_price": "9.90", "discount_price": "6.90", "percentage_discount": 30}),
            json!({"product_name": "Grillkäse", "original_price": 4.5, "discount_price": null, "percentage_discount": null}),
        ]
    }

    fn table_classifier() -> TableClassifier {
        TableClassifier {
            rows: vec![
                ("Pouletflügeli", "Geflügel", 90, true, 85),
                ("Grillkäse", "Käse", 95, true, 92),
                ("Zahnpasta", "other", 99, true, 99),
            ],
            calls: AtomicUsize::new(0),
        }
    }

    #[tokio::test]
    async fn single_group_end_to_end() {
        let root = temp_root();
        write_image(&root.join("A").join("page-1.png"));
        let extraction = FixedExtraction::new(two_products());
        let classification = table_classifier();
        let store = CsvResultStore::new(&root, "results.csv");
        let collab = Collaborators {
            extraction: &extraction,
            classification: &classification,
            store: &store,
            renderer: &PrerenderedPages,
            ledger: None,
            cache: &NoCache,
        };

        let outcome = run_pipeline(&run_config(&root, 1), &collab, &SilentProgress)
            .await
            .unwrap();
        let RunOutcome::Completed { combined, stats } = outcome else {
            panic!("expected a completed run");
        };

        assert_eq!(combined.len(), 2);
        for row in &combined.rows {
            assert_eq!(row.folder, "A");
            assert_eq!(row.confidence_product_name, Some(1.0));
            assert_eq!(row.confidence_original_price, Some(1.0));
            assert_eq!(row.calendar_week, Some(20));
        }
        assert_eq!(combined.rows[0].final_category, Some(FinalCategory::Poultry));
        assert_eq!(combined.rows[0].final_certainty, Some(85));
        assert_eq!(combined.rows[1].final_category, Some(FinalCategory::Cheese));
        assert_eq!(combined.rows[1].final_certainty, Some(92));
        assert_eq!(combined.rows[1].final_discount_price, None);
        assert_eq!(combined.rows[1].final_original_price, Some(Decimal::new(45, 1)));

        assert_eq!(stats.groups_processed, 1);
        assert_eq!(stats.pages, 1);
        assert_eq!(extraction.extract_calls.load(Ordering::SeqCst), 1);
        assert_eq!(extraction.validate_calls.load(Ordering::SeqCst), 1);
        assert!(store.exists(&StoreKey::Group("A".into())).unwrap());
        assert_eq!(store.read(&StoreKey::Run).unwrap().len(), 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn other_category_reduces_to_no_grill_product() {
        let root = temp_root();
        write_image(&root.join("B").join("p1.png"));
        let extraction = FixedExtraction::new(vec![json!({"product_name": "Zahnpasta", "original_price": "3.20"})]);
        let classification = table_classifier();
        let store = CsvResultStore::new(&root, "results.csv");
        let collab = Collaborators {
            extraction: &extraction,
            classification: &classification,
            store: &store,
            renderer: &PrerenderedPages,
            ledger: None,
            cache: &NoCache,
        };

        let RunOutcome::Completed { combined, .. } =
            run_pipeline(&run_config(&root, 2), &collab, &SilentProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(combined.rows[0].final_category, Some(FinalCategory::NoGrillProduct));
        assert_eq!(combined.rows[0].is_grill, Some(true));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn persisted_groups_are_resumed_without_calls() {
        let root = temp_root();
        write_image(&root.join("kw1").join("p1.png"));
        write_image(&root.join("kw2").join("p1.png"));
        let store = CsvResultStore::new(&root, "results.csv");
        let classification = table_classifier();

        let first = FixedExtraction::new(two_products());
        let collab = Collaborators {
            extraction: &first,
            classification: &classification,
            store: &store,
            renderer: &PrerenderedPages,
            ledger: None,
            cache: &NoCache,
        };
        run_pipeline(&run_config(&root, 1), &collab, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(first.extract_calls.load(Ordering::SeqCst), 2);
        let classify_calls = classification.calls.load(Ordering::SeqCst);
        assert!(classify_calls > 0);

        // drop the combined table so the run is not skipped as a whole
        let combined_path = store.path_for(&StoreKey::Run);
        let original = std::fs::read(&combined_path).unwrap();
        std::fs::remove_file(&combined_path).unwrap();
        let second = FixedExtraction::new(two_products());
        let collab = Collaborators {
            extraction: &second,
            ..collab
        };
        let RunOutcome::Completed { combined, stats } =
            run_pipeline(&run_config(&root, 1), &collab, &SilentProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };
        assert_eq!(second.extract_calls.load(Ordering::SeqCst), 0);
        assert_eq!(second.validate_calls.load(Ordering::SeqCst), 0);
        assert_eq!(classification.calls.load(Ordering::SeqCst), classify_calls);
        assert_eq!(stats.groups_skipped, 2);

        // the rebuilt combined table is exactly the stored group tables
        let mut stored = store.read(&StoreKey::Group("kw1".into())).unwrap().rows;
        stored.extend(store.read(&StoreKey::Group("kw2".into())).unwrap().rows);
        assert_eq!(combined.len(), 4);
        assert_eq!(combined.rows, stored);
        assert_eq!(std::fs::read(&combined_path).unwrap(), original);

        // combined table present: whole run is skipped
        let outcome = run_pipeline(&run_config(&root, 1), &collab, &SilentProgress)
            .await
            .unwrap();
        assert!(matches!(outcome, RunOutcome::Skipped));

        // overwrite recomputes everything
        let mut config = run_config(&root, 1);
        config.overwrite = true;
        run_pipeline(&config, &collab, &SilentProgress).await.unwrap();
        assert_eq!(second.extract_calls.load(Ordering::SeqCst), 2);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn stub_run_records_ledger_states() {
        let root = temp_root();
        write_image(&root.join("leaflet").join("leaflet-1.png"));
        write_image(&root.join("leaflet").join("leaflet-2.png"));
        write_image(&root.join("loose.jpg"));
        let ledger = Storage::open(&root.join(".bbqscan.db")).await.unwrap();
        let stub = StubClient::new();
        let store = CsvResultStore::new(&root, "results.csv");
        let collab = Collaborators {
            extraction: &stub,
            classification: &stub,
            store: &store,
            renderer: &PrerenderedPages,
            ledger: Some(&ledger),
            cache: &ledger,
        };

        let mut config = run_config(&root, 3);
        config.categorize = false;
        let RunOutcome::Completed { combined, stats } =
            run_pipeline(&config, &collab, &SilentProgress).await.unwrap()
        else {
            panic!("expected a completed run");
        };

        // two products per image, three images
        assert_eq!(combined.len(), 6);
        assert_eq!(stats.groups_processed, 2);
        assert!(combined.rows.iter().all(|r| r.category.is_none()));
        assert!(combined.rows.iter().all(|r| r.date_collected.is_some()));
        assert_eq!(combined.rows[2].page, "leaflet-2.png");
        assert_eq!(combined.rows[4].folder, "_loose");

        let root_key = root.display().to_string();
        let states = ledger.list_group_states(&root_key).await.unwrap();
        assert_eq!(states.len(), 2);
        assert!(states.iter().all(|s| s.state == PageGroupState::Persisted));
        let leaflet = states.iter().find(|s| s.group_key == "leaflet").unwrap();
        assert_eq!(leaflet.row_count, Some(4));

        let last = ledger.last_run(&root_key).await.unwrap().unwrap();
        assert_eq!(last.outcome.as_deref(), Some("completed"));
        assert!(last.stats_json.unwrap().contains("\"groups_processed\":2"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn fatal_error_leaves_no_partial_table() {
        struct Down;

        #[async_trait]
        impl ExtractionService for Down {
            async fn extract(&self, _image: &PageImage) -> Result<Vec<Value>> {
                Err(BbqScanError::RateLimited("429".into()))
            }

            async fn validate(&self, _image: &PageImage, _p: &[ProductRecord]) -> Result<Vec<Value>> {
                Err(BbqScanError::RateLimited("429".into()))
            }
        }

        let root = temp_root();
        write_image(&root.join("G").join("p1.png"));
        let classification = table_classifier();
        let store = CsvResultStore::new(&root, "results.csv");
        let collab = Collaborators {
            extraction: &Down,
            classification: &classification,
            store: &store,
            renderer: &PrerenderedPages,
            ledger: None,
            cache: &NoCache,
        };

        let err = run_pipeline(&run_config(&root, 1), &collab, &SilentProgress)
            .await
            .unwrap_err();
        assert!(matches!(err, BbqScanError::RetriesExhausted { attempts: 2, .. }));
        assert!(!store.exists(&StoreKey::Group("G".into())).unwrap());
        assert!(!store.exists(&StoreKey::Run).unwrap());

        let _ = std::fs::remove_dir_all(&root);
    }
}
