//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};

use bbqscan_core::evaluation::{self, EvaluationReport};
use bbqscan_core::pages::discover_groups;
use bbqscan_core::{
    ClassificationCache, Collaborators, NoCache, PdftoppmRenderer, ProgressReporter, RunOutcome,
    RunStats, TwoStageClassifier, run_pipeline,
};
use bbqscan_llm::{ClassificationService, ExtractionService, OpenAiClient, StubClient};
use bbqscan_shared::{
    AppConfig, ClassifierSettings, PageGroupState, RunConfig, init_config, load_config,
    validate_api_key,
};
use bbqscan_storage::{CsvResultStore, LEDGER_FILE_NAME, ResultStore, Storage, StoreKey};
use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// bbqscan: find the grill products in grocery leaflets.
#[derive(Parser)]
#[command(
    name = "bbqscan",
    version,
    about = "Extract products from grocery leaflets and classify grill products.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process every page-group under a leaflet directory.
    Run {
        /// Directory holding leaflet PDFs or page images (defaults to config).
        #[arg(long)]
        pdf_dir: Option<PathBuf>,

        /// Recompute page-groups that already have a result table.
        #[arg(long)]
        overwrite_results: bool,

        /// Skip classification, only extract and validate.
        #[arg(long)]
        no_categorize: bool,

        /// Answer locally instead of calling the model endpoint.
        #[arg(long)]
        use_test_client: bool,

        /// Validation passes per page (defaults to config).
        #[arg(long)]
        validations: Option<u32>,

        /// Seed for breaking ties between equally voted values.
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Classify product names given on the command line.
    Classify {
        /// Answer locally instead of calling the model endpoint.
        #[arg(long)]
        use_test_client: bool,

        /// Product names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Measure classification accuracy against a labelled CSV.
    Evaluate {
        /// CSV with product_name, solution_category, solution_is_grill columns.
        #[arg(long)]
        labels: PathBuf,

        /// Answer locally instead of calling the model endpoint.
        #[arg(long)]
        use_test_client: bool,
    },

    /// Show the recorded state of each page-group.
    Status {
        /// Leaflet directory (defaults to config).
        #[arg(long)]
        pdf_dir: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "bbqscan=info",
        1 => "bbqscan=debug",
        _ => "bbqscan=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            pdf_dir,
            overwrite_results,
            no_categorize,
            use_test_client,
            validations,
            seed,
        } => {
            let config = load_config()?;
            let mut run_config = RunConfig::from(&config);
            if let Some(dir) = pdf_dir {
                run_config.root = dir;
            }
            if let Some(n) = validations {
                run_config.validations = n;
            }
            run_config.overwrite = overwrite_results;
            run_config.categorize = run_config.categorize && !no_categorize;
            run_config.seed = seed;
            cmd_run(&config, run_config, use_test_client).await
        }
        Command::Classify {
            use_test_client,
            names,
        } => cmd_classify(&names, use_test_client).await,
        Command::Evaluate {
            labels,
            use_test_client,
        } => cmd_evaluate(&labels, use_test_client).await,
        Command::Status { pdf_dir } => cmd_status(pdf_dir).await,
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init().await,
            ConfigAction::Show => cmd_config_show().await,
        },
    }
}

/// The capability implementation selected on the command line.
enum Backend {
    Remote(OpenAiClient),
    Stub(StubClient),
}

impl Backend {
    fn select(config: &AppConfig, use_test_client: bool) -> Result<Self> {
        if use_test_client {
            info!("using local test client");
            return Ok(Self::Stub(StubClient::new()));
        }
        // Validate API key before doing anything
        let api_key = validate_api_key(config)?;
        Ok(Self::Remote(OpenAiClient::new(&config.openai, api_key)?))
    }

    fn extraction(&self) -> &dyn ExtractionService {
        match self {
            Self::Remote(client) => client,
            Self::Stub(client) => client,
        }
    }

    fn classification(&self) -> &dyn ClassificationService {
        match self {
            Self::Remote(client) => client,
            Self::Stub(client) => client,
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(config: &AppConfig, run_config: RunConfig, use_test_client: bool) -> Result<()> {
    let root = &run_config.root;
    if !root.is_dir() {
        return Err(eyre!("leaflet directory '{}' does not exist", root.display()));
    }
    let backend = Backend::select(config, use_test_client)?;

    let ledger = match Storage::open(&root.join(LEDGER_FILE_NAME)).await {
        Ok(storage) => Some(storage),
        Err(e) => {
            warn!(error = %e, "run ledger unavailable, continuing without it");
            None
        }
    };
    let cache: &dyn ClassificationCache = match &ledger {
        Some(storage) => storage,
        None => &NoCache,
    };
    let store = CsvResultStore::new(root, &run_config.results_file);
    let renderer = PdftoppmRenderer::new(&config.rendering.command, config.rendering.dpi);
    let collab = Collaborators {
        extraction: backend.extraction(),
        classification: backend.classification(),
        store: &store,
        renderer: &renderer,
        ledger: ledger.as_ref(),
        cache,
    };

    info!(
        root = %root.display(),
        validations = run_config.validations,
        categorize = run_config.categorize,
        overwrite = run_config.overwrite,
        "starting run"
    );

    let reporter = CliProgress::new();
    let outcome = tokio::select! {
        outcome = run_pipeline(&run_config, &collab, &reporter) => outcome?,
        _ = tokio::signal::ctrl_c() => {
            reporter.spinner.finish_and_clear();
            warn!("interrupted, only fully written page-groups were kept");
            return Err(eyre!("run cancelled"));
        }
    };

    let output = store.path_for(&StoreKey::Run);
    match outcome {
        RunOutcome::Skipped => {
            println!(
                "Nothing to do: {} already exists (use --overwrite-results to recompute).",
                output.display()
            );
        }
        RunOutcome::Completed { stats, .. } => print_run_summary(&stats, &output),
    }
    Ok(())
}

fn print_run_summary(stats: &RunStats, output: &Path) {
    println!();
    println!("  Run complete!");
    println!("  Page-groups: {} processed, {} resumed", stats.groups_processed, stats.groups_skipped);
    println!("  Pages:       {}", stats.pages);
    println!("  Rows:        {} new, {} total", stats.rows, stats.combined_rows);
    if stats.classifier.batches > 0 {
        println!(
            "  Batches:     {} ({} cached, {} rejected)",
            stats.classifier.batches, stats.classifier.cache_hits, stats.classifier.rejected_batches
        );
    }
    println!("  Output:      {}", output.display());
    println!("  Time:        {:.1}s", stats.elapsed_ms as f64 / 1000.0);
    println!();
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl ProgressReporter for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn group_started(&self, key: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Page-group [{current}/{total}] {key}"));
    }

    fn group_skipped(&self, key: &str) {
        self.spinner.set_message(format!("Resuming {key}"));
    }

    fn page_processed(&self, page: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Extracted [{current}/{total}] {page}"));
    }

    fn done(&self, _stats: &RunStats) {
        self.spinner.finish_and_clear();
    }
}

// ---------------------------------------------------------------------------
// classify / evaluate
// ---------------------------------------------------------------------------

async fn cmd_classify(names: &[String], use_test_client: bool) -> Result<()> {
    let config = load_config()?;
    let backend = Backend::select(&config, use_test_client)?;
    let classifier = TwoStageClassifier::new(
        backend.classification(),
        &NoCache,
        ClassifierSettings::from(&config),
    );

    let report = classifier.classify(names).await?;
    println!();
    for (name, assignment) in names.iter().zip(&report.assignments) {
        match assignment {
            Some(a) => {
                let grill = a
                    .grill
                    .map(|g| format!("grill={} ({}%)", g.is_grill, g.certainty))
                    .unwrap_or_else(|| "grill=?".to_string());
                let final_class = a
                    .reduce()
                    .map(|f| format!("{} ({}%)", f.category, f.certainty))
                    .unwrap_or_else(|| "unclassified".to_string());
                println!("  {name}: {} ({}%), {grill} => {final_class}", a.category, a.certainty);
            }
            None => println!("  {name}: unclassified"),
        }
    }
    println!();
    Ok(())
}

async fn cmd_evaluate(labels: &Path, use_test_client: bool) -> Result<()> {
    let config = load_config()?;
    let products = evaluation::read_labels(labels)?;
    if products.is_empty() {
        return Err(eyre!("no labelled products in '{}'", labels.display()));
    }
    let backend = Backend::select(&config, use_test_client)?;
    let classifier = TwoStageClassifier::new(
        backend.classification(),
        &NoCache,
        ClassifierSettings::from(&config),
    );

    info!(products = products.len(), "evaluating classifier");
    let report = evaluation::evaluate(&products, &classifier).await?;
    print_evaluation(&report);
    Ok(())
}

fn print_evaluation(report: &EvaluationReport) {
    println!();
    println!("  Category accuracy:        {}", report.category);
    println!("  Grill accuracy:           {}", report.grill);
    println!("  Labelled grill products:");
    println!("    category:               {}", report.category_when_grill);
    println!("    grill flag:             {}", report.grill_when_grill);
    println!("  Labelled non-grill products:");
    println!("    category:               {}", report.category_when_not_grill);
    println!("    grill flag:             {}", report.grill_when_not_grill);

    if !report.mismatches.is_empty() {
        println!();
        println!("  Mismatches:");
        for m in &report.mismatches {
            let predicted = m
                .predicted_category
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unclassified".to_string());
            let grill = m
                .predicted_is_grill
                .map(|g| g.to_string())
                .unwrap_or_else(|| "?".to_string());
            println!(
                "    {}: expected {} / grill={}, got {} / grill={}",
                m.name, m.expected_category, m.expected_is_grill, predicted, grill
            );
        }
    }
    println!();
}

// ---------------------------------------------------------------------------
// status / config
// ---------------------------------------------------------------------------

async fn cmd_status(pdf_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config()?;
    let root = pdf_dir.unwrap_or_else(|| PathBuf::from(&config.defaults.pdf_dir));
    if !root.is_dir() {
        return Err(eyre!("leaflet directory '{}' does not exist", root.display()));
    }

    let store = CsvResultStore::new(&root, &config.defaults.results_file);
    let groups = discover_groups(&root, &config.defaults.results_file)?;
    let root_key = root.display().to_string();

    let (last_run, recorded) = match Storage::open_readonly(&root.join(LEDGER_FILE_NAME)).await {
        Ok(ledger) => (
            ledger.last_run(&root_key).await?,
            ledger.list_group_states(&root_key).await?,
        ),
        Err(_) => (None, Vec::new()),
    };

    println!();
    match &last_run {
        Some(run) => println!(
            "  Last run: {} ({})",
            run.started_at,
            run.outcome.as_deref().unwrap_or("unfinished")
        ),
        None => println!("  Last run: none recorded"),
    }
    println!(
        "  Combined table: {}",
        if store.exists(&StoreKey::Run)? { "present" } else { "missing" }
    );
    println!();

    for group in &groups {
        let record = recorded.iter().find(|r| r.group_key == group.key);
        // a table on disk is authoritative even without a ledger entry
        let state = if store.exists(&StoreKey::Group(group.key.clone()))? {
            PageGroupState::Persisted
        } else {
            record.map_or(PageGroupState::Untouched, |r| r.state)
        };
        let rows = record
            .and_then(|r| r.row_count)
            .map(|n| format!(" ({n} rows)"))
            .unwrap_or_default();
        println!("  {:<32} {state}{rows}", group.key);
    }
    if groups.is_empty() {
        println!("  No page-groups found.");
    }
    println!();
    Ok(())
}

async fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
