use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand, ValueEnum};
use grind_adapters::{
    DatasetManifest, FolderSource, JsonSource, RecordSource, TreeSource,
};
use grind_core::{Difficulty, FlagKind, ProblemRecord};
use grind_engine::{
    export_csv, CompletionFilter, ExportError, FilterQuery, RevisionFilter, SortDirection,
    SortKey, Workbench, DEFAULT_EXPORT_FILE,
};
use grind_storage::{FileKvStore, PersistOutcome, StorageStatus, DEFAULT_BYTE_BUDGET};

#[derive(Debug, Parser)]
#[command(name = "grind")]
#[command(about = "Company-tagged interview problem workbench")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Ingest problems from an acquisition source and persist the result.
    Load(LoadArgs),
    /// Print the filtered, sorted view.
    List(ViewArgs),
    /// Write the filtered, sorted view to a CSV file.
    Export(ExportArgs),
    /// Flip a completed / for-revision flag for one problem link.
    Toggle(ToggleArgs),
    /// Erase the stored snapshot and both flag sets.
    Clear(ClearArgs),
    /// Report what is durably stored.
    Status,
}

#[derive(Debug, Args)]
struct LoadArgs {
    /// Probe a <root>/<company>/<period>.csv tree.
    #[arg(long, value_name = "DIR", conflicts_with_all = ["folder", "json"])]
    tree: Option<PathBuf>,

    /// Walk an arbitrary folder of CSV files.
    #[arg(long, value_name = "DIR", conflicts_with = "json")]
    folder: Option<PathBuf>,

    /// Read one pre-built JSON record dump.
    #[arg(long, value_name = "FILE")]
    json: Option<PathBuf>,

    /// Dataset manifest for --tree; defaults to discovering companies from
    /// the tree's subdirectories.
    #[arg(long, value_name = "FILE")]
    manifest: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ViewArgs {
    #[arg(long)]
    company: Option<String>,

    /// EASY, MEDIUM or HARD (matched exactly as sourced).
    #[arg(long)]
    difficulty: Option<String>,

    #[arg(long)]
    period: Option<String>,

    #[arg(long)]
    topic: Option<String>,

    #[arg(long, default_value_t = 0.0)]
    min_frequency: f64,

    #[arg(long, default_value_t = 0.0)]
    min_acceptance: f64,

    #[arg(long, conflicts_with = "not_completed")]
    completed: bool,

    #[arg(long)]
    not_completed: bool,

    #[arg(long, conflicts_with = "not_revision")]
    revision: bool,

    #[arg(long)]
    not_revision: bool,

    #[arg(long)]
    search: Option<String>,

    #[arg(long, value_enum)]
    sort: Option<SortField>,

    #[arg(long)]
    desc: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SortField {
    Company,
    Period,
    Difficulty,
    Title,
    Frequency,
    Acceptance,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[command(flatten)]
    view: ViewArgs,

    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FlagArg {
    Done,
    Revise,
}

#[derive(Debug, Args)]
struct ToggleArgs {
    kind: FlagArg,
    link: String,
}

#[derive(Debug, Args)]
struct ClearArgs {
    /// Confirm erasing all saved data. This cannot be undone.
    #[arg(long)]
    yes: bool,
}

#[derive(Debug, Clone)]
struct StoreConfig {
    state_dir: PathBuf,
    byte_budget: u64,
}

impl StoreConfig {
    fn from_env() -> Self {
        Self {
            state_dir: std::env::var("GRIND_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".grind-state")),
            byte_budget: std::env::var("GRIND_STORAGE_BUDGET_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BYTE_BUDGET),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = StoreConfig::from_env();
    let kv = FileKvStore::new(&config.state_dir, Some(config.byte_budget));
    let mut bench = Workbench::open(kv).await?;

    match cli.command {
        Commands::Load(args) => {
            let mut source = build_source(args)?;
            let summary = bench.ingest(source.as_mut()).await?;
            println!(
                "load complete: run_id={} source={} batches={} parsed={} inserted={} merged={} skipped={} total={}",
                summary.run_id,
                summary.source,
                summary.batches,
                summary.parsed_records,
                summary.inserted,
                summary.merged,
                summary.skipped,
                summary.total_records
            );
            match summary.persist {
                PersistOutcome::Full { .. } => {}
                PersistOutcome::Truncated { saved, total } => eprintln!(
                    "warning: storage quota hit; saved the top {saved} of {total} problems by frequency"
                ),
                PersistOutcome::Failed => eprintln!(
                    "warning: the collection could not be persisted; it stays usable in memory this session"
                ),
            }
        }
        Commands::List(args) => {
            let (query, sort) = view_request(&args);
            let view = bench.view(&query, sort);
            print_view(&view, &bench);
        }
        Commands::Export(args) => {
            let (query, sort) = view_request(&args.view);
            let view = bench.view(&query, sort);
            match export_csv(&view, bench.flags()) {
                Ok(csv) => {
                    let out = args
                        .out
                        .unwrap_or_else(|| PathBuf::from(DEFAULT_EXPORT_FILE));
                    tokio::fs::write(&out, csv)
                        .await
                        .with_context(|| format!("writing {}", out.display()))?;
                    println!("exported {} problems to {}", view.len(), out.display());
                }
                Err(ExportError::NoRecords) => println!("no problems to export"),
            }
        }
        Commands::Toggle(args) => {
            let kind = match args.kind {
                FlagArg::Done => FlagKind::Completed,
                FlagArg::Revise => FlagKind::ForRevision,
            };
            match bench.toggle_flag(kind, &args.link).await? {
                Some(true) => println!("marked {}", args.link),
                Some(false) => println!("unmarked {}", args.link),
                None => println!("problem has no link; flag not recorded"),
            }
        }
        Commands::Clear(args) => {
            if !args.yes {
                bail!("refusing to clear saved data without --yes");
            }
            bench.clear().await?;
            println!("all saved data has been cleared");
        }
        Commands::Status => {
            print_status(&bench.status().await?);
        }
    }

    Ok(())
}

fn build_source(args: LoadArgs) -> Result<Box<dyn RecordSource>> {
    if let Some(root) = args.tree {
        let manifest = match &args.manifest {
            Some(path) => DatasetManifest::from_yaml_file(path)?,
            None => DatasetManifest::discover(&root)?,
        };
        return Ok(Box::new(TreeSource::new(root, &manifest)));
    }
    if let Some(root) = args.folder {
        return Ok(Box::new(FolderSource::new(root)?));
    }
    if let Some(path) = args.json {
        return Ok(Box::new(JsonSource::new(path)));
    }
    bail!("choose an acquisition source: --tree, --folder or --json");
}

fn view_request(args: &ViewArgs) -> (FilterQuery, Option<(SortKey, SortDirection)>) {
    let completion = if args.completed {
        CompletionFilter::Completed
    } else if args.not_completed {
        CompletionFilter::NotCompleted
    } else {
        CompletionFilter::Any
    };
    let revision = if args.revision {
        RevisionFilter::Marked
    } else if args.not_revision {
        RevisionFilter::NotMarked
    } else {
        RevisionFilter::Any
    };

    let query = FilterQuery {
        company: args.company.clone(),
        difficulty: args
            .difficulty
            .clone()
            .map(Difficulty::from),
        time_period: args.period.clone(),
        topic: args.topic.clone(),
        min_frequency: args.min_frequency,
        min_acceptance_percent: args.min_acceptance,
        completion,
        revision,
        search_text: args.search.clone(),
    };

    let direction = if args.desc {
        SortDirection::Descending
    } else {
        SortDirection::Ascending
    };
    let sort = args.sort.map(|field| {
        let key = match field {
            SortField::Company => SortKey::Company,
            SortField::Period => SortKey::TimePeriod,
            SortField::Difficulty => SortKey::Difficulty,
            SortField::Title => SortKey::Title,
            SortField::Frequency => SortKey::Frequency,
            SortField::Acceptance => SortKey::AcceptanceRate,
        };
        (key, direction)
    });

    (query, sort)
}

fn print_view<K: grind_storage::KvStore>(view: &[&ProblemRecord], bench: &Workbench<K>) {
    for record in view {
        let done = if bench.flags().is_completed(&record.link) {
            "[x]"
        } else {
            "[ ]"
        };
        let revise = if bench.flags().is_for_revision(&record.link) {
            "[*]"
        } else {
            "[ ]"
        };
        let acceptance = match record.acceptance_rate.raw() {
            "" => String::new(),
            _ => format!("{:.1}%", record.acceptance_rate.value() * 100.0),
        };
        println!(
            "{} {} {:<6} {:>8} {:>7}  {} | {} | {} | {} | {}",
            done,
            revise,
            record.difficulty.as_str(),
            record.frequency.raw(),
            acceptance,
            record.title,
            record.link,
            record.companies_joined(),
            record.time_periods_joined(),
            record.topics_joined()
        );
    }

    println!("{} problems found", view.len());
    let completed = view
        .iter()
        .filter(|r| bench.flags().is_completed(&r.link))
        .count();
    let for_revision = view
        .iter()
        .filter(|r| bench.flags().is_for_revision(&r.link))
        .count();
    let percent = |count: usize| {
        if view.is_empty() {
            0
        } else {
            (count as f64 / view.len() as f64 * 100.0).round() as u32
        }
    };
    println!(
        "{} completed ({}%), {} for revision ({}%)",
        completed,
        percent(completed),
        for_revision,
        percent(for_revision)
    );
}

fn print_status(status: &StorageStatus) {
    match status.stored_records {
        Some(count) => println!(
            "{count} problems stored ({})",
            format_bytes(status.used_bytes)
        ),
        None => println!("no data stored"),
    }
    if let Some(saved_at) = status.saved_at {
        println!("last saved: {}", humanize_age(saved_at));
    }
    if status.truncated {
        println!("note: only high-frequency problems are saved due to storage limits");
    }
    if let Some(percent) = status.percent_of_budget {
        if percent > 80.0 {
            println!(
                "warning: storage is {}% full; consider clearing some data",
                percent.round()
            );
        }
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes > 1024 * 1024 {
        format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes > 0 {
        format!("{:.2} KB", bytes as f64 / 1024.0)
    } else {
        "0 B".to_string()
    }
}

fn humanize_age(saved_at: DateTime<Utc>) -> String {
    let minutes = (Utc::now() - saved_at).num_minutes();
    if minutes < 1 {
        "just now".to_string()
    } else if minutes < 60 {
        format!("{minutes} minute{} ago", plural(minutes))
    } else if minutes < 24 * 60 {
        let hours = minutes / 60;
        format!("{hours} hour{} ago", plural(hours))
    } else {
        let days = minutes / (60 * 24);
        format!("{days} day{} ago", plural(days))
    }
}

fn plural(count: i64) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}
