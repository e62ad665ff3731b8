use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracker_core::{parse_anchor_str, OwnershipMapping};
use tracker_rollup::{run_rollup, OwnershipSync, RollupConfig};
use tracker_storage::{AggregateRow, GraphStore, NewOrganization, ReportStore};

#[derive(Parser)]
#[command(name = "tracker")]
#[command(about = "DMARC summary rollup and ownership jobs", long_about = None)]
struct Cli {
    /// Graph store holding domains, organizations, summaries and their edges
    #[arg(long, env = "TRACKER_GRAPH_DB", default_value = "tracker-graph.sqlite")]
    graph_db: PathBuf,
    /// Aggregate report store the rollup reads counts from
    #[arg(long, env = "TRACKER_REPORTS_DB", default_value = "tracker-reports.sqlite")]
    reports_db: PathBuf,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize or roll every domain's DMARC summary window
    Rollup {
        /// Anchor date (YYYY-MM-DD); defaults to today in UTC
        #[arg(long, value_parser = parse_anchor_arg)]
        anchor: Option<NaiveDate>,
        /// Only process these domains
        #[arg(long = "domain")]
        domains: Vec<String>,
    },
    /// Upsert organization -> domain ownership edges from a JSON mapping
    SyncOwnership {
        #[arg(long)]
        mapping: PathBuf,
    },
    /// Load aggregate rows exported from the report store
    ImportAggregates {
        #[arg(long)]
        file: PathBuf,
    },
    /// Register a domain
    AddDomain { domain: String },
    /// Register an organization
    AddOrg {
        #[arg(long)]
        acronym_en: String,
        #[arg(long)]
        acronym_fr: String,
        #[arg(long)]
        name_en: Option<String>,
        #[arg(long)]
        name_fr: Option<String>,
    },
    /// Print a domain's summaries
    Summaries {
        #[arg(long)]
        domain: String,
    },
}

fn parse_anchor_arg(raw: &str) -> Result<NaiveDate, String> {
    parse_anchor_str(raw).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::Rollup { anchor, domains } => {
            let graph = open_graph(&cli.graph_db)?;
            let reports = ReportStore::open(&cli.reports_db).with_context(|| {
                format!("Failed to open report store {}", cli.reports_db.display())
            })?;
            let anchor = anchor.unwrap_or_else(|| Utc::now().date_naive());

            let report = run_rollup(
                &graph,
                &reports,
                anchor,
                RollupConfig {
                    only_domains: domains,
                },
            )
            .context("Failed to list domains")?;

            if !report.failures.is_empty() {
                error!(
                    event = "rollup_incomplete",
                    failed = report.failures.len(),
                    succeeded = report.succeeded()
                );
            }
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::SyncOwnership { mapping } => {
            let graph = open_graph(&cli.graph_db)?;
            let raw = fs::read_to_string(&mapping)
                .with_context(|| format!("Failed to read {}", mapping.display()))?;
            let mapping = OwnershipMapping::parse_json(&raw)
                .context("Failed to parse ownership mapping")?;

            let report = OwnershipSync::new().sync(&graph, &mapping);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::ImportAggregates { file } => {
            let reports = ReportStore::open(&cli.reports_db).with_context(|| {
                format!("Failed to open report store {}", cli.reports_db.display())
            })?;
            let raw = fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let rows: Vec<AggregateRow> =
                serde_json::from_str(&raw).context("Failed to parse aggregate rows")?;

            let imported = reports.import(&rows).context("Failed to import rows")?;
            info!(event = "aggregates_imported", rows = imported);
            println!("Imported {imported} aggregate rows");
        }
        Commands::AddDomain { domain } => {
            let graph = open_graph(&cli.graph_db)?;
            let key = graph.upsert_domain(&domain)?;
            println!("{domain} -> domains/{key}");
        }
        Commands::AddOrg {
            acronym_en,
            acronym_fr,
            name_en,
            name_fr,
        } => {
            if acronym_en.trim().is_empty() || acronym_fr.trim().is_empty() {
                bail!("Organization acronyms must not be empty");
            }
            let graph = open_graph(&cli.graph_db)?;
            let key = graph.upsert_organization(&NewOrganization {
                acronym_en: acronym_en.clone(),
                acronym_fr,
                name_en,
                name_fr,
            })?;
            println!("{acronym_en} -> organizations/{key}");
        }
        Commands::Summaries { domain } => {
            let graph = open_graph(&cli.graph_db)?;
            let Some(key) = graph.domain_key(&domain)? else {
                println!("No domain named {domain}");
                return Ok(());
            };
            let summaries = graph.summaries_for(&key)?;
            println!("{}", serde_json::to_string_pretty(&summaries)?);
        }
    }

    Ok(())
}

fn open_graph(path: &Path) -> Result<GraphStore> {
    GraphStore::open(path)
        .with_context(|| format!("Failed to open graph store {}", path.display()))
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("TRACKER_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };

    let filter = if debug {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
