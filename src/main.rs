use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use warm::analysis::{normalize_url, AnalysisOptions, AnalysisReport, Analyzer};
use warm::config::{Config, ConfigOverrides};
use warm::history::{HistoryRecord, HistoryStore};
use warm::output::csv::{diff_to_csv, history_to_csv};
use warm::output::render_json;
use warm::output::table::{render_history_table, render_report};
use warm::scoring::MetricWeights;
use warm::server::run_server;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
    Csv,
}

#[derive(Debug, Parser)]
#[command(
    name = "warm",
    version,
    about = "Compare a suspected phishing site against the legitimate one and score the risk"
)]
struct Cli {
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fingerprint both sites and score the target against the baseline.
    Analyze {
        #[arg(short, long)]
        baseline: String,
        #[arg(short, long)]
        target: String,
        /// Also submit both sites to urlscan.io.
        #[arg(short = 'u', long)]
        urlscan: bool,
        /// Fetch with the browser profile first.
        #[arg(short = 'B', long)]
        browser: bool,
        /// Comma-separated metric keys to leave out of the comparison.
        #[arg(long)]
        ignore: Option<String>,
        /// Write every metric to the audit log, not just mismatches.
        #[arg(long)]
        full_log: bool,
        #[arg(long)]
        reports_dir: Option<String>,
    },
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        target: Option<String>,
    },
    Serve {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[arg(long, default_value_t = 3001)]
        port: u16,
    },
    Config {
        #[arg(long)]
        init: bool,
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(Some(&config_path))?;
    if let Commands::Analyze {
        ignore,
        full_log,
        reports_dir,
        ..
    } = &cli.command
    {
        config.apply_overrides(ConfigOverrides {
            reports_dir: reports_dir.clone(),
            ignore_keys: ignore.as_deref().map(parse_key_list),
            full_log: full_log.then_some(true),
            scan_api_key: None,
        });
    }

    match &cli.command {
        Commands::Config { .. } => handle_config_command(&cli.command, &config, &config_path)?,
        Commands::Serve { host, port } => {
            let bind = format!("{host}:{port}");
            let addr: SocketAddr = bind
                .parse()
                .map_err(|e| anyhow!("invalid bind address {bind}: {e}"))?;
            run_server(config, addr).await?;
        }
        Commands::History { limit, target } => {
            let store = HistoryStore::open(&config.resolved_history_db_path())?;
            let records = match target {
                Some(target) => store.for_target(&normalize_url(target)?, (*limit).max(1))?,
                None => store.recent((*limit).max(1))?,
            };
            print_history(&records, store.count()?, cli.output)?;
        }
        Commands::Analyze {
            baseline,
            target,
            urlscan,
            browser,
            ..
        } => {
            if *urlscan && !config.scan.has_api_key() {
                warn!("no urlscan API key configured; scan fields will be marked as errors");
            }
            let analyzer = Analyzer::from_config(&config)?;
            let mut options = AnalysisOptions::from_config(&config);
            options.browser = *browser;
            options.scan = *urlscan;

            let report = analyzer.run(baseline, target, &options).await?;
            print_report(&report, analyzer.scorer().weights(), cli.output)?;
            record_history(&config, &report);
        }
    }

    Ok(())
}

fn handle_config_command(command: &Commands, config: &Config, config_path: &PathBuf) -> Result<()> {
    let Commands::Config { init, show } = command else {
        return Ok(());
    };
    if *init {
        Config::write_template(config_path)?;
        println!("Wrote config template to {}", config_path.display());
    }
    if *show || !*init {
        println!("{}", render_json(config)?);
    }
    Ok(())
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

fn record_history(config: &Config, report: &AnalysisReport) {
    let db_path = config.resolved_history_db_path();
    let result = HistoryStore::open(&db_path)
        .and_then(|store| store.insert(&HistoryRecord::from_report(report)));
    match result {
        Ok(id) => info!("recorded analysis #{id} in {}", db_path.display()),
        Err(err) => warn!("failed to record analysis history: {err:#}"),
    }
}

fn print_report(report: &AnalysisReport, weights: &MetricWeights, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Table => println!("{}", render_report(report, weights)),
        OutputFormat::Json => println!("{}", render_json(report)?),
        OutputFormat::Csv => print!("{}", diff_to_csv(&report.comparisons, weights)?),
    }
    Ok(())
}

fn print_history(records: &[HistoryRecord], total: u64, output: OutputFormat) -> Result<()> {
    match output {
        OutputFormat::Table => {
            if records.is_empty() {
                println!("No matching analyses ({total} recorded).");
            } else {
                println!("{}", render_history_table(records));
                println!("Showing {} of {total} recorded analyses.", records.len());
            }
        }
        OutputFormat::Json => println!("{}", render_json(records)?),
        OutputFormat::Csv => print!("{}", history_to_csv(records)?),
    }
    Ok(())
}
