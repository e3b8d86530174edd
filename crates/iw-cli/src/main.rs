//! Incident Warden CLI
//!
//! Command-line interface and daemon for the Incident Warden detection and
//! remediation pipeline.

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use iw_core::{Incident, RuleTestReport, Severity};
use std::path::PathBuf;

mod commands;
mod config;
mod validator;

use commands::{list_incidents, run_daemon, test_rule};
use config::{AppConfig, DEFAULT_CONFIG_FILE};
use validator::ConfigValidator;

#[derive(Parser)]
#[command(name = "incident-warden")]
#[command(version)]
#[command(about = "Incident detection, remediation and SLA tracking", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Output format (text, json)
    #[arg(long, default_value = "text")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}", s)),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the detection, remediation and SLA daemon
    Run {
        /// Serve Prometheus metrics on this port
        #[arg(long, env = "IW_METRICS_PORT")]
        metrics_port: Option<u16>,
    },

    /// Dry-run a detection rule and print what a sweep would do
    TestRule {
        /// Rule name from the rules file
        name: String,
    },

    /// Validate configuration and the rules file
    Validate,

    /// List incidents from the snapshot directory
    Incidents {
        /// Filter by status (detected, assigned, in_progress, resolved, closed)
        #[arg(short, long)]
        status: Option<String>,

        /// Maximum number of incidents to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::resolve(cli.config.as_deref())?;

    let mut logging = config.logging.clone();
    if cli.verbose {
        logging.level = tracing::Level::DEBUG;
    }
    logging.json_format |= cli.format == OutputFormat::Json;
    iw_observability::init_logging_with_config(logging);

    match cli.command {
        Commands::Run { metrics_port } => cmd_run(config, metrics_port).await,
        Commands::TestRule { name } => cmd_test_rule(config, &name, cli.format).await,
        Commands::Validate => {
            let source = cli
                .config
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            cmd_validate(config, source)
        }
        Commands::Incidents { status, limit } => {
            cmd_incidents(config, status.as_deref(), limit, cli.format).await
        }
    }
}

async fn cmd_run(config: AppConfig, metrics_port: Option<u16>) -> Result<()> {
    println!("{}", "Validating configuration...".cyan());

    let validation_result = ConfigValidator::validate(&config);
    validation_result.print();

    if validation_result.has_errors() {
        println!();
        println!(
            "{}",
            "Daemon startup aborted due to configuration errors. Fix the errors above and try again."
                .red()
                .bold()
        );
        std::process::exit(1);
    }

    println!();
    run_daemon(config, metrics_port).await
}

async fn cmd_test_rule(config: AppConfig, name: &str, format: OutputFormat) -> Result<()> {
    let report = test_rule(&config, name).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    print_report(&report);
    Ok(())
}

fn print_report(report: &RuleTestReport) {
    println!("{} {}", "Rule:".bold(), report.rule_name);
    println!("─────────────────────────────────────────");
    if let Some(error) = &report.error {
        println!("  {} {}", "Error:".red(), error);
        return;
    }
    println!("  {} {}", "Rows:".cyan(), report.row_count);
    println!("  {} {}", "Aggregate:".cyan(), report.aggregate);
    println!("  {} {}", "Threshold:".cyan(), report.threshold);
    let verdict = if report.would_trigger {
        "yes".red().bold()
    } else {
        "no".green()
    };
    println!("  {} {}", "Would trigger:".cyan(), verdict);
    if !report.affected_systems.is_empty() {
        println!(
            "  {} {}",
            "Affected systems:".cyan(),
            report.affected_systems.join(", ")
        );
    }
    if !report.sample_rows.is_empty() {
        println!("  {}", "Sample rows:".cyan());
        for row in &report.sample_rows {
            println!("    {}", serde_json::Value::Object(row.clone()));
        }
    }
}

fn cmd_validate(config: AppConfig, source: PathBuf) -> Result<()> {
    println!(
        "Validating configuration: {}",
        source.display().to_string().cyan()
    );

    let validation_result = ConfigValidator::validate(&config);
    validation_result.print();

    println!();
    println!("{}", "Configuration Summary".bold());
    println!("─────────────────────");
    println!(
        "  Log source: {}",
        config
            .log_source
            .as_ref()
            .map(|s| s.base_url.as_str())
            .unwrap_or("(none)")
    );
    println!(
        "  Analyzer: {}",
        config
            .analyzer
            .as_ref()
            .map(|s| s.base_url.as_str())
            .unwrap_or("(none)")
    );
    println!("  Approval rules: {}", config.policy.approval.rules.len());
    println!("  Playbooks: {}", config.playbooks.len());
    println!("  Dry run: {}", config.engine.dry_run);

    if validation_result.has_errors() {
        println!();
        println!(
            "{}",
            "Configuration validation failed. Fix the errors above."
                .red()
                .bold()
        );
        std::process::exit(1);
    } else if validation_result.has_warnings() {
        println!();
        println!(
            "{}",
            "Configuration is valid with warnings. Review the warnings above."
                .yellow()
                .bold()
        );
    } else {
        println!();
        println!("{}", "Configuration is valid.".green().bold());
    }

    Ok(())
}

async fn cmd_incidents(
    config: AppConfig,
    status: Option<&str>,
    limit: usize,
    format: OutputFormat,
) -> Result<()> {
    let incidents = list_incidents(&config, status, limit).await?;

    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&incidents)?);
        return Ok(());
    }

    println!("{}", "Incidents".bold());
    println!("─────────");
    if incidents.is_empty() {
        println!("No incidents found");
        return Ok(());
    }
    for incident in &incidents {
        print_incident(incident);
    }
    println!();
    println!("{} shown", incidents.len());
    Ok(())
}

fn print_incident(incident: &Incident) {
    let id = incident.id.to_string();
    let team = incident.assigned_team.as_deref().unwrap_or("unassigned");
    println!(
        "  {} [{}] {} {} - {}",
        id[..8].cyan(),
        severity_label(incident.severity),
        incident.status,
        team.dimmed(),
        incident.title
    );
}

fn severity_label(severity: Severity) -> ColoredString {
    let label = severity.to_string();
    match severity {
        Severity::Critical => label.red(),
        Severity::High => label.yellow(),
        Severity::Medium => label.cyan(),
        Severity::Low => label.white(),
    }
}
