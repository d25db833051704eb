use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use pagestore::read_collection;
use tracing::{debug, info};

use pagefleet::cli::{Cli, Command};
use pagefleet::config::Config;
use pagefleet::domain::{CommandKind, CommandResult, CommandStatus, ResultRecord};
use pagefleet::logging::setup_logging;
use pagefleet::manager::{CloseMode, CommandHandle, TaskManager, validate_command};
use pagefleet::util::is_installed;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    apply_overrides(&mut config, &cli.command);

    let level = cli.log_level.as_deref().or(config.logging.level.as_deref());
    setup_logging(&config.manager.log_directory, level, config.logging.console_level.as_deref())
        .context("Failed to setup logging")?;
    debug!(?cli, "main: called");

    match cli.command {
        Some(Command::Visit { urls, sleep, force, .. }) => cmd_visit(config, urls, sleep, force).await,
        Some(Command::Check) | None => cmd_check(&config),
        Some(Command::Config) => cmd_config(&config),
        Some(Command::Records { .. }) => cmd_records(&config),
    }
}

fn apply_overrides(config: &mut Config, command: &Option<Command>) {
    let (num_browsers, data_dir) = match command {
        Some(Command::Visit {
            num_browsers, data_dir, ..
        }) => (*num_browsers, data_dir.clone()),
        Some(Command::Records { data_dir }) => (None, data_dir.clone()),
        _ => (None, None),
    };

    if let Some(n) = num_browsers {
        let template = config.browsers.first().cloned().unwrap_or_default();
        config.manager.num_browsers = n;
        config.browsers.resize(n, template);
    }
    if let Some(dir) = data_dir {
        config.manager.log_directory = dir.join("logs");
        config.manager.data_directory = dir;
    }
}

async fn cmd_visit(config: Config, urls: Vec<String>, sleep: Option<u64>, force: bool) -> Result<()> {
    debug!(?urls, ?sleep, force, "cmd_visit: called");
    let sequences: Vec<Vec<CommandKind>> = urls
        .iter()
        .map(|url| {
            let mut kinds = vec![CommandKind::visit(url.as_str())];
            if let Some(secs) = sleep {
                kinds.push(CommandKind::sleep(Duration::from_secs(secs)));
            }
            kinds
        })
        .collect();
    for kind in sequences.iter().flatten() {
        validate_command(kind)?;
    }

    let database = config.database_path();
    let manager = TaskManager::start_jsonl(config)
        .await
        .context("Failed to start task manager")?;
    info!(session = %manager.session_id(), urls = urls.len(), "Visiting");

    let mut handles = Vec::new();
    for kinds in sequences {
        match manager.submit_sequence(kinds) {
            Ok(submitted) => handles.extend(submitted),
            Err(e) => {
                manager.close(CloseMode::Forced).await.context("Failed to close task manager")?;
                return Err(e).context("Failed to submit commands");
            }
        }
    }

    let mode = tokio::select! {
        _ = print_results(handles) => CloseMode::Graceful,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Interrupted, shutting down".yellow());
            if force { CloseMode::Forced } else { CloseMode::Graceful }
        }
    };

    let report = manager.close(mode).await.context("Failed to close task manager")?;
    let stats = manager.stats();
    println!(
        "\n{} succeeded, {} failed, {} abandoned, {} retried, {} crashes",
        stats.succeeded.to_string().green(),
        stats.failed.to_string().red(),
        stats.abandoned,
        stats.retried,
        stats.crashes
    );
    println!("Results stored in {}", database.display());
    for error in report.storage_errors.iter().chain(report.worker_errors.iter()) {
        eprintln!("{} {}", "warning:".yellow(), error);
    }
    Ok(())
}

async fn print_results(handles: Vec<CommandHandle>) {
    for handle in handles {
        print_result(&handle.wait().await);
    }
}

fn print_result(result: &CommandResult) {
    let status = match result.status {
        CommandStatus::Succeeded => "ok".green(),
        CommandStatus::Failed => "failed".red(),
        CommandStatus::Abandoned => "abandoned".yellow(),
        other => other.to_string().normal(),
    };
    println!(
        "{:>8} {:>9} {} {} (attempts: {})",
        result.command_id.to_string(),
        status,
        result.kind.label(),
        result.kind.target().bold(),
        result.attempts
    );
    if let Some(reason) = result.outcome.failure_reason() {
        println!("{:>19}{}", "", reason.to_string().dimmed());
    }
}

fn cmd_check(config: &Config) -> Result<()> {
    debug!("cmd_check: called");
    let mut missing = 0;
    for (index, browser) in config.browsers.iter().enumerate() {
        if is_installed(&browser.binary) {
            println!("{} worker-{}: {}", "✓".green(), index, browser.binary.display());
        } else {
            missing += 1;
            println!("{} worker-{}: {} (not found)", "✗".red(), index, browser.binary.display());
        }
    }
    if missing > 0 {
        eyre::bail!("{} browser driver(s) not installed", missing);
    }
    Ok(())
}

fn cmd_config(config: &Config) -> Result<()> {
    let yaml = serde_yaml::to_string(config).context("Failed to serialize configuration")?;
    print!("{}", yaml);
    Ok(())
}

fn cmd_records(config: &Config) -> Result<()> {
    let database: PathBuf = config.database_path();
    debug!(?database, "cmd_records: called");
    let records = read_collection(&database, "results").context(format!("Failed to read {}", database.display()))?;
    for stored in records {
        match serde_json::from_value::<ResultRecord>(stored.body.clone()) {
            Ok(record) => {
                let outcome = match record.outcome.failure_reason() {
                    None => "success".green(),
                    Some(reason) => reason.to_string().red(),
                };
                println!(
                    "{} {} attempt {} {} {}",
                    record.completed_at.format("%Y-%m-%d %H:%M:%S"),
                    record.command_id,
                    record.attempt,
                    record.target,
                    outcome
                );
            }
            Err(_) => println!("{}", stored.body),
        }
    }
    Ok(())
}
