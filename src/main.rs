use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use colored::Colorize;
use log::{debug, error, info, warn};
use serde::Serialize;

use mdown::cli::{AppConfig, Cli};
use mdown::download::Orchestrator;
use mdown::progress::{ProgressFinish, ProgressMode, ProgressReporter};
use mdown::scheduler::TaskSnapshot;
use mdown::task::TaskState;
use mdown::util::format_bytes;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{err:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();
    init_logger(&cli);

    debug!("CLI arguments: {:?}", cli);
    let config: AppConfig = cli.try_into()?;

    let orchestrator = Arc::new(Orchestrator::new(config.orchestrator.clone())?);
    orchestrator.on_task_finished(|event| {
        info!("saved {}", event.output.display());
    });
    orchestrator.on_task_failed(|event| {
        error!("{} failed: {}", event.request.source, event.error);
    });

    let ids = orchestrator
        .submit_with(config.items, &config.output_dir, config.existing_files)
        .await
        .context("failed to queue downloads")?;
    info!(
        "queued {} download(s) into {}",
        ids.len(),
        config.output_dir.display()
    );

    let reporter = ProgressReporter::spawn(config.progress, orchestrator.clone());
    let interrupted = tokio::select! {
        _ = orchestrator.wait_idle() => false,
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for ctrl-c")?;
            warn!("interrupted; cancelling downloads");
            orchestrator.cancel_all().await;
            orchestrator.wait_idle().await;
            true
        }
    };

    let tasks = orchestrator.tasks().await;
    let succeeded = !interrupted && tasks.iter().all(|task| task.state == TaskState::Finished);
    if let Some(reporter) = reporter {
        let finish = if succeeded {
            ProgressFinish::Success
        } else {
            ProgressFinish::Failure
        };
        reporter.finish(finish).await;
    }
    print_summary(&tasks, config.progress);

    if interrupted {
        return Err(anyhow!("download interrupted"));
    }
    if !succeeded {
        let failed = tasks
            .iter()
            .filter(|task| task.state != TaskState::Finished)
            .count();
        return Err(anyhow!("{failed} of {} download(s) did not finish", tasks.len()));
    }
    info!("All downloads completed successfully");
    Ok(())
}

#[derive(Serialize)]
struct JsonSummary<'a> {
    event: &'static str,
    tasks: &'a [TaskSnapshot],
}

fn print_summary(tasks: &[TaskSnapshot], mode: ProgressMode) {
    match mode {
        ProgressMode::Quiet => {}
        ProgressMode::Json => {
            let summary = JsonSummary {
                event: "summary",
                tasks,
            };
            if let Ok(serialized) = serde_json::to_string(&summary) {
                println!("{serialized}");
            }
        }
        ProgressMode::Text => {
            let mut out = std::io::stdout().lock();
            for task in tasks {
                let label = format!("{:>9}", format!("{:?}", task.state).to_lowercase());
                let label = match task.state {
                    TaskState::Finished => label.green().bold(),
                    TaskState::Failed => label.red().bold(),
                    TaskState::Cancelled => label.yellow().bold(),
                    _ => label.normal(),
                };
                let size = format_bytes(task.downloaded_bytes);
                let _ = match &task.last_error {
                    Some(reason) => writeln!(
                        out,
                        "{label} {} ({size}): {reason}",
                        task.destination.display()
                    ),
                    None => writeln!(out, "{label} {} ({size})", task.destination.display()),
                };
            }
            let _ = out.flush();
        }
    }
}

/// `RUST_LOG` wins when set. Otherwise `-q`/`-v` pick the level for this
/// crate and dependencies stay at warnings.
fn init_logger(cli: &Cli) {
    use env_logger::{Env, Target};
    use log::LevelFilter;

    let mut builder = env_logger::Builder::from_env(Env::default());
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if cli.quiet {
            LevelFilter::Error
        } else if cli.verbose {
            LevelFilter::Debug
        } else {
            LevelFilter::Info
        };
        builder
            .filter_level(level.min(LevelFilter::Warn))
            .filter_module(env!("CARGO_CRATE_NAME"), level);
    }
    // stdout is reserved for summaries and json events
    builder.target(Target::Stderr);
    if cli.verbose {
        builder.format_timestamp_millis();
    } else {
        builder.format_timestamp_secs();
    }
    let _ = builder.try_init();
}
