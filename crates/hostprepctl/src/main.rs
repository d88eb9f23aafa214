//! Hostprep Control - prepares a Windows host for the WSL runtime
//!
//! `run` probes and remediates every step, `check` only probes, `advise`
//! prints the guidance for a failure category.

mod report;
mod ui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::Term;
use hostprep_common::acquire::ArtifactAcquirer;
use hostprep_common::capability::{self, SysinfoProcessTable, WindowsHostInfo};
use hostprep_common::exec::{CommandRunner, CommandSpec, SystemCommandRunner};
use hostprep_common::exit_codes::{self, EXIT_SUCCESS, EXIT_UNEXPECTED};
use hostprep_common::fetcher::{ArtifactFetcher, HttpDownloader, NoProgress, ProgressSink};
use hostprep_common::logging::{self, OutputMode};
use hostprep_common::release::HostArch;
use hostprep_common::reporter::{FanoutReporter, TracingReporter};
use hostprep_common::store::ArtifactStore;
use hostprep_common::{
    advisory, AbortHandle, ErrorCategory, PipelineResult, ProvisionConfig, ProvisionContext,
    Reporter, StepId, StepOrchestrator, StepState, Terminal,
};
use owo_colors::OwoColorize;
use report::FailureContext;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use ui::ConsoleUi;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "hostprepctl")]
#[command(about = "Hostprep - prepare this machine for the WSL runtime", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check every step and fix what is missing
    Run {
        /// No prompts, log output only
        #[arg(long, conflicts_with = "very_quiet")]
        quiet: bool,

        /// No prompts, warnings and errors only
        #[arg(long)]
        very_quiet: bool,

        /// Read settings from this TOML file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Report the state of every step without changing anything
    Check {
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Show the guidance for a failure category (e.g. "os_features")
    Advise {
        category: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            quiet,
            very_quiet,
            config,
        } => {
            let mode = match (quiet, very_quiet) {
                (_, true) => OutputMode::VeryQuiet,
                (true, false) => OutputMode::Quiet,
                _ => OutputMode::Interactive,
            };
            run(mode, config.as_deref()).await
        }
        Commands::Check { config } => check(config.as_deref()).await,
        Commands::Advise { category } => advise(&category),
    };

    let code = result.unwrap_or_else(|e| {
        eprintln!("{} {:#}", "error:".red().bold(), e);
        EXIT_UNEXPECTED
    });
    std::process::exit(code);
}

/// Collaborators built from configuration
struct Pipeline {
    orchestrator: StepOrchestrator,
    runner: Arc<dyn CommandRunner>,
}

fn build_pipeline(
    config: ProvisionConfig,
    reporter: Arc<dyn Reporter>,
    progress: Arc<dyn ProgressSink>,
) -> Result<Pipeline> {
    let config = Arc::new(config);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);

    let downloader = HttpDownloader::new().context("Failed to set up the HTTP client")?;
    let fetcher = ArtifactFetcher::new(
        Arc::new(downloader),
        ArtifactStore::new(&config.staging_dir),
    );
    let acquirer = Arc::new(ArtifactAcquirer::new(fetcher));

    let arch = WindowsHostInfo::detect_arch(|k| std::env::var(k).ok()).unwrap_or_else(|| {
        warn!("CPU architecture not reported by the environment, assuming x64");
        HostArch::X64
    });

    let ctx = ProvisionContext::new(config.clone(), runner.clone(), acquirer, progress, arch);
    let host = Arc::new(WindowsHostInfo::new(
        runner.clone(),
        Duration::from_secs(config.os.query_timeout_secs),
    ));
    let steps = capability::standard_steps(&ctx, host, Arc::new(SysinfoProcessTable));

    Ok(Pipeline {
        orchestrator: StepOrchestrator::new(steps, reporter),
        runner,
    })
}

async fn run(mode: OutputMode, config_path: Option<&Path>) -> Result<i32> {
    let run_id = Uuid::new_v4();
    let log_path = logging::init_logging(mode, run_id)?;
    let config = ProvisionConfig::resolve(config_path)?;
    info!(run_id = %run_id, mode = ?mode, "hostprep {}", env!("CARGO_PKG_VERSION"));

    let ui = ConsoleUi::new(StepId::ALL.len());
    let reporter: Arc<dyn Reporter>;
    let progress: Arc<dyn ProgressSink>;
    if mode.is_interactive() {
        let sinks: Vec<Arc<dyn Reporter>> =
            vec![Arc::new(TracingReporter), Arc::new(ui.reporter())];
        reporter = Arc::new(FanoutReporter::new(sinks));
        progress = Arc::new(ui.download_bar());
    } else {
        reporter = Arc::new(TracingReporter);
        progress = Arc::new(NoProgress);
    }

    let pipeline = build_pipeline(config, reporter, progress)?;

    let abort = AbortHandle::new();
    let watcher = tokio::spawn(watch_interrupts(abort.clone(), mode, ui.clone()));
    let result = pipeline.orchestrator.run(run_id, &abort).await;
    watcher.abort();

    let code = exit_codes::exit_code(&result.terminal);
    info!(run_id = %run_id, exit_code = code, "run finished");

    if mode.is_interactive() {
        present(&ui, &result, &log_path, pipeline.runner.as_ref()).await;
    } else {
        log_terminal(&result, &log_path);
    }
    Ok(code)
}

/// Ctrl-C requests an abort at the next step boundary. Interactive runs
/// confirm first.
async fn watch_interrupts(abort: AbortHandle, mode: OutputMode, ui: ConsoleUi) {
    loop {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("could not listen for Ctrl-C");
            return;
        }
        if !mode.is_interactive() || !Term::stdout().is_term() {
            warn!("interrupt received, stopping after the current step");
            abort.request();
            return;
        }

        let Some(guard) = ui.try_prompt() else {
            continue;
        };
        let prompt_ui = ui.clone();
        let confirmed = tokio::task::spawn_blocking(move || {
            let _guard = guard;
            prompt_ui.suspend(|| {
                confirm(
                    "Stop after the current step? The machine may be left partly set up. [y/N]: ",
                )
            })
        })
        .await
        .unwrap_or(false);

        if confirmed {
            warn!("operator asked to stop");
            ui.println(format!("{}", "Stopping after the current step...".yellow()));
            abort.request();
            return;
        }
    }
}

/// Yes/no question on the terminal; anything but yes, or no terminal, is no
fn confirm(question: &str) -> bool {
    let term = Term::stdout();
    if !term.is_term() {
        return false;
    }
    if term.write_str(&format!("{}", question.bold())).is_err() {
        return false;
    }
    match term.read_line() {
        Ok(answer) => matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"),
        Err(_) => false,
    }
}

async fn present(
    ui: &ConsoleUi,
    result: &PipelineResult,
    log_path: &Path,
    runner: &dyn CommandRunner,
) {
    println!();
    match &result.terminal {
        Terminal::Completed { warnings } => {
            println!("{}", "This machine is ready.".green().bold());
            if !warnings.is_empty() {
                let names: Vec<&str> = warnings.iter().map(|s| s.display_name()).collect();
                println!(
                    "{} {}",
                    "Could not verify:".yellow(),
                    names.join(", ").yellow()
                );
            }
        }
        Terminal::RestartRequired { step } => {
            println!(
                "{}",
                format!(
                    "{} needs a restart. Restart Windows and run hostprepctl again.",
                    step.display_name()
                )
                .bright_yellow()
                .bold()
            );
        }
        Terminal::Aborted { step } => {
            println!(
                "{} {}",
                "Stopped before".yellow(),
                step.display_name().yellow().bold()
            );
            print!("{}", report::render_advisory(&advisory(ErrorCategory::UserDeclined)));
        }
        Terminal::HaltedAt { step, category } => {
            let advice = advisory(*category);
            print!("{}", report::render_advisory(&advice));
            println!();
            println!("{} {}", "Log file:".dimmed(), log_path.display());

            if advice.offer_report {
                let failure = FailureContext {
                    run_id: result.run_id,
                    step: *step,
                    category: *category,
                    outcome: result.outcome(*step),
                    log_path: Some(log_path),
                };
                offer_issue_report(ui, &failure, runner).await;
            }
        }
    }
}

async fn offer_issue_report(
    ui: &ConsoleUi,
    failure: &FailureContext<'_>,
    runner: &dyn CommandRunner,
) {
    let url = match report::issue_url(failure) {
        Ok(url) => url,
        Err(e) => {
            warn!("{:#}", e);
            return;
        }
    };

    println!();
    // an unanswered Ctrl-C question still owns stdin
    let Some(_guard) = ui.try_prompt() else {
        println!("Report the problem at:\n  {}", url.as_str().cyan());
        return;
    };
    let wants = ui.suspend(|| confirm("Open a pre-filled problem report in your browser? [y/N]: "));
    if !wants {
        return;
    }

    let spec = CommandSpec::new("explorer.exe", [url.as_str()], Duration::from_secs(10));
    if let Err(e) = runner.run(&spec).await {
        error!("could not open the browser: {}", e);
        println!("Open this address to report the problem:\n  {}", url.as_str().cyan());
    }
}

fn log_terminal(result: &PipelineResult, log_path: &Path) {
    match &result.terminal {
        Terminal::Completed { warnings } if warnings.is_empty() => info!("all steps satisfied"),
        Terminal::Completed { warnings } => {
            warn!(unverified = ?warnings, "completed with unverified steps")
        }
        Terminal::RestartRequired { step } => warn!(step = %step, "restart required"),
        Terminal::Aborted { step } => {
            let summary = report::unattended_summary(&result.terminal, log_path);
            warn!(step = %step, "aborted by operator\n{}", summary.unwrap_or_default());
        }
        Terminal::HaltedAt { step, category } => {
            let summary = report::unattended_summary(&result.terminal, log_path);
            error!(
                step = %step,
                category = category.as_str(),
                "{}",
                summary.unwrap_or_default()
            );
        }
    }
}

async fn check(config_path: Option<&Path>) -> Result<i32> {
    let run_id = Uuid::new_v4();
    logging::init_logging(OutputMode::Interactive, run_id)?;
    let config = ProvisionConfig::resolve(config_path)?;

    let pipeline = build_pipeline(config, Arc::new(TracingReporter), Arc::new(NoProgress))?;
    let states = pipeline.orchestrator.probe_only().await;

    for (step, state) in &states {
        let name = format!("{:<28}", step.display_name());
        match state {
            StepState::Satisfied => println!("{} {} {}", "✓".green(), name.bold(), "ok".dimmed()),
            StepState::Unsatisfied(gap) => {
                println!("{} {} {}", "✗".red(), name.bold(), gap.describe().red())
            }
            StepState::Assumed(note) => {
                println!("{} {} {}", "~".yellow(), name.bold(), note.yellow())
            }
            StepState::Unknown(failure) => {
                println!("{} {} {}", "?".yellow(), name.bold(), failure.message.yellow())
            }
        }
    }

    Ok(pipeline
        .orchestrator
        .first_blocking(&states)
        .map(exit_codes::for_step)
        .unwrap_or(EXIT_SUCCESS))
}

fn advise(category: &str) -> Result<i32> {
    let Some(category) = ErrorCategory::parse(category) else {
        let known: Vec<&str> = ErrorCategory::ALL.iter().map(|c| c.as_str()).collect();
        anyhow::bail!(
            "unknown category '{}'; expected one of: {}",
            category,
            known.join(", ")
        );
    };
    print!("{}", report::render_advisory(&advisory(category)));
    Ok(EXIT_SUCCESS)
}
