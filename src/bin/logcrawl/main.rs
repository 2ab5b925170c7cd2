// SPDX-License-Identifier: Apache-2.0

use clap::{Parser, ValueEnum};
use std::process::ExitCode;
use std::time::Duration;
use tokio::select;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::metadata::LevelFilter;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use logcrawl::init::BoxError;
use logcrawl::init::agent::Agent;
use logcrawl::init::args::CrawlArgs;
use logcrawl::init::wait;

/// Slack on top of the configured shutdown timeout before the agent task is
/// abandoned
const AGENT_EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, clap::Subcommand)]
enum Commands {
    /// Run the crawler
    Start(Box<CrawlArgs>),

    /// Return version
    Version,
}

#[derive(Debug, Parser)]
#[command(name = "logcrawl")]
#[command(bin_name = "logcrawl")]
#[command(version, about, long_about = None)]
#[command(subcommand_required = true)]
struct Arguments {
    #[arg(
        value_enum,
        long,
        global = true,
        env = "LOGCRAWL_LOG_FORMAT",
        default_value = "text"
    )]
    /// Log format
    log_format: LogFormatArg,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

fn main() -> ExitCode {
    let opt = Arguments::parse();

    match opt.command {
        Some(Commands::Version) => {
            println!("{}", get_version())
        }
        Some(Commands::Start(args)) => {
            let _guard = match setup_logging(&opt.log_format) {
                Ok(guard) => guard,
                Err(e) => {
                    eprintln!("ERROR: failed to setup logging: {}", e);
                    return ExitCode::from(1);
                }
            };

            match run_agent(args) {
                Ok(_) => {}
                Err(e) => {
                    error!(error = e, "Failed to run crawler.");
                    return ExitCode::from(1);
                }
            }
        }
        _ => {
            // subcommand is required, clap rejects this earlier
            error!("Must specify a command");
            return ExitCode::from(2);
        }
    }

    ExitCode::SUCCESS
}

#[tokio::main]
async fn run_agent(args: Box<CrawlArgs>) -> Result<(), BoxError> {
    let mut agent_join_set = JoinSet::new();
    let exit_timeout = Duration::from_millis(args.shutdown_timeout_ms) + AGENT_EXIT_GRACE;

    let cancel_token = CancellationToken::new();
    {
        let token = cancel_token.clone();
        agent_join_set.spawn(async move { Agent::new(args).run(token).await });
    }

    select! {
        _ = signal_wait() => {
            info!("Shutdown signal received.");
            cancel_token.cancel();
        },
        e = wait::wait_for_any_task(&mut agent_join_set) => {
            match e {
                Ok(()) => warn!("Unexpected early exit of crawler."),
                Err(e) => return Err(e),
            }
        },
    }

    wait::wait_for_tasks_with_timeout(&mut agent_join_set, exit_timeout).await?;

    Ok(())
}

type LoggerGuard = tracing_appender::non_blocking::WorkerGuard;

fn setup_logging(log_format: &LogFormatArg) -> Result<LoggerGuard, BoxError> {
    LogTracer::init()?;

    // stdout carries the events
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(std::io::stderr());

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env()?;

    if *log_format == LogFormatArg::Json {
        let app_name = format!("{}-{}", env!("CARGO_PKG_NAME"), get_version());
        let bunyan_formatting_layer = BunyanFormattingLayer::new(app_name, non_blocking_writer);

        let subscriber = Registry::default()
            .with(filter)
            .with(JsonStorageLayer)
            .with(bunyan_formatting_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        use std::io;
        use std::io::IsTerminal;

        // Skip color codes when not in a terminal
        let use_ansi = io::stderr().is_terminal();

        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking_writer)
            .with_target(false)
            .with_level(true)
            .with_ansi(use_ansi)
            .compact();

        let subscriber = Registry::default().with(filter).with(layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }
    Ok(guard)
}

fn get_version() -> String {
    // Set during CI
    let version_build = option_env!("BUILD_SHORT_SHA").unwrap_or("dev");

    format!("{}-{}", env!("CARGO_PKG_VERSION"), version_build)
}

#[cfg(unix)]
async fn signal_wait() {
    use tokio::signal::unix::{SignalKind, signal};

    let (mut sig_term, mut sig_int) = match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(term), Ok(int)) => (term, int),
        (Err(e), _) | (_, Err(e)) => {
            error!("Failed to install signal handlers: {}", e);
            std::future::pending::<()>().await;
            return;
        }
    };

    select! {
        _ = sig_term.recv() => {},
        _ = sig_int.recv() => {},
    }
}

#[cfg(not(unix))]
async fn signal_wait() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
