//! ballot-interp - ballot sheet interpretation

mod cli;

use anyhow::{Context, Result, bail};
use ballot_interp::ImageDescriptor;
use ballot_interp::entry::{EntryName, ReplayEntryPoint, interpret_replay};
use ballot_interp::logging::{self, LOG_FILTER_ENV, LOG_FORMAT_ENV, LogConfig};
use ballot_interp::sheet::{PagePool, SheetImages, SheetInterpreter, discover_sheets};
use ballot_interp::worker::{WorkerCommand, WorkerPool, run_worker_main};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use serde::Serialize;
use tracing::info;

use cli::{BatchArgs, Cli, Commands, PoolArgs, SheetArgs};

/// Parses arguments, runs the selected command, and prints the error chain on failure.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker(args) => {
            // Workers share the parent's stderr; the parent owns the log file.
            logging::init(LogConfig::for_worker().with_env_overrides().without_file());
            match args.entry {
                EntryName::Replay => run_worker_main(ReplayEntryPoint::default()),
            }
        }
        Commands::Sheet(args) => {
            let log_config = cli.log_config();
            logging::init(log_config.clone());
            cmd_sheet(&log_config, args)
        }
        Commands::Batch(args) => {
            let log_config = cli.log_config();
            logging::init(log_config.clone());
            cmd_batch(&log_config, args)
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Inline pool, or a pool of this binary's `worker` subcommand.
///
/// Workers inherit the parent's effective log filter and format.
fn build_pool(log_config: &LogConfig, args: &PoolArgs) -> Result<PagePool> {
    let config = args.pool_config();
    let pool = if args.inline {
        WorkerPool::inline(|image: ImageDescriptor| interpret_replay(&image), config)?
    } else {
        let command = WorkerCommand::current_exe(EntryName::Replay.as_str())?
            .env(LOG_FILTER_ENV, log_config.filter_directive())
            .env(LOG_FORMAT_ENV, log_config.format.to_string());
        WorkerPool::spawn(command, config)?
    };
    Ok(pool)
}

fn print_json<T: Serialize>(value: &T, pretty: bool) -> Result<()> {
    let json = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", json);
    Ok(())
}

fn finish(interpreter: &SheetInterpreter) {
    interpreter.shutdown().wait();
    let stats = interpreter.stats();
    info!(
        succeeded = stats.jobs_succeeded,
        failed = stats.jobs_failed,
        restarts = stats.worker_restarts,
        peak_in_flight = stats.peak_in_flight,
        "Worker pool finished"
    );
}

fn cmd_sheet(log_config: &LogConfig, args: &SheetArgs) -> Result<()> {
    let interpreter = SheetInterpreter::new(build_pool(log_config, &args.pool)?);
    let result = interpreter.interpret_blocking(SheetImages::from_paths(&args.front, &args.back));
    finish(&interpreter);

    let sheet = result.with_context(|| {
        format!(
            "Sheet {} / {} was not interpreted",
            args.front.display(),
            args.back.display()
        )
    })?;
    print_json(&sheet, args.pretty)
}

/// One entry of `batch` output.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchRecord {
    sheet: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    interpretation: Option<ballot_interp::SheetInterpretation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn cmd_batch(log_config: &LogConfig, args: &BatchArgs) -> Result<()> {
    let sheets = discover_sheets(&args.dir)
        .with_context(|| format!("Failed to scan {}", args.dir.display()))?;
    if sheets.is_empty() {
        bail!("No front/back image pairs found in {}", args.dir.display());
    }

    let interpreter = SheetInterpreter::new(build_pool(log_config, &args.pool)?);
    let (names, images): (Vec<_>, Vec<_>) = sheets.into_iter().unzip();
    let results = futures::executor::block_on(interpreter.interpret_batch(images));
    finish(&interpreter);

    let total = results.len();
    let mut failed = 0;
    let records: Vec<BatchRecord> = names
        .into_iter()
        .zip(results)
        .map(|(sheet, result)| match result {
            Ok(interpretation) => BatchRecord {
                sheet,
                interpretation: Some(interpretation),
                error: None,
            },
            Err(e) => {
                failed += 1;
                BatchRecord {
                    sheet,
                    interpretation: None,
                    error: Some(e.to_string()),
                }
            }
        })
        .collect();
    print_json(&records, args.pretty)?;

    if failed > 0 {
        bail!("{} of {} sheets could not be interpreted", failed, total);
    }
    Ok(())
}
