//! tracepat - pattern matching over trace event streams
//!
//! Runs declarative FSM definitions over a JSON-lines trace, writes the
//! synthetic events they produce to stdout and records every scenario in a
//! time-versioned state store.

mod config;

use clap::{Parser, Subcommand};
use colored::Colorize;
use config::Config;
use std::io::{BufWriter, Stdout, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tracepat_core::{
    CoreError, DefinitionSet, Event, EventSink, PatternHandler, ScenarioHistory, ScenarioRecord,
    SyntheticEvent, TransitionInput,
};
use tracepat_state::{MemoryStateStore, Quark, StateStore, StoreSnapshot};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tracepat")]
#[command(about = "Match finite-state patterns against trace event streams")]
#[command(version)]
struct Cli {
    /// Configuration file (YAML)
    #[arg(short, long, env = "TRACEPAT_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a definition set over a JSON-lines trace
    Run {
        /// Definition set (YAML, or JSON with a .json extension)
        #[arg(short, long)]
        definitions: PathBuf,

        /// Trace file, one JSON event per line ("-" for stdin)
        #[arg(short, long, default_value = "-")]
        trace: String,

        /// Save a snapshot of the state store when the run ends
        #[arg(long)]
        snapshot: Option<PathBuf>,

        /// Print a scenario summary to stderr
        #[arg(long)]
        summary: bool,

        /// Pretty-print synthetic events
        #[arg(long)]
        pretty: bool,
    },

    /// Validate a definition set
    Check {
        #[arg(short, long)]
        definitions: PathBuf,

        /// Print the parsed definition set as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the scenarios recorded in a store snapshot
    History {
        #[arg(short, long)]
        snapshot: PathBuf,

        /// Definition set id (the pattern root attribute)
        #[arg(short, long)]
        root: String,

        /// Output records as JSON lines
        #[arg(long)]
        json: bool,
    },
}

/// Writes synthetic events to stdout as JSON.
struct StdoutSink {
    out: BufWriter<Stdout>,
    pretty: bool,
    emitted: u64,
}

impl StdoutSink {
    fn new(pretty: bool) -> Self {
        Self {
            out: BufWriter::new(std::io::stdout()),
            pretty,
            emitted: 0,
        }
    }

    fn flush(&mut self) {
        if let Err(e) = self.out.flush() {
            tracing::error!("Failed to flush synthetic events: {}", e);
        }
    }
}

impl EventSink for StdoutSink {
    fn emit(&mut self, event: SyntheticEvent) {
        let encoded = if self.pretty {
            serde_json::to_string_pretty(&event)
        } else {
            serde_json::to_string(&event)
        };
        let result = match encoded {
            Ok(line) => writeln!(self.out, "{}", line),
            Err(e) => {
                tracing::error!("Failed to encode synthetic event {}: {}", event.name, e);
                return;
            }
        };
        match result {
            Ok(()) => self.emitted += 1,
            Err(e) => tracing::error!("Failed to write synthetic event {}: {}", event.name, e),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr, stdout carries synthetic events
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            definitions,
            trace,
            snapshot,
            summary,
            pretty,
        } => {
            let mut config = match Config::load(cli.config.as_deref()) {
                Ok(config) => config,
                Err(e) => {
                    tracing::error!("Failed to load config: {}", e);
                    return Err(e.into());
                }
            };
            if let Some(path) = &cli.config {
                tracing::info!("Loaded config from {}", path.display());
            }
            if snapshot.is_some() {
                config.store.snapshot = snapshot;
            }
            config.output.summary |= summary;
            config.output.pretty |= pretty;

            run(config, &definitions, &trace).await
        }

        Commands::Check { definitions, json } => check(&definitions, json),

        Commands::History {
            snapshot,
            root,
            json,
        } => history(&snapshot, &root, json),
    }
}

async fn run(
    config: Config,
    definitions: &Path,
    trace: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let defs = DefinitionSet::from_file(definitions)?;
    let store = MemoryStateStore::new(config.store.start_time);
    let sink = StdoutSink::new(config.output.pretty);
    let mut handler = PatternHandler::new(defs, store, sink, config.engine.handler_config())?;

    tracing::info!("Reading trace from {}", if trace == "-" { "stdin" } else { trace });
    let reader: Box<dyn AsyncBufRead + Unpin + Send> = if trace == "-" {
        Box::new(BufReader::new(tokio::io::stdin()))
    } else {
        Box::new(BufReader::new(tokio::fs::File::open(trace).await?))
    };
    let mut lines = reader.lines();

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    let mut line_no = 0u64;
    let mut skipped = 0u64;
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("Received interrupt, stopping ingestion...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                line_no += 1;
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match parse_event(line) {
                    Ok(event) => handler.on_event(&event),
                    Err(e) => {
                        skipped += 1;
                        tracing::warn!("Skipping trace line {}: {}", line_no, e);
                    }
                }
            }
        }
    }

    handler.dispose();
    handler.sink_mut().flush();

    if skipped > 0 {
        tracing::warn!("{} trace lines could not be parsed", skipped);
    }

    if let Some(path) = &config.store.snapshot {
        StoreSnapshot::capture(handler.store())?.save(path)?;
    }

    if config.output.summary {
        print_summary(&handler)?;
    }

    Ok(())
}

fn parse_event(line: &str) -> Result<Event, CoreError> {
    let record: serde_json::Value = serde_json::from_str(line)?;
    Event::from_json(&record)
}

fn print_summary(
    handler: &PatternHandler<MemoryStateStore, StdoutSink>,
) -> Result<(), CoreError> {
    eprintln!(
        "{} {} events, {} synthetic events",
        "Processed".green().bold(),
        handler.events_handled(),
        handler.sink().emitted
    );

    for fsm in handler.definitions().fsms() {
        if let Some(stats) = handler.fsm_stats(&fsm.id) {
            eprintln!(
                "  {:<24} created {:>6}  matched {:>6}  abandoned {:>6}",
                fsm.id.bold(),
                stats.created,
                stats.matched,
                stats.abandoned
            );
        }
    }

    let records = handler.records()?;
    if !records.is_empty() {
        eprintln!();
        for record in &records {
            eprintln!("{}", format_record(record));
        }
    }
    Ok(())
}

fn format_record(record: &ScenarioRecord) -> String {
    let status = match record.status.as_str() {
        "matched" => record.status.green(),
        "abandoned" => record.status.red(),
        "in_progress" => record.status.yellow(),
        _ => record.status.dimmed(),
    };
    let span = match (record.start_time, record.end_time) {
        (Some(start), Some(end)) => format!("[{}, {}]", start, end),
        (Some(start), None) => format!("[{}, ...]", start),
        _ => String::new(),
    };

    let mut line = format!(
        "  {:<24} {:<12} {:<16} {}",
        record.name, status, record.state, span
    );
    if let Some(parent) = &record.parent {
        line.push_str(&format!(" {}", format!("(from {})", parent).dimmed()));
    }
    line
}

fn check(definitions: &Path, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let defs = match DefinitionSet::from_file(definitions) {
        Ok(defs) => defs,
        Err(e) => {
            eprintln!("{}: {}", "Invalid".red().bold(), e);
            return Err(e.into());
        }
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&defs.to_json()?)?);
        return Ok(());
    }

    println!(
        "{} {} (checksum {})",
        "Valid".green().bold(),
        defs.id.bold(),
        defs.checksum
    );
    println!("  initial: {}", defs.initial.join(", "));
    if !defs.preconditions.is_empty() {
        println!("  preconditions: {}", defs.preconditions.join(", "));
    }

    for fsm in defs.fsms() {
        let mut flags = Vec::new();
        if fsm.concurrent {
            flags.push("concurrent");
        }
        if defs.initial.contains(&fsm.id) {
            flags.push("initial");
        }
        println!(
            "  fsm {} ({} states, initial {}{}{}) {}",
            fsm.id.bold(),
            fsm.states.len(),
            fsm.initial,
            fsm.final_state
                .as_deref()
                .map(|s| format!(", final {}", s))
                .unwrap_or_default(),
            fsm.abandon
                .as_deref()
                .map(|s| format!(", abandon {}", s))
                .unwrap_or_default(),
            flags.join(" ").dimmed()
        );
    }

    for (id, input) in defs.tests() {
        let kind = match input {
            TransitionInput::Event(test) => format!("event {}", test.names.join("|")),
            TransitionInput::Time(_) => "time".to_string(),
        };
        println!("  test {} {}", id, kind.dimmed());
    }
    for (id, ops) in defs.actions() {
        println!("  action {} ({} ops)", id, ops.len());
    }

    Ok(())
}

fn history(snapshot: &Path, root: &str, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let store = StoreSnapshot::load(snapshot)?.restore()?;
    let root = store.quark_relative(Quark::ROOT, &[root])?;
    let records = ScenarioHistory::list(&store, root)?;

    if json {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
    } else if records.is_empty() {
        eprintln!("{}", "No scenarios recorded".dimmed());
    } else {
        for record in &records {
            println!("{}", format_record(record));
        }
    }
    Ok(())
}
