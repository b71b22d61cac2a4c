///
/// kite-probe - Command-line driver for the kite runtime
///
/// Builds a runtime from an optional TOML config and exercises it:
/// - kite-probe sql <db> <statements...>: run statements through the
///   connection's statement cache and report rows and cache stats
/// - kite-probe dispatch: submit jobs from several threads, wait for every
///   completion notice and pull every result
///
/// Reports are printed to stdout as JSON; logs go to stderr.
///

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use clap::{Parser, Subcommand};
use serde_json::{Value as Json, json};
use thiserror::Error;

use kite_core::{ManagedRef, RecordingReporter};
use kite_handles::{Handle, HandleError};
use kite_runtime::{Runtime, RuntimeConfig, RuntimeError};
use kite_sqlite3::{CREATE_IF_NECESSARY, CursorWindow, FieldType, OPEN_READWRITE, SqliteError, WindowError};
use kite_threads::{AccessError, Job};

#[derive(Parser)]
#[command(name = "kite-probe")]
#[command(author, version, about = "Exercise a kite runtime end-to-end", long_about = None)]
struct Cli {
    /// Runtime configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log runtime activity to stderr
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run SQL statements through the statement cache
    Sql {
        /// Database file, created if missing
        db: PathBuf,

        /// Statement cache size for this connection (0 disables caching)
        #[arg(long)]
        cache_size: Option<usize>,

        /// Statements to run, in order
        #[arg(required = true)]
        statements: Vec<String>,
    },

    /// Dispatch jobs from several threads and collect the results
    Dispatch {
        /// Total number of jobs
        #[arg(long, default_value_t = 100)]
        jobs: usize,

        /// Number of submitting threads
        #[arg(long, default_value_t = 4)]
        threads: usize,
    },
}

#[derive(Debug, Error)]
enum ProbeError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Sqlite(#[from] SqliteError),

    #[error(transparent)]
    Window(#[from] WindowError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error(transparent)]
    Handle(#[from] HandleError),

    #[error("Database path is not valid UTF-8: {}", .0.display())]
    Path(PathBuf),

    #[error("A submitting thread panicked")]
    Submitter,
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_max_level(if cli.verbose {
            tracing::Level::DEBUG
        } else {
            tracing::Level::WARN
        })
        .init();

    let report = match cli.command {
        Commands::Sql {
            db,
            cache_size,
            statements,
        } => run_sql(cli.config.as_deref(), &db, cache_size, &statements),
        Commands::Dispatch { jobs, threads } => run_dispatch(cli.config.as_deref(), jobs, threads),
    };

    match report {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error writing report: {}", e);
                std::process::exit(1);
            }
        },
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<RuntimeConfig, RuntimeError> {
    match path {
        Some(path) => RuntimeConfig::load(path),
        None => Ok(RuntimeConfig::default()),
    }
}

fn run_sql(
    config: Option<&Path>,
    db: &Path,
    cache_size: Option<usize>,
    statements: &[String],
) -> Result<Json, ProbeError> {
    let mut config = load_config(config)?;
    if let Some(size) = cache_size {
        config.statements.max_cache_size = size;
        config.validate()?;
    }
    let capacity = config.statements.max_cache_size;
    let rt = Runtime::new(config)?;

    let path = db.to_str().ok_or_else(|| ProbeError::Path(db.to_path_buf()))?;
    let conn = rt.open_database(path, OPEN_READWRITE | CREATE_IF_NECESSARY, "kite-probe")?;

    let mut results = Vec::with_capacity(statements.len());
    for sql in statements {
        let statement = conn.prepare(sql)?;
        if conn.column_count(&statement)? > 0 {
            let mut window = rt.new_cursor_window(sql);
            let (_, total) = conn.execute_for_cursor_window(&statement, &mut window, 0, 0, true)?;
            results.push(json!({
                "sql": sql,
                "columns": conn.column_names(&statement)?,
                "rows": window_rows(&window)?,
                "total_rows": total,
            }));
        } else {
            let changes = conn.execute_for_changed_row_count(&statement)?;
            results.push(json!({ "sql": sql, "changes": changes }));
        }
    }

    let databases = rt.databases();
    let data_id = conn.data_id();
    let stats = databases.stats(data_id)?;
    let report = json!({
        "database": path,
        "data_id": data_id.raw(),
        "results": results,
        "cache": {
            "capacity": capacity,
            "enabled": databases.cache_enabled(data_id)?,
            "entries": databases.cache_keys(data_id)?,
            "hits": stats.hits,
            "misses": stats.misses,
            "evictions": stats.evictions,
        },
    });
    conn.close()?;
    Ok(report)
}

fn window_rows(window: &CursorWindow) -> Result<Vec<Json>, WindowError> {
    let mut rows = Vec::with_capacity(window.num_rows());
    for row in 0..window.num_rows() {
        let mut fields = Vec::with_capacity(window.num_columns());
        for column in 0..window.num_columns() {
            let field = match window.get_type(row, column)? {
                FieldType::Null => Json::Null,
                FieldType::Integer => json!(window.get_long(row, column)?),
                FieldType::Float => json!(window.get_double(row, column)?),
                FieldType::String => json!(window.get_string(row, column)?),
                FieldType::Blob => json!(window.get_blob(row, column)?.map(|bytes| hex(&bytes))),
            };
            fields.push(field);
        }
        rows.push(Json::Array(fields));
    }
    Ok(rows)
}

fn hex(bytes: &[u8]) -> String {
    let digits: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("x'{}'", digits)
}

fn run_dispatch(config: Option<&Path>, jobs: usize, threads: usize) -> Result<Json, ProbeError> {
    let config = load_config(config)?;
    let mode = config.dispatch.default_transfer_mode;
    let reporter = Arc::new(RecordingReporter::new());
    let rt = Arc::new(Runtime::with_reporter(config, reporter.clone())?);
    let threads = threads.max(1);
    let started = Instant::now();

    let submitters: Vec<_> = (0..threads)
        .map(|t| {
            let rt = Arc::clone(&rt);
            let share = jobs / threads + usize::from(t < jobs % threads);
            thread::spawn(move || -> Result<Vec<Handle>, ProbeError> {
                let mut ids = Vec::with_capacity(share);
                for i in 0..share {
                    let id = rt.broker().next_callback_id()?;
                    let n = (t * 1_000_000 + i) as i64;
                    let job = Job::new(|argument| {
                        let n = argument.as_int().unwrap_or(0);
                        Ok(Some(ManagedRef::int(n.wrapping_mul(n))))
                    });
                    rt.broker().dispatch(mode, move || ManagedRef::int(n), job, id)?;
                    ids.push(id);
                }
                Ok(ids)
            })
        })
        .collect();

    let mut submitted = Vec::with_capacity(jobs);
    for submitter in submitters {
        submitted.extend(submitter.join().map_err(|_| ProbeError::Submitter)??);
    }
    rt.broker().wait_idle();
    let delivered = rt.broker().delivered();

    let mut pulled = 0usize;
    let mut empty = 0usize;
    for id in &submitted {
        match rt.broker().pull_result(*id)? {
            Some(_) => pulled += 1,
            None => empty += 1,
        }
    }
    let elapsed = started.elapsed();
    rt.shutdown();

    Ok(json!({
        "jobs": submitted.len(),
        "threads": threads,
        "mode": format!("{:?}", mode).to_lowercase(),
        "delivered": delivered,
        "pulled": pulled,
        "empty": empty,
        "faults": reporter.len(),
        "pending": rt.broker().pending(),
        "elapsed_ms": elapsed.as_millis() as u64,
    }))
}
