use std::{
    fs::File,
    io::{self, BufRead, BufReader, Write},
    process,
};

use katex_ssr::{
    application::{
        error::AppError,
        render::{RenderRequest, Session, SessionConfig, request_from_delimited},
    },
    cache::CacheStore,
    config::{self, CacheArgs, CacheCommand, RenderArgs, Settings},
    infra::telemetry,
};
use serde::Deserialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

fn main() {
    if let Err(error) = run() {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let chain = error.chain().join(": ");
    if dispatcher::has_been_set() {
        error!(error = %chain, "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_writer(io::stderr)
        .with_max_level(Level::ERROR)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %chain, "application error");
    });
}

fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Render(args) => run_render(&settings, &args),
        config::Command::Cache(args) => run_cache(&settings, &args),
    }
}

/// One line of render input. Either `latex` (+ `display_mode`) or delimited
/// `source` such as `\(x^2\)`; `id` defaults to the record's position.
#[derive(Debug, Deserialize)]
struct InputRecord {
    id: Option<u64>,
    latex: Option<String>,
    #[serde(default, alias = "displayMode")]
    display_mode: bool,
    source: Option<String>,
}

fn read_requests(reader: impl BufRead) -> Result<Vec<RenderRequest>, AppError> {
    let mut requests = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let line_no = index + 1;
        if line.trim().is_empty() {
            continue;
        }

        let record: InputRecord = serde_json::from_str(&line)
            .map_err(|err| AppError::input(line_no, err.to_string()))?;
        let id = record.id.unwrap_or(requests.len() as u64);
        let request = match (record.latex, record.source) {
            (Some(latex), _) => RenderRequest::new(id, latex, record.display_mode),
            (None, Some(source)) => request_from_delimited(id, &source),
            (None, None) => {
                return Err(AppError::input(
                    line_no,
                    "expected either `latex` or `source`",
                ));
            }
        };
        requests.push(request);
    }
    Ok(requests)
}

fn run_render(settings: &Settings, args: &RenderArgs) -> Result<(), AppError> {
    let requests = match args.input.as_ref() {
        Some(path) => read_requests(BufReader::new(File::open(path)?))?,
        None => read_requests(io::stdin().lock())?,
    };

    let session = Session::start(SessionConfig::from(settings));
    let output = session.render_batch(&requests);
    let stats = session.shutdown();

    info!(
        requested = requests.len(),
        rendered = output.rendered.len(),
        failed = output.failed.len(),
        cache_hits = stats.cache_hits,
        round_trips = stats.round_trips,
        elapsed_ms = stats.elapsed.as_millis() as u64,
        "Render complete"
    );

    let json = if args.pretty {
        serde_json::to_string_pretty(&output)
    } else {
        serde_json::to_string(&output)
    }
    .map_err(|err| AppError::unexpected(format!("failed to encode output: {err}")))?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{json}")?;
    stdout.flush()?;
    Ok(())
}

fn run_cache(settings: &Settings, args: &CacheArgs) -> Result<(), AppError> {
    let mut stdout = io::stdout().lock();
    if !settings.cache.path.exists() {
        writeln!(stdout, "path: {}", settings.cache.path.display())?;
        writeln!(stdout, "no cache file")?;
        return Ok(());
    }

    let store = CacheStore::open(&settings.cache.path)?;

    match args.command {
        CacheCommand::Stats => {
            let entries = store.len()?;
            writeln!(stdout, "path: {}", store.path().display())?;
            writeln!(stdout, "entries: {entries}")?;
        }
        CacheCommand::Clear => {
            let removed = store.clear()?;
            info!(
                path = %store.path().display(),
                removed,
                "Formula cache cleared"
            );
            writeln!(stdout, "removed {removed} entries")?;
        }
    }

    store.close();
    Ok(())
}
