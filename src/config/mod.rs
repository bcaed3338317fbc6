//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::level_filters::LevelFilter;

pub use cli::{
    CacheArgs, CacheCommand, CliArgs, Command, ProjectOverrides, RenderArgs, SessionOverrides,
};

const LOCAL_CONFIG_BASENAME: &str = "katex-ssr";
const ENV_PREFIX: &str = "KATEX_SSR";
const DEFAULT_PROJECT_DIR: &str = ".";
const DEFAULT_RENDERER_PROGRAM: &str = "node";
const DEFAULT_RENDERER_SCRIPT: &str = "renderer.js";
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_CHUNK_SIZE: usize = 500;
pub(crate) const DEFAULT_CACHE_RELATIVE_PATH: &str = ".cache/plugin/katex-ssr/cache.db";

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub renderer: RendererSettings,
    pub cache: CacheSettings,
    pub batch: BatchSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RendererSettings {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub project_dir: PathBuf,
    pub shutdown_timeout: Duration,
    /// Server-side extensions, with legacy `contrib_scripts` merged in.
    pub ssr_contribs: Vec<String>,
    pub katex_options: Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub chunk_size: NonZeroUsize,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder =
        Config::builder().add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("renderer.args")
            .with_list_parse_key("renderer.ssr_contribs")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_logging_overrides(cli);

    match &cli.command {
        Command::Render(args) => raw.apply_session_overrides(&args.overrides),
        Command::Cache(args) => raw.apply_project_overrides(&args.overrides),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    renderer: RawRendererSettings,
    cache: RawCacheSettings,
    batch: RawBatchSettings,
}

impl RawSettings {
    fn apply_logging_overrides(&mut self, cli: &CliArgs) {
        if let Some(level) = cli.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = cli.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_project_overrides(&mut self, overrides: &ProjectOverrides) {
        if let Some(dir) = overrides.project_dir.as_ref() {
            self.renderer.project_dir = Some(dir.clone());
        }
        if let Some(path) = overrides.cache_path.as_ref() {
            self.cache.path = Some(path.clone());
        }
    }

    fn apply_session_overrides(&mut self, overrides: &SessionOverrides) {
        self.apply_project_overrides(&overrides.project);
        if let Some(program) = overrides.renderer_program.as_ref() {
            self.renderer.program = Some(program.clone());
        }
        if !overrides.renderer_args.is_empty() {
            self.renderer.args = Some(overrides.renderer_args.clone());
        }
        if !overrides.ssr_contribs.is_empty() {
            self.renderer.ssr_contribs = Some(overrides.ssr_contribs.clone());
        }
        if let Some(enabled) = overrides.cache_enabled {
            self.cache.enabled = Some(enabled);
        }
        if let Some(size) = overrides.chunk_size {
            self.batch.chunk_size = Some(size);
        }
        if let Some(timeout) = overrides.shutdown_timeout_ms {
            self.renderer.shutdown_timeout_ms = Some(timeout);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            renderer,
            cache,
            batch,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let renderer = build_renderer_settings(renderer)?;
        let cache = build_cache_settings(cache, &renderer.project_dir)?;
        let batch = build_batch_settings(batch)?;

        Ok(Self {
            logging,
            renderer,
            cache,
            batch,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_renderer_settings(renderer: RawRendererSettings) -> Result<RendererSettings, LoadError> {
    let program = renderer
        .program
        .unwrap_or_else(|| PathBuf::from(DEFAULT_RENDERER_PROGRAM));
    if program.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.program",
            "path must not be empty",
        ));
    }

    let args = renderer
        .args
        .unwrap_or_else(|| vec![DEFAULT_RENDERER_SCRIPT.to_string()]);

    let project_dir = renderer
        .project_dir
        .unwrap_or_else(|| PathBuf::from(DEFAULT_PROJECT_DIR));
    if project_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "renderer.project_dir",
            "path must not be empty",
        ));
    }

    let timeout_ms = renderer
        .shutdown_timeout_ms
        .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS);
    if timeout_ms == 0 {
        return Err(LoadError::invalid(
            "renderer.shutdown_timeout_ms",
            "must be greater than zero",
        ));
    }

    let ssr_contribs = merge_contribs(
        renderer.ssr_contribs.unwrap_or_default(),
        renderer.contrib_scripts.unwrap_or_default(),
    );

    Ok(RendererSettings {
        program,
        args,
        project_dir,
        shutdown_timeout: Duration::from_millis(timeout_ms),
        ssr_contribs,
        katex_options: renderer.katex_options.unwrap_or_default(),
    })
}

/// Append legacy `contrib_scripts` entries that are not already listed.
fn merge_contribs(mut ssr_contribs: Vec<String>, legacy: Vec<String>) -> Vec<String> {
    for script in legacy {
        if !ssr_contribs.contains(&script) {
            ssr_contribs.push(script);
        }
    }
    ssr_contribs
}

fn build_cache_settings(
    cache: RawCacheSettings,
    project_dir: &Path,
) -> Result<CacheSettings, LoadError> {
    let path = match cache.path {
        Some(path) if path.as_os_str().is_empty() => {
            return Err(LoadError::invalid("cache.path", "path must not be empty"));
        }
        Some(path) if path.is_relative() => project_dir.join(path),
        Some(path) => path,
        None => project_dir.join(DEFAULT_CACHE_RELATIVE_PATH),
    };

    Ok(CacheSettings {
        enabled: cache.enabled.unwrap_or(true),
        path,
    })
}

fn build_batch_settings(batch: RawBatchSettings) -> Result<BatchSettings, LoadError> {
    let value = batch.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
    let chunk_size = NonZeroUsize::new(value)
        .ok_or_else(|| LoadError::invalid("batch.chunk_size", "must be greater than zero"))?;
    Ok(BatchSettings { chunk_size })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRendererSettings {
    program: Option<PathBuf>,
    args: Option<Vec<String>>,
    project_dir: Option<PathBuf>,
    shutdown_timeout_ms: Option<u64>,
    ssr_contribs: Option<Vec<String>>,
    contrib_scripts: Option<Vec<String>>,
    katex_options: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enabled: Option<bool>,
    path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawBatchSettings {
    chunk_size: Option<usize>,
}
