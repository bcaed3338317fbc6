use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the katex-ssr binary.
#[derive(Debug, Parser)]
#[command(
    name = "katex-ssr",
    version,
    about = "Render LaTeX math to KaTeX markup at build time"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "KATEX_SSR_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Render formulas read as JSON lines and print the markup as JSON.
    Render(RenderArgs),
    /// Inspect or reset the persistent formula cache.
    Cache(CacheArgs),
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    #[command(flatten)]
    pub overrides: SessionOverrides,

    /// JSON-lines request file; reads stdin when omitted.
    #[arg(long, short, value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub input: Option<PathBuf>,

    /// Pretty-print the JSON output.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub pretty: bool,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ProjectOverrides {
    /// Override the project directory (renderer working directory and cache root).
    #[arg(long = "project-dir", value_name = "PATH", value_hint = ValueHint::DirPath)]
    pub project_dir: Option<PathBuf>,

    /// Override the cache database path.
    #[arg(long = "cache-path", value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub cache_path: Option<PathBuf>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct SessionOverrides {
    #[command(flatten)]
    pub project: ProjectOverrides,

    /// Override the renderer executable.
    #[arg(long = "renderer-program", value_name = "PATH")]
    pub renderer_program: Option<PathBuf>,

    /// Override the renderer arguments (repeatable).
    #[arg(long = "renderer-arg", value_name = "ARG")]
    pub renderer_args: Vec<String>,

    /// Server-side KaTeX extension to load (repeatable).
    #[arg(long = "ssr-contrib", value_name = "NAME")]
    pub ssr_contribs: Vec<String>,

    /// Toggle the persistent cache.
    #[arg(
        long = "cache-enabled",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub cache_enabled: Option<bool>,

    /// Override the number of formulas sent per renderer message.
    #[arg(long = "chunk-size", value_name = "COUNT")]
    pub chunk_size: Option<usize>,

    /// Override how long to wait for the renderer to exit before killing it.
    #[arg(long = "shutdown-timeout-ms", value_name = "MILLIS")]
    pub shutdown_timeout_ms: Option<u64>,
}

#[derive(Debug, Args, Clone)]
pub struct CacheArgs {
    #[command(flatten)]
    pub overrides: ProjectOverrides,

    #[command(subcommand)]
    pub command: CacheCommand,
}

#[derive(Debug, Subcommand, Clone)]
pub enum CacheCommand {
    /// Print the cache location and entry count.
    Stats,
    /// Delete every cached formula.
    Clear,
}
