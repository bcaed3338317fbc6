//! Build-scoped rendering session.
//!
//! A session owns one renderer process and one cache handle from the start of
//! a build to its end. Failures below this level never abort the build: a
//! renderer that cannot start or dies midway leaves formulas unrendered, and a
//! cache that cannot open leaves the build uncached.

use std::{
    num::NonZeroUsize,
    path::PathBuf,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use super::batch::{BatchCoordinator, BatchError, DEFAULT_CHUNK_SIZE, mark_unresolved};
use super::process::{RendererConfig, RendererProcess};
use super::types::{BatchFailure, BatchOutput, RenderRequest};
use crate::cache::{CacheStore, mutex_lock};
use crate::config::Settings;

const TARGET: &str = "application::render::session";

/// Everything a session needs, resolved from [`Settings`] or built by hand.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub renderer: RendererConfig,
    /// Server-side KaTeX extensions announced in the setup message.
    pub contribs: Vec<String>,
    /// Options forwarded with every batch.
    pub render_options: Map<String, Value>,
    pub chunk_size: NonZeroUsize,
    /// Cache file; `None` disables caching.
    pub cache_path: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            renderer: RendererConfig::default(),
            contribs: Vec::new(),
            render_options: Map::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            cache_path: None,
        }
    }
}

impl From<&Settings> for SessionConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            renderer: RendererConfig {
                program: settings.renderer.program.clone(),
                args: settings.renderer.args.clone(),
                project_dir: Some(settings.renderer.project_dir.clone()),
                shutdown_timeout: settings.renderer.shutdown_timeout,
            },
            contribs: settings.renderer.ssr_contribs.clone(),
            render_options: settings.renderer.katex_options.clone(),
            chunk_size: settings.batch.chunk_size,
            cache_path: settings
                .cache
                .enabled
                .then(|| settings.cache.path.clone()),
        }
    }
}

/// End-of-build counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub formulas: u64,
    pub cache_hits: u64,
    pub round_trips: u64,
    pub elapsed: Duration,
}

pub struct Session {
    renderer: Mutex<Option<RendererProcess>>,
    cache: Option<CacheStore>,
    render_options: Map<String, Value>,
    chunk_size: NonZeroUsize,
    formulas: AtomicU64,
    cache_hits: AtomicU64,
    round_trips: AtomicU64,
    elapsed_nanos: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cache", &self.cache)
            .field("chunk_size", &self.chunk_size)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Spawn the renderer and open the cache. Never fails; see module docs.
    pub fn start(config: SessionConfig) -> Self {
        let cache = config.cache_path.as_ref().and_then(|path| {
            CacheStore::open(path)
                .map_err(|err| {
                    warn!(
                        target = TARGET,
                        op = "session::start",
                        result = "cache_disabled",
                        path = %path.display(),
                        error = %err,
                        "Formula cache unavailable; continuing without cache"
                    );
                })
                .ok()
        });

        let renderer = RendererProcess::spawn(&config.renderer, &config.contribs)
            .map_err(|err| {
                error!(
                    target = TARGET,
                    op = "session::start",
                    result = "renderer_disabled",
                    error = %err,
                    "Renderer could not start; math will be left unrendered"
                );
            })
            .ok();

        Self::from_parts(renderer, cache, config.render_options, config.chunk_size)
    }

    /// Assemble a session from already-built parts.
    pub fn from_parts(
        renderer: Option<RendererProcess>,
        cache: Option<CacheStore>,
        render_options: Map<String, Value>,
        chunk_size: NonZeroUsize,
    ) -> Self {
        Self {
            renderer: Mutex::new(renderer),
            cache,
            render_options,
            chunk_size,
            formulas: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            round_trips: AtomicU64::new(0),
            elapsed_nanos: AtomicU64::new(0),
        }
    }

    pub fn is_renderer_available(&self) -> bool {
        mutex_lock(&self.renderer, TARGET, "is_renderer_available").is_some()
    }

    pub fn cache(&self) -> Option<&CacheStore> {
        self.cache.as_ref()
    }

    /// Render one document's formulas.
    ///
    /// Cache lookups happen before the renderer lock is taken; the lock is
    /// then held for the whole chunk loop. A renderer that dies is retired and
    /// every later batch reports its misses as unavailable.
    pub fn render_batch(&self, requests: &[RenderRequest]) -> BatchOutput {
        let started_at = Instant::now();
        let coordinator =
            BatchCoordinator::new(self.cache.as_ref(), &self.render_options, self.chunk_size);

        let (mut output, pending) = coordinator.resolve_cached(requests);
        let mut new_entries = Vec::new();

        if !pending.is_empty() {
            let mut renderer = mutex_lock(&self.renderer, TARGET, "render_batch");
            match renderer.as_mut() {
                Some(process) => {
                    let (entries, failure) =
                        coordinator.render_pending(process, &pending, &mut output);
                    new_entries = entries;
                    if failure.as_ref().is_some_and(BatchError::is_terminal) {
                        if let Some(process) = renderer.take() {
                            let outcome = process.shutdown();
                            error!(
                                target = TARGET,
                                op = "session::render_batch",
                                result = "renderer_retired",
                                outcome = ?outcome,
                                "Renderer process is dead or out of step; later formulas stay unrendered"
                            );
                        }
                    }
                }
                None => mark_unresolved(&pending, &mut output, BatchFailure::Unavailable),
            }
        }

        coordinator.persist(&new_entries);

        self.formulas
            .fetch_add(output.formulas as u64, Ordering::Relaxed);
        self.cache_hits
            .fetch_add(output.cache_hits as u64, Ordering::Relaxed);
        self.round_trips
            .fetch_add(output.round_trips as u64, Ordering::Relaxed);
        let elapsed = u64::try_from(started_at.elapsed().as_nanos()).unwrap_or(u64::MAX);
        self.elapsed_nanos.fetch_add(elapsed, Ordering::Relaxed);

        output
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            formulas: self.formulas.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            round_trips: self.round_trips.load(Ordering::Relaxed),
            elapsed: Duration::from_nanos(self.elapsed_nanos.load(Ordering::Relaxed)),
        }
    }

    /// Stop the renderer (graceful, then forced) and close the cache.
    pub fn shutdown(self) -> SessionStats {
        let stats = self.stats();
        let renderer = match self.renderer.into_inner() {
            Ok(renderer) => renderer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(process) = renderer {
            process.shutdown();
        }
        if let Some(cache) = self.cache {
            cache.close();
        }

        info!(
            target = TARGET,
            op = "session::shutdown",
            formulas = stats.formulas,
            cache_hits = stats.cache_hits,
            round_trips = stats.round_trips,
            elapsed_ms = stats.elapsed.as_millis() as u64,
            "KaTeX rendering finished"
        );
        stats
    }
}
