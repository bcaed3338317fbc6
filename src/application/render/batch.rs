//! Batch coordinator: cache lookup, chunked renderer exchanges, write-back.
//!
//! Misses are sent in chunks of bounded size so neither side of the pipe can
//! fill its buffer while the other is blocked writing, and so a single
//! message never grows with the size of the whole document.

use std::{
    borrow::Cow,
    collections::{HashMap, HashSet},
    num::NonZeroUsize,
    time::Instant,
};

use metrics::{counter, histogram};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

use super::process::{ProcessError, RendererProcess};
use super::protocol::{self, PendingItem, ProtocolError};
use super::types::{BatchFailure, BatchOutput, RenderRequest, RenderResult, RequestId};
use crate::cache::{CacheKey, CacheStore};

const TARGET: &str = "application::render::batch";

pub const DEFAULT_CHUNK_SIZE: NonZeroUsize = NonZeroUsize::new(500).unwrap();

pub(crate) const METRIC_FORMULAS: &str = "katex_ssr_formulas_total";
pub(crate) const METRIC_CACHE_HITS: &str = "katex_ssr_cache_hit_total";
pub(crate) const METRIC_ROUND_TRIPS: &str = "katex_ssr_renderer_round_trips_total";
pub(crate) const METRIC_RENDER_FAILURES: &str = "katex_ssr_render_failures_total";
pub(crate) const METRIC_CHUNK_MS: &str = "katex_ssr_chunk_ms";

/// A channel that carries one request line and yields one response line.
pub trait BatchTransport {
    fn exchange(&mut self, line: &str) -> Result<String, ProcessError>;
}

impl BatchTransport for RendererProcess {
    fn exchange(&mut self, line: &str) -> Result<String, ProcessError> {
        RendererProcess::exchange(self, line)
    }
}

/// Why the chunk loop stopped early.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] ProcessError),
}

impl BatchError {
    /// The transport is unusable and must not serve further batches.
    ///
    /// Besides a dead process this covers replies that show the channel is
    /// out of step: a line that is not a response (so the real reply may
    /// still be queued) and results for ids the request never carried.
    pub fn is_terminal(&self) -> bool {
        match self {
            BatchError::Transport(err) => err.is_terminal(),
            BatchError::Protocol(
                ProtocolError::Decode { .. } | ProtocolError::UnknownId { .. },
            ) => true,
            BatchError::Protocol(_) => false,
        }
    }
}

/// Everything produced by one run of the coordinator.
#[derive(Debug, Default)]
pub struct BatchRun {
    pub output: BatchOutput,
    /// Set when remaining chunks were skipped.
    pub error: Option<BatchError>,
    /// Rendered entries not yet in the cache.
    pub new_entries: Vec<(CacheKey, String)>,
}

/// Drives one batch through the cache and the renderer.
#[derive(Debug, Clone, Copy)]
pub struct BatchCoordinator<'a> {
    cache: Option<&'a CacheStore>,
    options: &'a Map<String, Value>,
    chunk_size: NonZeroUsize,
}

impl<'a> BatchCoordinator<'a> {
    pub fn new(
        cache: Option<&'a CacheStore>,
        options: &'a Map<String, Value>,
        chunk_size: NonZeroUsize,
    ) -> Self {
        Self {
            cache,
            options,
            chunk_size,
        }
    }

    /// Run all steps: cache lookup, chunked rendering, cache write-back.
    /// Without a transport every miss is reported as unavailable.
    pub fn run<T>(&self, requests: &[RenderRequest], transport: Option<&mut T>) -> BatchRun
    where
        T: BatchTransport + ?Sized,
    {
        let (mut output, pending) = self.resolve_cached(requests);
        let run = match transport {
            Some(transport) => {
                let (new_entries, error) = self.render_pending(transport, &pending, &mut output);
                BatchRun {
                    output,
                    error,
                    new_entries,
                }
            }
            None => {
                mark_unresolved(&pending, &mut output, BatchFailure::Unavailable);
                BatchRun {
                    output,
                    ..BatchRun::default()
                }
            }
        };
        self.persist(&run.new_entries);
        run
    }

    /// Serve what the cache already knows. Returns the partial output and the
    /// misses, in input order, with their keys.
    pub(crate) fn resolve_cached<'r>(
        &self,
        requests: &'r [RenderRequest],
    ) -> (BatchOutput, Vec<PendingItem<'r>>) {
        let mut output = BatchOutput::default();
        let mut pending = Vec::new();
        let mut seen = HashSet::with_capacity(requests.len());

        for request in requests {
            if !seen.insert(request.id) {
                warn!(
                    target = TARGET,
                    op = "batch::resolve_cached",
                    id = %request.id,
                    "Duplicate request id in batch; keeping the first occurrence"
                );
                continue;
            }

            let key = request.cache_key();
            match self.cache.map(|cache| cache.get(&key)) {
                Some(Ok(Some(markup))) => {
                    output.rendered.insert(request.id, markup);
                    output.cache_hits += 1;
                }
                Some(Err(err)) => {
                    warn!(
                        target = TARGET,
                        op = "batch::resolve_cached",
                        result = "cache_read_error",
                        id = %request.id,
                        error = %err,
                        "Failed to read formula cache; rendering instead"
                    );
                    pending.push(PendingItem { request, key });
                }
                Some(Ok(None)) | None => pending.push(PendingItem { request, key }),
            }
        }

        output.formulas = seen.len();
        counter!(METRIC_FORMULAS).increment(seen.len() as u64);
        counter!(METRIC_CACHE_HITS).increment(output.cache_hits as u64);

        (output, pending)
    }

    /// Send the misses chunk by chunk. The caller's `&mut` borrow of the
    /// transport spans the whole loop, so chunks never interleave with another
    /// batch. Misses are grouped by their merged options first, so a request
    /// with options of its own travels in a message of its own group. Stops at
    /// the first protocol or transport failure; results from earlier chunks
    /// are kept.
    pub(crate) fn render_pending<T>(
        &self,
        transport: &mut T,
        pending: &[PendingItem<'_>],
        output: &mut BatchOutput,
    ) -> (Vec<(CacheKey, String)>, Option<BatchError>)
    where
        T: BatchTransport + ?Sized,
    {
        let mut new_entries = Vec::new();
        let mut error = None;
        let groups = group_by_options(pending, self.options);
        let chunks: Vec<(&Map<String, Value>, &[PendingItem<'_>])> = groups
            .iter()
            .flat_map(|group| {
                group
                    .items
                    .chunks(self.chunk_size.get())
                    .map(move |chunk| (&*group.options, chunk))
            })
            .collect();
        let chunk_count = chunks.len();

        for (index, (options, chunk)) in chunks.into_iter().enumerate() {
            let started_at = Instant::now();
            output.round_trips += 1;
            counter!(METRIC_ROUND_TRIPS).increment(1);

            let outcome = protocol::encode_batch(chunk, options)
                .map_err(BatchError::from)
                .and_then(|line| transport.exchange(&line).map_err(BatchError::from))
                .and_then(|response| correlate(chunk, &response).map_err(BatchError::from));
            histogram!(METRIC_CHUNK_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

            let results = match outcome {
                Ok(results) => results,
                Err(err) => {
                    warn!(
                        target = TARGET,
                        op = "batch::render_pending",
                        result = "aborted",
                        chunk = index + 1,
                        chunks = chunk_count,
                        terminal = err.is_terminal(),
                        error = %err,
                        "Renderer exchange failed; skipping remaining chunks"
                    );
                    error = Some(err);
                    break;
                }
            };

            let mut failures = 0_u64;
            for item in chunk {
                match results.get(&item.request.id) {
                    Some(RenderResult::Rendered { markup }) => {
                        output.rendered.insert(item.request.id, markup.clone());
                        new_entries.push((item.key.clone(), markup.clone()));
                    }
                    Some(RenderResult::Failed { message }) => {
                        failures += 1;
                        warn!(
                            target = TARGET,
                            op = "batch::render_pending",
                            result = "render_error",
                            id = %item.request.id,
                            latex = %item.request.latex,
                            error = %message,
                            "KaTeX could not render formula"
                        );
                        output.failed.insert(
                            item.request.id,
                            BatchFailure::Renderer {
                                message: message.clone(),
                            },
                        );
                    }
                    None => {
                        failures += 1;
                        output.failed.insert(item.request.id, BatchFailure::Missing);
                    }
                }
            }
            counter!(METRIC_RENDER_FAILURES).increment(failures);

            debug!(
                target = TARGET,
                op = "batch::render_pending",
                result = "ok",
                chunk = index + 1,
                chunks = chunk_count,
                items = chunk.len(),
                failures,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                "Chunk rendered"
            );
        }

        if error.is_some() {
            mark_unresolved(pending, output, BatchFailure::Aborted);
        }

        (new_entries, error)
    }

    /// Write newly rendered entries back in one transaction. Failures are logged.
    pub(crate) fn persist(&self, entries: &[(CacheKey, String)]) {
        let Some(cache) = self.cache else {
            return;
        };
        if let Err(err) = cache.put_many(entries) {
            warn!(
                target = TARGET,
                op = "batch::persist",
                result = "cache_write_error",
                entries = entries.len(),
                error = %err,
                "Failed to write rendered formulas to cache"
            );
        }
    }
}

/// Misses that share the same effective renderer options.
struct OptionGroup<'o, 'r> {
    options: Cow<'o, Map<String, Value>>,
    items: Vec<PendingItem<'r>>,
}

/// Split the misses by their per-request options so each message can carry
/// one fully merged options object. Groups keep first-appearance order and
/// items keep input order within a group.
fn group_by_options<'o, 'r>(
    pending: &[PendingItem<'r>],
    session: &'o Map<String, Value>,
) -> Vec<OptionGroup<'o, 'r>> {
    let mut groups: Vec<(&'r Map<String, Value>, OptionGroup<'o, 'r>)> = Vec::new();
    for item in pending {
        let own = &item.request.options;
        match groups.iter_mut().find(|(key, _)| *key == own) {
            Some((_, group)) => group.items.push(item.clone()),
            None => groups.push((
                own,
                OptionGroup {
                    options: merge_options(session, own),
                    items: vec![item.clone()],
                },
            )),
        }
    }
    groups.into_iter().map(|(_, group)| group).collect()
}

/// Session options with the request's own keys laid over them.
fn merge_options<'o>(
    session: &'o Map<String, Value>,
    request: &Map<String, Value>,
) -> Cow<'o, Map<String, Value>> {
    if request.is_empty() {
        return Cow::Borrowed(session);
    }
    let mut merged = session.clone();
    merged.extend(request.iter().map(|(key, value)| (key.clone(), value.clone())));
    Cow::Owned(merged)
}

/// Match a response to the chunk it answers. Every result id must belong to
/// the chunk and appear once; otherwise the whole response is rejected.
fn correlate(
    chunk: &[PendingItem<'_>],
    response: &str,
) -> Result<HashMap<RequestId, RenderResult>, ProtocolError> {
    let expected: HashSet<RequestId> = chunk.iter().map(|item| item.request.id).collect();
    let mut results = HashMap::with_capacity(chunk.len());

    for (id, result) in protocol::decode_batch(response)? {
        if !expected.contains(&id) {
            return Err(ProtocolError::UnknownId { id });
        }
        if results.insert(id, result).is_some() {
            return Err(ProtocolError::DuplicateId { id });
        }
    }

    Ok(results)
}

pub(crate) fn mark_unresolved(
    pending: &[PendingItem<'_>],
    output: &mut BatchOutput,
    reason: BatchFailure,
) {
    for item in pending {
        let id = item.request.id;
        if !output.rendered.contains_key(&id) && !output.failed.contains_key(&id) {
            output.failed.insert(id, reason.clone());
        }
    }
}
