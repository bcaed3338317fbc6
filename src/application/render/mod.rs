//! KaTeX rendering through a persistent renderer process.
//!
//! Callers collect the formulas of a document as [`RenderRequest`]s, hand them
//! to [`Session::render_batch`], and splice the returned markup back in. Any
//! id missing from [`BatchOutput::rendered`] is unrendered and should be left
//! as source text.

mod batch;
mod math;
mod process;
mod protocol;
mod session;
mod types;

pub use batch::{BatchCoordinator, BatchError, BatchRun, BatchTransport, DEFAULT_CHUNK_SIZE};
pub use math::{request_from_delimited, strip_delimiters};
pub use process::{
    DEFAULT_SHUTDOWN_TIMEOUT, ProcessError, RendererConfig, RendererProcess, ShutdownOutcome,
};
pub use protocol::ProtocolError;
pub use session::{Session, SessionConfig, SessionStats};
pub use types::{BatchFailure, BatchOutput, RenderRequest, RenderResult, RequestId};

pub(crate) use batch::{
    METRIC_CACHE_HITS, METRIC_CHUNK_MS, METRIC_FORMULAS, METRIC_RENDER_FAILURES,
    METRIC_ROUND_TRIPS,
};
