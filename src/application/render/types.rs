use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::cache::CacheKey;

/// Identifies a request within one batch. Usually the position of the formula
/// in the document being processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RequestId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// A single formula to render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderRequest {
    pub id: RequestId,
    /// LaTeX source without math delimiters.
    pub latex: String,
    pub display_mode: bool,
    /// Per-request renderer options, laid over the session options (request
    /// keys win). Options are not part of the [`CacheKey`], so cached markup is
    /// reused whatever options a later request carries.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub options: Map<String, Value>,
}

impl RenderRequest {
    pub fn new(id: impl Into<RequestId>, latex: impl Into<String>, display_mode: bool) -> Self {
        Self {
            id: id.into(),
            latex: latex.into(),
            display_mode,
            options: Map::new(),
        }
    }

    pub fn inline(id: impl Into<RequestId>, latex: impl Into<String>) -> Self {
        Self::new(id, latex, false)
    }

    pub fn display(id: impl Into<RequestId>, latex: impl Into<String>) -> Self {
        Self::new(id, latex, true)
    }

    pub fn with_option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.latex, self.display_mode)
    }
}

/// The renderer's verdict for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderResult {
    Rendered { markup: String },
    Failed { message: String },
}

/// Why a request is missing from [`BatchOutput::rendered`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum BatchFailure {
    /// The renderer rejected the formula.
    Renderer { message: String },
    /// The renderer answered the chunk but left this id out.
    Missing,
    /// The batch was aborted before this request got an answer.
    Aborted,
    /// No renderer process is available for this session.
    Unavailable,
}

impl fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchFailure::Renderer { message } => write!(f, "renderer error: {message}"),
            BatchFailure::Missing => f.write_str("renderer response did not include this id"),
            BatchFailure::Aborted => f.write_str("batch aborted before a response arrived"),
            BatchFailure::Unavailable => f.write_str("renderer unavailable"),
        }
    }
}

/// Result of rendering one batch.
///
/// `rendered` holds exactly the cache hits and successful renders; any id not
/// present there must be treated as unrendered. `failed` explains each absence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutput {
    pub rendered: BTreeMap<RequestId, String>,
    pub failed: BTreeMap<RequestId, BatchFailure>,
    /// Distinct request ids in the batch.
    #[serde(skip)]
    pub formulas: usize,
    #[serde(skip)]
    pub cache_hits: usize,
    #[serde(skip)]
    pub round_trips: usize,
}

impl BatchOutput {
    pub fn markup(&self, id: RequestId) -> Option<&str> {
        self.rendered.get(&id).map(String::as_str)
    }

    pub fn failure(&self, id: RequestId) -> Option<&BatchFailure> {
        self.failed.get(&id)
    }

    pub fn is_rendered(&self, id: RequestId) -> bool {
        self.rendered.contains_key(&id)
    }
}
