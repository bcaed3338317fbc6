//! Wire messages exchanged with the renderer process.
//!
//! Every message is one JSON object on one line. The renderer answers each
//! `render_batch` line with exactly one response line; `setup` gets no reply.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use super::types::{RenderRequest, RenderResult, RequestId};
use crate::cache::CacheKey;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode renderer message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("malformed renderer response: {source}")]
    Decode {
        #[source]
        source: serde_json::Error,
        line: String,
    },
    #[error("renderer reported an error: {message}")]
    Renderer { message: String },
    #[error("renderer answered for id {id}, which was not part of the request")]
    UnknownId { id: RequestId },
    #[error("renderer answered twice for id {id}")]
    DuplicateId { id: RequestId },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OutboundMessage<'a> {
    Setup {
        contribs: &'a [String],
    },
    RenderBatch {
        items: Vec<BatchItem<'a>>,
        options: &'a Map<String, Value>,
    },
}

#[derive(Debug, Serialize)]
struct BatchItem<'a> {
    id: RequestId,
    latex: &'a str,
    #[serde(rename = "displayMode")]
    display_mode: bool,
    cache_key: &'a str,
}

/// A request waiting for the renderer, together with its precomputed key.
#[derive(Debug, Clone)]
pub(crate) struct PendingItem<'a> {
    pub request: &'a RenderRequest,
    pub key: CacheKey,
}

pub(crate) fn encode_setup(contribs: &[String]) -> Result<String, ProtocolError> {
    serde_json::to_string(&OutboundMessage::Setup { contribs }).map_err(ProtocolError::Encode)
}

/// Encode one chunk. `options` must already be the effective options of every
/// item in the chunk; items carry no options of their own on the wire.
pub(crate) fn encode_batch(
    chunk: &[PendingItem<'_>],
    options: &Map<String, Value>,
) -> Result<String, ProtocolError> {
    let items = chunk
        .iter()
        .map(|item| BatchItem {
            id: item.request.id,
            latex: &item.request.latex,
            display_mode: item.request.display_mode,
            cache_key: item.key.as_str(),
        })
        .collect();
    serde_json::to_string(&OutboundMessage::RenderBatch { items, options })
        .map_err(ProtocolError::Encode)
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum BatchResponse {
    Success {
        #[serde(default)]
        results: Vec<ItemResponse>,
    },
    Error {
        #[serde(default)]
        message: String,
    },
}

#[derive(Debug, Deserialize)]
struct ItemResponse {
    id: RequestId,
    status: ItemStatus,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ItemStatus {
    Success,
    Error,
}

/// Parse a response line into per-id results, in the order the renderer sent them.
pub(crate) fn decode_batch(line: &str) -> Result<Vec<(RequestId, RenderResult)>, ProtocolError> {
    let response: BatchResponse =
        serde_json::from_str(line.trim_end()).map_err(|source| ProtocolError::Decode {
            source,
            line: line.to_string(),
        })?;

    match response {
        BatchResponse::Error { message } => Err(ProtocolError::Renderer { message }),
        BatchResponse::Success { results } => Ok(results
            .into_iter()
            .map(|item| {
                let result = match (item.status, item.html) {
                    (ItemStatus::Success, Some(markup)) => RenderResult::Rendered { markup },
                    (ItemStatus::Success, None) => RenderResult::Failed {
                        message: "renderer returned success without markup".to_string(),
                    },
                    (ItemStatus::Error, _) => RenderResult::Failed {
                        message: item
                            .message
                            .unwrap_or_else(|| "unknown renderer error".to_string()),
                    },
                };
                (item.id, result)
            })
            .collect()),
    }
}
