use super::types::{RenderRequest, RequestId};

/// Build a request from delimited math source as found in documents.
///
/// `\[ … \]` and `$$ … $$` are display math, `\( … \)` and `$ … $` inline.
/// Text without recognised delimiters, or with nothing between them, is taken
/// as inline LaTeX.
pub fn request_from_delimited(id: impl Into<RequestId>, source: &str) -> RenderRequest {
    let (latex, display_mode) = strip_delimiters(source);
    RenderRequest::new(id, latex, display_mode)
}

/// Split delimited math into its LaTeX body and display mode.
pub fn strip_delimiters(source: &str) -> (&str, bool) {
    let source = source.trim();
    let delimiters: [(&str, &str, bool); 4] = [
        ("\\(", "\\)", false),
        ("\\[", "\\]", true),
        // `$$` first so display math is not read as inline `$…$`.
        ("$$", "$$", true),
        ("$", "$", false),
    ];

    for (open, close, display_mode) in delimiters {
        if source.len() >= open.len() + close.len() {
            if let Some(body) = source
                .strip_prefix(open)
                .and_then(|rest| rest.strip_suffix(close))
                .filter(|body| !body.trim().is_empty())
            {
                return (body, display_mode);
            }
        }
    }

    (source, false)
}
