#![cfg(unix)]

mod common;

use std::{num::NonZeroUsize, thread};

use common::{FakeRenderer, success};
use katex_ssr::{
    application::render::{BatchFailure, RenderRequest, RequestId, Session, SessionConfig},
    cache::{CacheKey, CacheStore},
};
use tempfile::TempDir;

#[test]
fn identical_formulas_share_one_cache_entry() {
    let first = success(&[(0, "<span>x2</span>"), (1, "<span>x2</span>")]);
    let renderer = FakeRenderer::new(&[first.as_str()]);
    let cache_dir = TempDir::new().expect("temp dir");
    let cache_path = cache_dir.path().join("cache.db");

    let session = Session::start(renderer.session_config(Some(&cache_path)));
    let output = session.render_batch(&[
        RenderRequest::inline(0, "x^2"),
        RenderRequest::inline(1, "x^2"),
    ]);
    assert_eq!(output.markup(RequestId(0)), Some("<span>x2</span>"));
    assert_eq!(output.markup(RequestId(1)), Some("<span>x2</span>"));
    assert!(output.failed.is_empty());
    assert_eq!(output.round_trips, 1);

    let cache = session.cache().expect("cache open");
    assert_eq!(cache.len().expect("count"), 1);

    let again = session.render_batch(&[RenderRequest::inline(0, "  x^2 ")]);
    assert_eq!(again.markup(RequestId(0)), Some("<span>x2</span>"));
    assert_eq!(again.round_trips, 0);
    assert_eq!(again.cache_hits, 1);

    let stats = session.shutdown();
    assert_eq!(stats.formulas, 3);
    assert_eq!(stats.cache_hits, 1);
    assert_eq!(stats.round_trips, 1);

    let batches = renderer.batches();
    assert_eq!(batches.len(), 1);
    let items = batches[0]["items"].as_array().expect("items");
    assert_eq!(items.len(), 2);
    assert_eq!(items[0]["latex"], "x^2");
    assert_eq!(
        items[0]["cache_key"],
        CacheKey::new("x^2", false).as_str()
    );
}

#[test]
fn renderer_crash_keeps_completed_chunks() {
    let chunk_one = success(&[(0, "<span>a</span>")]);
    let chunk_two = success(&[(1, "<span>b</span>")]);
    let renderer = FakeRenderer::new(&[chunk_one.as_str(), chunk_two.as_str()]);
    let cache_dir = TempDir::new().expect("temp dir");
    let cache_path = cache_dir.path().join("cache.db");

    let config = SessionConfig {
        chunk_size: NonZeroUsize::new(1).expect("non-zero"),
        ..renderer.session_config(Some(&cache_path))
    };
    let session = Session::start(config);
    let requests: Vec<RenderRequest> = ["a", "b", "c", "d", "e"]
        .into_iter()
        .enumerate()
        .map(|(id, latex)| RenderRequest::inline(id as u64, latex))
        .collect();

    let output = session.render_batch(&requests);
    assert_eq!(output.markup(RequestId(0)), Some("<span>a</span>"));
    assert_eq!(output.markup(RequestId(1)), Some("<span>b</span>"));
    for id in 2..5 {
        assert_eq!(output.failure(RequestId(id)), Some(&BatchFailure::Aborted));
    }
    assert_eq!(output.round_trips, 3);
    assert!(!session.is_renderer_available());

    let later = session.render_batch(&[
        RenderRequest::inline(0, "a"),
        RenderRequest::inline(1, "f"),
    ]);
    assert_eq!(later.markup(RequestId(0)), Some("<span>a</span>"));
    assert_eq!(later.failure(RequestId(1)), Some(&BatchFailure::Unavailable));
    session.shutdown();

    let reopened = CacheStore::open(&cache_path).expect("reopen cache");
    assert_eq!(reopened.len().expect("count"), 2);
    assert_eq!(
        reopened
            .get(&CacheKey::new("b", false))
            .expect("read")
            .as_deref(),
        Some("<span>b</span>")
    );
}

#[test]
fn rejected_formulas_are_not_cached() {
    let response = r#"{"status":"success","results":[{"id":0,"status":"error","message":"KaTeX parse error: Undefined control sequence: \\foo"},{"id":1,"status":"success","html":"<span>y</span>"}]}"#;
    let renderer = FakeRenderer::new(&[response]);
    let cache_dir = TempDir::new().expect("temp dir");
    let cache_path = cache_dir.path().join("cache.db");

    let session = Session::start(renderer.session_config(Some(&cache_path)));
    let output = session.render_batch(&[
        RenderRequest::inline(0, "\\foo"),
        RenderRequest::inline(1, "y"),
    ]);

    match output.failure(RequestId(0)) {
        Some(BatchFailure::Renderer { message }) => {
            assert!(message.contains("Undefined control sequence"), "{message}");
        }
        other => panic!("expected renderer failure, got {other:?}"),
    }
    assert_eq!(output.markup(RequestId(1)), Some("<span>y</span>"));
    assert!(session.is_renderer_available());

    let cache = session.cache().expect("cache open");
    assert_eq!(cache.len().expect("count"), 1);
    assert!(
        cache
            .get(&CacheKey::new("\\foo", false))
            .expect("read")
            .is_none()
    );
    session.shutdown();
}

#[test]
fn batch_level_error_leaves_renderer_running() {
    let rejected = r#"{"status":"error","message":"batch too large"}"#;
    let accepted = success(&[(0, "<span>z</span>")]);
    let renderer = FakeRenderer::new(&[rejected, accepted.as_str()]);

    let session = Session::start(renderer.session_config(None));
    let first = session.render_batch(&[RenderRequest::inline(0, "z")]);
    assert_eq!(first.failure(RequestId(0)), Some(&BatchFailure::Aborted));
    assert!(session.is_renderer_available());

    let second = session.render_batch(&[RenderRequest::inline(0, "z")]);
    assert_eq!(second.markup(RequestId(0)), Some("<span>z</span>"));
    session.shutdown();
}

#[test]
fn setup_precedes_batches_and_carries_contribs() {
    let response = success(&[(7, "<span>ce</span>")]);
    let renderer = FakeRenderer::new(&[response.as_str()]);
    let config = SessionConfig {
        contribs: vec!["mhchem".to_string()],
        ..renderer.session_config(None)
    };

    let session = Session::start(config);
    let output = session.render_batch(&[RenderRequest::inline(7, "\\ce{H2O}")
        .with_option("throwOnError", false)]);
    assert!(output.is_rendered(RequestId(7)));
    session.shutdown();

    let received = renderer.received();
    assert_eq!(
        received.first().map(String::as_str),
        Some(r#"{"type":"setup","contribs":["mhchem"]}"#)
    );
    let batches = renderer.batches();
    assert_eq!(batches[0]["options"]["throwOnError"], false);
    assert!(batches[0]["items"][0].get("options").is_none());
}

#[test]
fn stray_output_line_retires_the_renderer() {
    let alpha = success(&[(0, "<span>alpha</span>")]);
    let beta = success(&[(0, "<span>beta</span>")]);
    let renderer = FakeRenderer::new(&[
        "Warning: katex version mismatch",
        alpha.as_str(),
        beta.as_str(),
    ]);
    let cache_dir = TempDir::new().expect("temp dir");
    let cache_path = cache_dir.path().join("cache.db");

    let session = Session::start(renderer.session_config(Some(&cache_path)));
    let first = session.render_batch(&[RenderRequest::inline(0, "\\alpha")]);
    assert_eq!(first.failure(RequestId(0)), Some(&BatchFailure::Aborted));
    assert!(!session.is_renderer_available());

    let second = session.render_batch(&[RenderRequest::inline(0, "\\beta")]);
    assert_eq!(second.markup(RequestId(0)), None);
    assert_eq!(second.failure(RequestId(0)), Some(&BatchFailure::Unavailable));

    let cache = session.cache().expect("cache open");
    assert!(cache.is_empty().expect("count"));
    session.shutdown();
    assert_eq!(renderer.batches().len(), 1);
}

#[test]
fn concurrent_batches_each_get_their_own_markup() {
    let renderer = FakeRenderer::echoing();
    let config = SessionConfig {
        chunk_size: NonZeroUsize::new(1).expect("non-zero"),
        ..renderer.session_config(None)
    };
    let session = Session::start(config);

    thread::scope(|scope| {
        let workers: Vec<_> = (0..4_u64)
            .map(|worker| {
                let session = &session;
                scope.spawn(move || {
                    let requests: Vec<RenderRequest> = (0..5)
                        .map(|id| RenderRequest::inline(id, format!("w{worker}f{id}")))
                        .collect();
                    (worker, session.render_batch(&requests))
                })
            })
            .collect();

        for handle in workers {
            let (worker, output) = handle.join().expect("worker thread");
            assert!(output.failed.is_empty(), "{:?}", output.failed);
            for id in 0..5 {
                let expected = format!("<span>w{worker}f{id}</span>");
                assert_eq!(output.markup(RequestId(id)), Some(expected.as_str()));
            }
        }
    });

    let stats = session.shutdown();
    assert_eq!(stats.round_trips, 20);
    assert_eq!(stats.formulas, 20);
    assert_eq!(renderer.batches().len(), 20, "one request line per reply");
}
