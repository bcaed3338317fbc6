#![allow(dead_code)]

use std::{
    fs,
    os::unix::fs::PermissionsExt,
    path::{Path, PathBuf},
    time::Duration,
};

use katex_ssr::application::render::{RendererConfig, SessionConfig};
use tempfile::TempDir;

/// Shell renderer that logs every line it receives and answers each batch
/// with the next canned response. Once the responses run out it writes to
/// stderr and exits with status 3.
pub struct FakeRenderer {
    pub dir: TempDir,
    pub program: PathBuf,
    pub log: PathBuf,
}

impl FakeRenderer {
    pub fn new(responses: &[&str]) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let log = dir.path().join("received.log");
        let replies = dir.path().join("responses.jsonl");

        let mut body = String::new();
        for response in responses {
            body.push_str(response);
            body.push('\n');
        }
        fs::write(&replies, body).expect("write responses");

        let script = format!(
            r#"#!/bin/sh
exec 3< "{replies}"
while IFS= read -r line; do
  printf '%s\n' "$line" >> "{log}"
  case "$line" in
    *'"type":"setup"'*) continue ;;
  esac
  if IFS= read -r reply <&3; then
    printf '%s\n' "$reply"
  else
    echo 'renderer crashed: out of replies' >&2
    exit 3
  fi
done
"#,
            replies = replies.display(),
            log = log.display(),
        );
        Self::install(dir, log, &script)
    }

    /// Renderer that answers every single-item batch with
    /// `<span>{latex}</span>` for the id it was sent.
    pub fn echoing() -> Self {
        let dir = TempDir::new().expect("temp dir");
        let log = dir.path().join("received.log");
        let script = r#"#!/bin/sh
while IFS= read -r line; do
  printf '%s\n' "$line" >> "__LOG__"
  case "$line" in
    *'"type":"setup"'*) continue ;;
  esac
  printf '%s\n' "$line" | sed -E 's/.*"id":([0-9]+),"latex":"([^"]*)".*/{"status":"success","results":[{"id":\1,"status":"success","html":"<span>\2<\/span>"}]}/'
done
"#
        .replace("__LOG__", &log.display().to_string());

        Self::install(dir, log, &script)
    }

    fn install(dir: TempDir, log: PathBuf, script: &str) -> Self {
        let program = dir.path().join("renderer");
        fs::write(&program, script).expect("write script");
        let mut perms = fs::metadata(&program).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&program, perms).expect("set perms");

        Self { dir, program, log }
    }

    pub fn renderer_config(&self) -> RendererConfig {
        RendererConfig {
            program: self.program.clone(),
            args: Vec::new(),
            project_dir: None,
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    pub fn session_config(&self, cache_path: Option<&Path>) -> SessionConfig {
        SessionConfig {
            renderer: self.renderer_config(),
            cache_path: cache_path.map(Path::to_path_buf),
            ..SessionConfig::default()
        }
    }

    /// Every line the renderer received, setup included.
    pub fn received(&self) -> Vec<String> {
        fs::read_to_string(&self.log)
            .map(|text| text.lines().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Only the `render_batch` lines.
    pub fn batches(&self) -> Vec<serde_json::Value> {
        self.received()
            .iter()
            .filter(|line| line.contains(r#""type":"render_batch""#))
            .map(|line| serde_json::from_str(line).expect("batch line is json"))
            .collect()
    }
}

/// A success response for the given `(id, html)` pairs.
pub fn success(results: &[(u64, &str)]) -> String {
    let results: Vec<serde_json::Value> = results
        .iter()
        .map(|(id, html)| serde_json::json!({"id": id, "status": "success", "html": html}))
        .collect();
    serde_json::json!({"status": "success", "results": results}).to_string()
}
