//! Build-time KaTeX rendering.
//!
//! A single long-lived renderer process serves every formula of a build over a
//! line-delimited JSON protocol, while a SQLite-backed cache keeps rendered
//! markup across builds.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
