//! Control layer exposing engine state to external tooling.

/// High-level control API over a registered engine.
pub mod api;
/// Ratatui-based developer console.
pub mod ui;
