//! Stub report module for builds without the "diagnostics" feature.

/// No-op at-exit report when diagnostics is disabled
pub fn emit_report() {}
