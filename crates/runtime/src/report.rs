//! At-exit report
//!
//! Dumps fiber runtime KPIs at shutdown, controlled by the `FIBER_REPORT`
//! env var:
//! - Unset or `0` → no report
//! - `1` → human-readable to stderr
//! - `json` → JSON to stderr
//! - `json:/path` → JSON to file
//!
//! ## Feature Flag
//!
//! This module requires the `diagnostics` feature (enabled by default).

#![cfg(feature = "diagnostics")]

use crate::runtime::FiberRuntime;
use crate::stack_pool::StackPoolStats;
use fiber_core::AggregateFiberStats;
use fiber_core::thread_stats::stats_registry;
use std::io::Write;
use std::sync::OnceLock;

// =============================================================================
// Report Configuration (parsed from FIBER_REPORT env var)
// =============================================================================

/// Output format
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportFormat {
    Human,
    Json,
}

/// Output destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stderr,
    File(String),
}

/// Parsed report configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportConfig {
    pub format: ReportFormat,
    pub destination: ReportDestination,
}

impl ReportConfig {
    /// Parse from the FIBER_REPORT environment variable
    pub fn from_env() -> Option<Self> {
        Self::parse(&std::env::var("FIBER_REPORT").ok()?)
    }

    /// Parse a FIBER_REPORT value
    pub fn parse(val: &str) -> Option<Self> {
        match val {
            "" | "0" => None,
            "1" => Some(ReportConfig {
                format: ReportFormat::Human,
                destination: ReportDestination::Stderr,
            }),
            "json" => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::Stderr,
            }),
            s if s.starts_with("json:") => Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::File(s[5..].to_string()),
            }),
            _ => {
                tracing::warn!(value = val, "FIBER_REPORT not recognized, ignoring");
                None
            }
        }
    }
}

static REPORT_CONFIG: OnceLock<Option<ReportConfig>> = OnceLock::new();

fn get_report_config() -> &'static Option<ReportConfig> {
    REPORT_CONFIG.get_or_init(ReportConfig::from_env)
}

// =============================================================================
// Report Data
// =============================================================================

/// Collected metrics for the report
#[derive(Debug, Clone)]
pub struct ReportData {
    pub wall_clock_ms: u64,
    pub pool: StackPoolStats,
    pub registered_fibers: usize,
    pub threads: AggregateFiberStats,
}

fn collect_report_data(runtime: &FiberRuntime) -> ReportData {
    ReportData {
        wall_clock_ms: runtime.elapsed().as_millis() as u64,
        pool: runtime.pool().stats(),
        registered_fibers: runtime.registry().len(),
        threads: stats_registry().aggregate(),
    }
}

// =============================================================================
// Formatting
// =============================================================================

fn format_human(data: &ReportData) -> String {
    let mut out = String::new();
    out.push_str("=== FIBER REPORT ===\n");
    out.push_str(&format!("Wall clock:        {} ms\n", data.wall_clock_ms));
    out.push_str(&format!("Fibers created:    {}\n", data.threads.fibers_created));
    out.push_str(&format!("Fibers reused:     {}\n", data.threads.fibers_reused));
    out.push_str(&format!("Fibers terminated: {}\n", data.threads.fibers_terminated));
    out.push_str(&format!("Fibers registered: {}\n", data.registered_fibers));
    out.push_str(&format!("Idle cached:       {}\n", data.threads.idle_cached));
    out.push_str(&format!("Fiber threads:     {}\n", data.threads.active_threads));
    out.push_str(&format!("Stack slabs:       {}\n", data.pool.slabs));
    out.push_str(&format!("Stacks carved:     {}\n", data.pool.carved));
    out.push_str(&format!("Stacks in use:     {}\n", data.pool.in_use));
    out.push_str(&format!(
        "Stacks free:       {} ({} uncommitted)\n",
        data.pool.free, data.pool.uncommitted
    ));
    out.push_str(&format!(
        "Reserved:          {} bytes\n",
        data.pool.reserved_bytes
    ));
    out.push_str("====================\n");
    out
}

#[cfg(feature = "report-json")]
fn format_json(data: &ReportData) -> String {
    let threads = serde_json::json!({
        "active": data.threads.active_threads,
        "fibers_created": data.threads.fibers_created,
        "fibers_reused": data.threads.fibers_reused,
        "fibers_terminated": data.threads.fibers_terminated,
        "idle_cached": data.threads.idle_cached,
    });
    let obj = serde_json::json!({
        "wall_clock_ms": data.wall_clock_ms,
        "registered_fibers": data.registered_fibers,
        "stack_pool": data.pool,
        "threads": threads,
    });
    serde_json::to_string(&obj).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(not(feature = "report-json"))]
fn format_json(data: &ReportData) -> String {
    tracing::warn!(
        "FIBER_REPORT=json requires the 'report-json' feature, falling back to human format"
    );
    format_human(data)
}

// =============================================================================
// Emit
// =============================================================================

/// Write the report for `runtime` as `config` asks.
pub fn emit_report_for(runtime: &FiberRuntime, config: &ReportConfig) {
    let data = collect_report_data(runtime);

    let output = match config.format {
        ReportFormat::Human => format_human(&data),
        ReportFormat::Json => format_json(&data),
    };

    match &config.destination {
        ReportDestination::Stderr => {
            let _ = std::io::stderr().write_all(output.as_bytes());
        }
        ReportDestination::File(path) => {
            if let Ok(mut f) = std::fs::File::create(path) {
                let _ = f.write_all(output.as_bytes());
            } else {
                tracing::warn!(path = %path, "could not write fiber report, using stderr");
                let _ = std::io::stderr().write_all(output.as_bytes());
            }
        }
    }
}

/// Emit the report for the global runtime if FIBER_REPORT asks for one.
pub fn emit_report() {
    let Some(config) = get_report_config() else {
        return;
    };
    if let Some(runtime) = FiberRuntime::try_global() {
        emit_report_for(runtime, config);
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack_pool::tests::small_config;
    use crate::thread::{FiberThread, StackRequest};
    use serial_test::serial;
    use std::sync::Arc;

    fn sample() -> ReportData {
        ReportData {
            wall_clock_ms: 42,
            pool: StackPoolStats {
                stack_size: 16384,
                slabs: 1,
                capacity: 4,
                carved: 3,
                free: 2,
                uncommitted: 1,
                in_use: 1,
                reserved_bytes: 131072,
            },
            registered_fibers: 2,
            threads: AggregateFiberStats {
                active_threads: 1,
                fibers_created: 3,
                fibers_reused: 5,
                fibers_terminated: 7,
                idle_cached: 1,
                overflow_count: 0,
            },
        }
    }

    #[test]
    fn test_config_parse_variants() {
        assert_eq!(ReportConfig::parse("0"), None);
        assert_eq!(ReportConfig::parse(""), None);
        assert_eq!(ReportConfig::parse("bogus"), None);
        assert_eq!(
            ReportConfig::parse("1"),
            Some(ReportConfig {
                format: ReportFormat::Human,
                destination: ReportDestination::Stderr,
            })
        );
        assert_eq!(
            ReportConfig::parse("json"),
            Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::Stderr,
            })
        );
        assert_eq!(
            ReportConfig::parse("json:/tmp/report.json"),
            Some(ReportConfig {
                format: ReportFormat::Json,
                destination: ReportDestination::File("/tmp/report.json".to_string()),
            })
        );
    }

    #[test]
    fn test_format_human() {
        let output = format_human(&sample());
        assert!(output.contains("FIBER REPORT"));
        assert!(output.contains("42 ms"));
        assert!(output.contains("Fibers reused:     5"));
        assert!(output.contains("Stacks free:       2 (1 uncommitted)"));
    }

    #[cfg(feature = "report-json")]
    #[test]
    fn test_format_json() {
        let output = format_json(&sample());
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["wall_clock_ms"], 42);
        assert_eq!(value["stack_pool"]["in_use"], 1);
        assert_eq!(value["threads"]["fibers_terminated"], 7);
    }

    #[cfg(feature = "report-json")]
    #[test]
    fn test_emit_report_to_file() {
        let rt = Arc::new(FiberRuntime::new(small_config()).unwrap());
        let thread = FiberThread::attach(Arc::clone(&rt)).unwrap();
        let fiber = thread.create_fiber(StackRequest::Default, None).unwrap();
        thread.terminate(fiber);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let config = ReportConfig {
            format: ReportFormat::Json,
            destination: ReportDestination::File(path.to_string_lossy().into_owned()),
        };
        emit_report_for(&rt, &config);

        let text = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["registered_fibers"], 1);
        assert_eq!(value["stack_pool"]["carved"], 1);
    }

    #[test]
    #[serial]
    fn test_emit_report_noop_when_disabled() {
        emit_report();
    }
}
