//! Logging configuration and utilities for meshstore
//!
//! Provides structured logging for:
//! - Sync rounds and their state transitions
//! - Merge decisions (loss guard vs normal)
//! - Storage mode selection and store degradation
//! - Integrity checks on chunks and Merkle roots

use std::io;
use tracing::Span;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

use crate::config::LoggingConfig;

const DEFAULT_FILTER: &str = "info,meshstore=debug,sled=warn,hyper=warn,reqwest=warn";

/// Initialize the logging system with human readable output
pub fn init_logging() -> eyre::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!(version = crate::VERSION, "meshstore logging initialized");
    Ok(())
}

/// Initialize logging with JSON output for log shippers
pub fn init_json_logging() -> eyre::Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;

    tracing::info!("meshstore logging initialized with JSON format");
    Ok(())
}

/// Initialize logging from the `[logging]` section of the configuration
pub fn init_from_config(config: &LoggingConfig) -> eyre::Result<()> {
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", &config.level);
    }
    match config.format.as_str() {
        "json" => init_json_logging(),
        _ => init_logging(),
    }
}

/// Create a tracing span for one sync round
pub fn sync_span(country: &str, context_id: &str) -> Span {
    tracing::info_span!(
        "sync_round",
        country = %country,
        context_id = %context_id,
        phase = tracing::field::Empty,
        records = tracing::field::Empty,
        storage_mode = tracing::field::Empty,
        coalesced = tracing::field::Empty,
    )
}

/// Create a tracing span for store operations
pub fn store_span(operation: &str, key: &str) -> Span {
    tracing::debug_span!(
        "store_operation",
        operation = operation,
        key = %key,
        sinks_ok = tracing::field::Empty,
        bytes = tracing::field::Empty,
    )
}

/// Create a tracing span for chunk reconstruction
pub fn reconstruct_span(country: &str) -> Span {
    tracing::info_span!(
        "reconstruct",
        country = %country,
        local_chunks = tracing::field::Empty,
        pulled_chunks = tracing::field::Empty,
        verified = tracing::field::Empty,
        build = env!("BUILD_TIMESTAMP"),
    )
}

/// Structured logging for performance metrics
pub struct PerformanceLogger {
    start_time: std::time::Instant,
    operation: String,
}

impl PerformanceLogger {
    pub fn start(operation: &str) -> Self {
        tracing::debug!("Starting performance measurement for: {}", operation);
        Self {
            start_time: std::time::Instant::now(),
            operation: operation.to_string(),
        }
    }

    pub fn log_milestone(&self, milestone: &str) {
        let elapsed = self.start_time.elapsed();
        tracing::debug!(
            operation = %self.operation,
            milestone = milestone,
            elapsed_ms = elapsed.as_millis() as u64,
            "Performance milestone reached"
        );
    }

    pub fn finish(self) {
        let total_time = self.start_time.elapsed();
        tracing::info!(
            operation = %self.operation,
            total_time_ms = total_time.as_millis() as u64,
            "Performance measurement completed"
        );
    }
}

/// Log which merge branch reconciliation took
pub fn log_merge_decision(
    country: &str,
    branch: &str,
    local_count: usize,
    remote_count: usize,
    merged_count: usize,
    loss_ratio: f64,
) {
    if branch == "loss_guard" {
        tracing::warn!(
            country = country,
            branch = branch,
            local_count = local_count,
            remote_count = remote_count,
            merged_count = merged_count,
            loss_ratio = loss_ratio,
            "Remote dataset lost records, keeping local base"
        );
    } else {
        tracing::info!(
            country = country,
            branch = branch,
            local_count = local_count,
            remote_count = remote_count,
            merged_count = merged_count,
            "Datasets merged"
        );
    }
}

/// Log the storage mode chosen for a country
pub fn log_storage_mode(country: &str, mode: &str, records: usize, threshold: usize) {
    tracing::info!(
        country = country,
        mode = mode,
        records = records,
        threshold = threshold,
        "Storage mode selected"
    );
}

/// Log the result of an integrity check
pub fn log_integrity_check(country: &str, subject: &str, ok: bool, detail: Option<&str>) {
    if ok {
        tracing::debug!(country = country, subject = subject, "Integrity check passed");
    } else {
        tracing::error!(
            country = country,
            subject = subject,
            detail = detail,
            "Integrity check failed"
        );
    }
}

/// Custom macro for meshstore error logging
#[macro_export]
macro_rules! mesh_error {
    ($($arg:tt)*) => {
        tracing::error!(
            target: "meshstore",
            component = "core",
            $($arg)*
        )
    };
}

/// Custom macro for sync channel info logging
#[macro_export]
macro_rules! sync_info {
    ($($arg:tt)*) => {
        tracing::info!(
            target: "meshstore",
            component = "sync",
            $($arg)*
        )
    };
}

/// Custom macro for store warnings
#[macro_export]
macro_rules! store_warn {
    ($($arg:tt)*) => {
        tracing::warn!(
            target: "meshstore",
            component = "store",
            $($arg)*
        )
    };
}
