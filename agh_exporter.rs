//! # AGH Exporter - AdGuard Home Query Log Metrics
//!
//! Tails the AdGuard Home `querylog.json` file, classifies every DNS query it
//! records and keeps rolling metrics that Prometheus can scrape.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              AGH EXPORTER                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │  notify → LOG TAILER → MetricsAggregator → TopHosts / LatencyWindow    │
//! │                              │                                          │
//! │                              └──→ ExporterMetrics ──→ /metrics (axum)   │
//! │                    LOG TAILER health ──────────────→ /livez             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Resumable tailing**: byte-offset tracking that survives rotation,
//!   truncation and transient I/O errors without double counting
//! - **Rolling latency**: global and per-upstream averages over a sliding window
//! - **Exact top-K**: bounded, heap-backed top hosts for allowed and blocked queries
//! - **Explicit registry**: every series lives in one [`ExporterMetrics`] object

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, VecDeque};
use std::ffi::OsString;
use std::fmt::{self, Debug, Formatter};
use std::fs::File;
use std::future::Future;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives - Parking Lot
// ----------------------------------------------------------------------------
use parking_lot::Mutex;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

// ----------------------------------------------------------------------------
// String & Hashing
// ----------------------------------------------------------------------------
use ahash::AHashMap;
use compact_str::CompactString;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::Utc;

// ----------------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------------
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;

// ----------------------------------------------------------------------------
// File Watching
// ----------------------------------------------------------------------------
use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::core::Collector as PrometheusCollector;
use prometheus::{
    Encoder, Gauge, GaugeVec, IntCounter, IntCounterVec, Opts, Registry as PrometheusRegistry,
    TextEncoder,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "agh-exporter";
pub const EXPORTER_FULL_NAME: &str = "AdGuard Home Query Log Exporter";

// ----------------------------------------------------------------------------
// Defaults
// ----------------------------------------------------------------------------

/// Where AdGuard Home writes its query log inside the official container
pub const DEFAULT_LOG_FILE_PATH: &str = "/opt/adguardhome/work/data/querylog.json";

/// Port serving /metrics, /livez and /readyz
pub const DEFAULT_METRICS_PORT: u16 = 8000;

/// Rolling latency window (seconds)
pub const DEFAULT_WINDOW_SECONDS: u64 = 300;

/// Size of each top-hosts view
pub const DEFAULT_TOP_K: usize = 100;

/// Grace period for the HTTP server to drain on shutdown (seconds)
pub const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

/// Initial capacity of the per-line read buffer
pub const LINE_BUFFER_CAPACITY: usize = 4096;

// ----------------------------------------------------------------------------
// Query Log Semantics
// ----------------------------------------------------------------------------

/// Upstream value substituted for records that carry none
pub const UNKNOWN_UPSTREAM: &str = "unknown";

/// AdGuard `Reason` code for a safe-search rewrite
pub const SAFE_SEARCH_REASON: &str = "7";

// ----------------------------------------------------------------------------
// Metric Names
// ----------------------------------------------------------------------------

pub const METRIC_DNS_QUERIES: &str = "agh_dns_queries_total";
pub const METRIC_BLOCKED_QUERIES: &str = "agh_blocked_dns_queries_total";
pub const METRIC_QUERY_TYPES: &str = "agh_dns_query_types_total";
pub const METRIC_TOP_QUERY_HOSTS: &str = "agh_dns_query_hosts_total";
pub const METRIC_TOP_BLOCKED_QUERY_HOSTS: &str = "agh_blocked_dns_query_hosts_total";
pub const METRIC_SAFE_SEARCH_HOSTS: &str = "agh_safe_search_enforced_hosts_total";
pub const METRIC_AVERAGE_RESPONSE_TIME: &str = "agh_dns_average_response_time";
pub const METRIC_AVERAGE_UPSTREAM_RESPONSE_TIME: &str = "agh_dns_average_upstream_response_time";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Query Log Record
// ----------------------------------------------------------------------------

/// One decoded line of the AdGuard Home query log.
///
/// Fields that are missing or carry the wrong JSON type decode to their zero
/// value instead of failing the line.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogRecord {
    /// Queried host (`QH`)
    pub host: CompactString,
    /// Query type such as `A` or `AAAA` (`QT`)
    pub query_type: CompactString,
    /// Resolution time in nanoseconds (`Elapsed`)
    pub elapsed_ns: f64,
    /// Whether filtering applied (`Result.IsFiltered`)
    pub is_filtered: bool,
    /// Stringified filtering reason (`Result.Reason`)
    pub reason: CompactString,
    /// Upstream resolver (`Upstream`)
    pub upstream: CompactString,
}

/// How a record is counted. The three classes are mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryClass {
    Allowed,
    Blocked,
    SafeSearchEnforced,
}

impl QueryLogRecord {
    /// Decode a single log line.
    pub fn decode(line: &[u8]) -> Result<Self, DecodeError> {
        let value: JsonValue = serde_json::from_slice(line)?;
        Self::from_json(&value)
    }

    /// Build a record from an already parsed JSON value.
    pub fn from_json(value: &JsonValue) -> Result<Self, DecodeError> {
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let string_field = |key: &str| {
            object
                .get(key)
                .and_then(JsonValue::as_str)
                .map(CompactString::from)
                .unwrap_or_default()
        };

        let result = object.get("Result").and_then(JsonValue::as_object);
        let is_filtered = result
            .and_then(|r| r.get("IsFiltered"))
            .and_then(JsonValue::as_bool)
            .unwrap_or(false);
        let reason = result
            .and_then(|r| r.get("Reason"))
            .map(stringify_scalar)
            .unwrap_or_default();

        Ok(Self {
            host: string_field("QH"),
            query_type: string_field("QT"),
            elapsed_ns: object
                .get("Elapsed")
                .and_then(JsonValue::as_f64)
                .unwrap_or(0.0),
            is_filtered,
            reason,
            upstream: string_field("Upstream"),
        })
    }

    /// Replace an absent upstream with [`UNKNOWN_UPSTREAM`].
    pub fn normalize(mut self) -> Self {
        if self.upstream.is_empty() {
            self.upstream = CompactString::from(UNKNOWN_UPSTREAM);
        }
        self
    }

    /// Resolution time in milliseconds.
    #[inline]
    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed_ns / 1_000_000.0
    }

    /// Classify the record. Safe-search takes precedence over a plain block.
    pub fn classification(&self) -> QueryClass {
        if self.is_filtered && self.reason.as_str() == SAFE_SEARCH_REASON {
            QueryClass::SafeSearchEnforced
        } else if self.is_filtered {
            QueryClass::Blocked
        } else {
            QueryClass::Allowed
        }
    }

    /// Whether this record's latency belongs in a per-upstream series.
    #[inline]
    pub fn has_known_upstream(&self) -> bool {
        is_known_upstream(&self.upstream)
    }
}

#[inline]
fn is_known_upstream(upstream: &str) -> bool {
    !upstream.is_empty() && upstream != UNKNOWN_UPSTREAM
}

/// Render a JSON scalar the way it would be printed as a plain value, so
/// that `7`, `7.0` and `"7"` all compare equal to `"7"`.
fn stringify_scalar(value: &JsonValue) -> CompactString {
    match value {
        JsonValue::String(s) => CompactString::from(s.as_str()),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                CompactString::from(i.to_string())
            } else if let Some(u) = n.as_u64() {
                CompactString::from(u.to_string())
            } else {
                match n.as_f64() {
                    Some(f) if f.is_finite() && f.fract() == 0.0 => {
                        CompactString::from(format!("{}", f as i64))
                    }
                    Some(f) => CompactString::from(f.to_string()),
                    None => CompactString::from(n.to_string()),
                }
            }
        }
        JsonValue::Bool(b) => CompactString::from(if *b { "true" } else { "false" }),
        JsonValue::Null => CompactString::default(),
        other => CompactString::from(other.to_string()),
    }
}

// ----------------------------------------------------------------------------
// 3.2 Time Samples
// ----------------------------------------------------------------------------

/// A latency observation stamped with wall-clock seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeSample {
    /// Unix timestamp (seconds)
    pub timestamp: i64,
    /// Latency in milliseconds
    pub value: f64,
}

impl TimeSample {
    #[inline]
    pub fn new(timestamp: i64, value: f64) -> Self {
        Self { timestamp, value }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Host Counts
// ----------------------------------------------------------------------------

/// A host and its total observed count, as reported by [`TopHosts::get_top`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostCount {
    pub host: CompactString,
    pub count: u64,
}

// ----------------------------------------------------------------------------
// 3.4 Clocks
// ----------------------------------------------------------------------------

/// Wall-clock source for sample timestamps and window cutoffs.
pub trait Clock: Send + Sync + Debug {
    /// Current unix time in whole seconds.
    fn now_secs(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> i64 {
        Utc::now().timestamp()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(secs: i64) -> Self {
        Self(AtomicI64::new(secs))
    }

    pub fn set(&self, secs: i64) {
        self.0.store(secs, AtomicOrdering::Release);
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, AtomicOrdering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_secs(&self) -> i64 {
        self.0.load(AtomicOrdering::Acquire)
    }
}

/// Unix time with millisecond precision, for `_created` gauges.
fn unix_now_f64() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1000.0
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Tail error: {0}")]
    Tail(#[from] TailError),

    #[error("Metrics registry error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Tail(e) => e.is_recoverable(),
            ExporterError::Metrics(_) => false,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Tail(_) => "tail",
            ExporterError::Metrics(_) => "metrics",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

// ----------------------------------------------------------------------------
// 4.2 Tailing Errors
// ----------------------------------------------------------------------------

/// Errors from reading or watching the query log.
#[derive(Error, Debug)]
pub enum TailError {
    #[error("Log file path has no file name: {path}")]
    InvalidPath { path: PathBuf },

    #[error("Failed to open log file {path}: {source}")]
    Open { path: PathBuf, source: io::Error },

    #[error("Failed to seek to offset {offset} in {path}: {source}")]
    Seek {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("Failed to read {path} at offset {offset}: {source}")]
    Read {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },

    #[error("File watcher error: {0}")]
    Watch(#[from] notify::Error),

    #[error("File watcher channel closed")]
    WatchClosed,
}

impl TailError {
    /// Everything but a closed watch channel is retried on the next event.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TailError::WatchClosed | TailError::InvalidPath { .. })
    }
}

// ----------------------------------------------------------------------------
// 4.3 Decode Errors
// ----------------------------------------------------------------------------

/// A single log line that could not be decoded.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("record is not a JSON object")]
    NotAnObject,
}

// ----------------------------------------------------------------------------
// 4.4 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    Parse { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Result type alias for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Layers, lowest precedence first:
// - built-in defaults
// - optional TOML file
// - bare environment variables (LOG_FILE_PATH, METRICS_PORT, LOG_LEVEL, ...)
// - AGH_EXPORTER_ prefixed environment variables
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Query log to tail
    #[serde(default = "default_log_file_path")]
    pub log_file_path: PathBuf,

    /// Port for the metrics and health endpoints
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Rolling latency window in seconds
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,

    /// Number of hosts kept in each top-hosts view
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Cap on distinct hosts counted per top-hosts view (unbounded if unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tracked_hosts: Option<usize>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            log_file_path: default_log_file_path(),
            metrics_port: default_metrics_port(),
            window_seconds: default_window_seconds(),
            top_k: default_top_k(),
            max_tracked_hosts: None,
            logging: LoggingConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration from defaults, an optional file and the environment
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment
            .merge(Env::raw().only(&[
                "LOG_FILE_PATH",
                "METRICS_PORT",
                "WINDOW_SECONDS",
                "TOP_K",
                "MAX_TRACKED_HOSTS",
            ]))
            .merge(Env::raw().only(&["LOG_LEVEL"]).map(|_| "logging.level".into()))
            .merge(Env::raw().only(&["LOG_FORMAT"]).map(|_| "logging.format".into()))
            .merge(Env::prefixed("AGH_EXPORTER_").split("__"));

        Self::extract(figment)
    }

    /// Load from a TOML string on top of the defaults (for testing)
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let figment = Figment::from(Serialized::defaults(Self::default())).merge(Toml::string(toml_str));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract().map_err(|e| ConfigError::Parse {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.log_file_path.as_os_str().is_empty() || self.log_file_path.file_name().is_none() {
            return Err(ConfigError::invalid_value(
                "log_file_path",
                format!("'{}' does not name a file", self.log_file_path.display()),
            ));
        }

        if self.metrics_port == 0 {
            return Err(ConfigError::invalid_value("metrics_port", "Port must be non-zero"));
        }

        if self.window_seconds == 0 {
            return Err(ConfigError::invalid_value(
                "window_seconds",
                "Window must be at least one second",
            ));
        }

        if self.top_k == 0 {
            return Err(ConfigError::invalid_value("top_k", "Top-K bound must be at least 1"));
        }

        if let Some(limit) = self.max_tracked_hosts {
            if limit <= self.top_k {
                return Err(ConfigError::invalid_value(
                    "max_tracked_hosts",
                    format!("Cap {} must exceed top_k {}", limit, self.top_k),
                ));
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Socket address the HTTP server binds to
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.metrics_port))
    }
}

fn default_log_file_path() -> PathBuf {
    PathBuf::from(DEFAULT_LOG_FILE_PATH)
}

fn default_metrics_port() -> u16 {
    DEFAULT_METRICS_PORT
}

fn default_window_seconds() -> u64 {
    DEFAULT_WINDOW_SECONDS
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

// ----------------------------------------------------------------------------
// 5.2 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = match config.format.as_str() {
        "json" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location)
                    .with_thread_names(true),
            ),
        ),
        "compact" => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            ),
        ),
        _ => tracing::subscriber::set_global_default(
            registry.with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            ),
        ),
    };
    installed.map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;

    info!(
        target: "agh_exporter::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: BOUNDED TOP-K HOSTS
// ============================================================================
// Exact top-K under +1 updates. Every host's total lives in a counter map;
// the K largest live in an indexed min-heap so that an in-heap host can be
// re-keyed in O(log K) and the minimum is always at the root.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Indexed Min-Heap
// ----------------------------------------------------------------------------

/// Binary min-heap on `count` with a host → slot index.
#[derive(Debug, Default)]
struct IndexedMinHeap {
    entries: Vec<HostCount>,
    positions: AHashMap<CompactString, usize>,
}

impl IndexedMinHeap {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            positions: AHashMap::with_capacity(capacity),
        }
    }

    #[inline]
    fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    fn peek_min(&self) -> Option<&HostCount> {
        self.entries.first()
    }

    #[inline]
    fn contains(&self, host: &str) -> bool {
        self.positions.contains_key(host)
    }

    fn push(&mut self, entry: HostCount) {
        let index = self.entries.len();
        self.positions.insert(entry.host.clone(), index);
        self.entries.push(entry);
        self.sift_up(index);
    }

    fn pop_min(&mut self) -> Option<HostCount> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.swap(0, last);
        let min = self.entries.pop()?;
        self.positions.remove(&min.host);
        if !self.entries.is_empty() {
            self.sift_down(0);
        }
        Some(min)
    }

    /// Re-key `host` if present. Returns false when the host is not in the heap.
    fn update(&mut self, host: &str, count: u64) -> bool {
        let Some(&index) = self.positions.get(host) else {
            return false;
        };
        self.entries[index].count = count;
        self.sift_down(index);
        self.sift_up(index);
        true
    }

    fn sift_up(&mut self, mut index: usize) {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.entries[index].count < self.entries[parent].count {
                self.swap(index, parent);
                index = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.entries.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;

            if left < len && self.entries[left].count < self.entries[smallest].count {
                smallest = left;
            }
            if right < len && self.entries[right].count < self.entries[smallest].count {
                smallest = right;
            }
            if smallest == index {
                break;
            }
            self.swap(index, smallest);
            index = smallest;
        }
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.entries.swap(a, b);
        if let Some(slot) = self.positions.get_mut(&self.entries[a].host) {
            *slot = a;
        }
        if let Some(slot) = self.positions.get_mut(&self.entries[b].host) {
            *slot = b;
        }
    }
}

// ----------------------------------------------------------------------------
// 7.2 Top Hosts
// ----------------------------------------------------------------------------

#[derive(Debug, Default)]
struct TopHostsInner {
    counter: AHashMap<CompactString, u64>,
    heap: IndexedMinHeap,
}

impl TopHostsInner {
    /// Forget the least-seen host that is not in the heap.
    fn evict_coldest(&mut self) {
        let coldest = self
            .counter
            .iter()
            .filter(|(host, _)| !self.heap.contains(host))
            .min_by_key(|(_, count)| **count)
            .map(|(host, _)| host.clone());

        if let Some(host) = coldest {
            self.counter.remove(&host);
        }
    }
}

/// Frequency counter with an exact bounded top-K view.
///
/// `add` and `get_top` are each atomic with respect to one another. Which of
/// several hosts tied at the minimum gets evicted is unspecified.
#[derive(Debug)]
pub struct TopHosts {
    capacity: usize,
    max_tracked: Option<usize>,
    inner: Mutex<TopHostsInner>,
}

impl TopHosts {
    /// Create a view of at most `capacity` hosts with an unbounded counter.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_tracked: None,
            inner: Mutex::new(TopHostsInner {
                counter: AHashMap::new(),
                heap: IndexedMinHeap::with_capacity(capacity),
            }),
        }
    }

    /// Cap the number of distinct hosts counted.
    ///
    /// When full, the least-seen host outside the heap is forgotten to make
    /// room, so counts are no longer exact for hosts that were dropped. The
    /// cap is raised to `capacity + 1` so that such a host always exists.
    /// Each new host on a full counter costs a linear scan.
    pub fn with_max_tracked(mut self, limit: Option<usize>) -> Self {
        self.max_tracked = limit.map(|l| l.max(self.capacity + 1));
        self
    }

    /// Record one observation of `host`.
    pub fn add(&self, host: &str) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let count = match inner.counter.get_mut(host) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => {
                if let Some(limit) = self.max_tracked {
                    if inner.counter.len() >= limit {
                        inner.evict_coldest();
                    }
                }
                inner.counter.insert(CompactString::from(host), 1);
                1
            }
        };

        if inner.heap.update(host, count) {
            return;
        }

        if inner.heap.len() < self.capacity {
            inner.heap.push(HostCount {
                host: CompactString::from(host),
                count,
            });
        } else if inner.heap.peek_min().map_or(false, |min| count > min.count) {
            inner.heap.pop_min();
            inner.heap.push(HostCount {
                host: CompactString::from(host),
                count,
            });
        }
    }

    /// Copy of the current top-K entries. Treat it as an unordered set.
    pub fn get_top(&self) -> Vec<HostCount> {
        self.inner.lock().heap.entries.clone()
    }

    /// Total observations of `host` (zero if never seen or forgotten).
    pub fn count(&self, host: &str) -> u64 {
        self.inner.lock().counter.get(host).copied().unwrap_or(0)
    }

    /// Number of distinct hosts currently counted.
    pub fn tracked_hosts(&self) -> usize {
        self.inner.lock().counter.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ============================================================================
// SECTION 8: METRIC REGISTRY
// ============================================================================
// All exposed series live in one ExporterMetrics value, built once at startup
// and shared with the aggregator (writer) and the HTTP layer (reader).
// Counters carry a companion `_created` gauge holding the unix time at which
// the series, or a labelled child, came into existence.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Counters With Creation Timestamps
// ----------------------------------------------------------------------------

fn created_name(counter_name: &str) -> String {
    format!(
        "{}_created",
        counter_name.strip_suffix("_total").unwrap_or(counter_name)
    )
}

fn created_help(help: &str) -> String {
    format!("{} (created timestamp)", help)
}

/// An unlabelled counter plus its `_created` gauge.
pub struct CreatedCounter {
    counter: IntCounter,
    created: Gauge,
}

impl CreatedCounter {
    pub fn new(name: &str, help: &str) -> Result<Self, prometheus::Error> {
        let counter = IntCounter::new(name, help)?;
        let created = Gauge::new(created_name(name), created_help(help))?;
        created.set(unix_now_f64());
        Ok(Self { counter, created })
    }

    #[inline]
    pub fn inc(&self) {
        self.counter.inc();
    }

    #[inline]
    pub fn get(&self) -> u64 {
        self.counter.get()
    }

    pub fn created(&self) -> f64 {
        self.created.get()
    }

    fn register(&self, registry: &PrometheusRegistry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.counter.clone()))?;
        registry.register(Box::new(self.created.clone()))
    }
}

impl Debug for CreatedCounter {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedCounter")
            .field("value", &self.counter.get())
            .field("created", &self.created.get())
            .finish()
    }
}

/// A labelled counter family plus a `_created` gauge per child.
pub struct CreatedCounterVec {
    counters: IntCounterVec,
    created: GaugeVec,
}

impl CreatedCounterVec {
    pub fn new(name: &str, help: &str, labels: &[&str]) -> Result<Self, prometheus::Error> {
        let counters = IntCounterVec::new(Opts::new(name, help), labels)?;
        let created = GaugeVec::new(Opts::new(created_name(name), created_help(help)), labels)?;
        Ok(Self { counters, created })
    }

    /// Child counter for `values`, stamping its creation time on first use.
    pub fn with_label_values(&self, values: &[&str]) -> IntCounter {
        let created = self.created.with_label_values(values);
        if created.get() == 0.0 {
            created.set(unix_now_f64());
        }
        self.counters.with_label_values(values)
    }

    /// Drop every child, counters and creation stamps alike.
    pub fn reset(&self) {
        self.counters.reset();
        self.created.reset();
    }

    /// Current value for `values`, without creating the child.
    pub fn value(&self, values: &[&str]) -> Option<u64> {
        collect_children(&self.counters)
            .into_iter()
            .find(|(labels, _)| labels.iter().map(String::as_str).eq(values.iter().copied()))
            .map(|(_, v)| v as u64)
    }

    /// Every child as (label values, value).
    pub fn children(&self) -> Vec<(Vec<String>, u64)> {
        collect_children(&self.counters)
            .into_iter()
            .map(|(labels, v)| (labels, v as u64))
            .collect()
    }

    fn register(&self, registry: &PrometheusRegistry) -> Result<(), prometheus::Error> {
        registry.register(Box::new(self.counters.clone()))?;
        registry.register(Box::new(self.created.clone()))
    }
}

impl Debug for CreatedCounterVec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CreatedCounterVec")
            .field("children", &self.children().len())
            .finish()
    }
}

/// Read (label values, value) pairs from a counter or gauge family.
pub fn collect_children<C: PrometheusCollector>(collector: &C) -> Vec<(Vec<String>, f64)> {
    collector
        .collect()
        .iter()
        .flat_map(|family| family.get_metric().iter())
        .map(|metric| {
            let labels = metric
                .get_label()
                .iter()
                .map(|pair| pair.get_value().to_string())
                .collect();
            let value = if metric.has_counter() {
                metric.get_counter().get_value()
            } else {
                metric.get_gauge().get_value()
            };
            (labels, value)
        })
        .collect()
}

// ----------------------------------------------------------------------------
// 8.2 Exporter Metrics
// ----------------------------------------------------------------------------

/// Every series the exporter exposes, registered in a private registry.
pub struct ExporterMetrics {
    registry: PrometheusRegistry,
    pub dns_queries: CreatedCounter,
    pub blocked_queries: CreatedCounter,
    pub query_types: CreatedCounterVec,
    pub top_query_hosts: CreatedCounterVec,
    pub top_blocked_query_hosts: CreatedCounterVec,
    pub safe_search_enforced_hosts: CreatedCounterVec,
    pub average_response_time: Gauge,
    pub average_upstream_response_time: GaugeVec,
}

impl ExporterMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = PrometheusRegistry::new();

        let dns_queries = CreatedCounter::new(METRIC_DNS_QUERIES, "Total number of DNS queries")?;
        let blocked_queries =
            CreatedCounter::new(METRIC_BLOCKED_QUERIES, "Total number of blocked DNS queries")?;
        let query_types =
            CreatedCounterVec::new(METRIC_QUERY_TYPES, "Types of DNS queries", &["query_type"])?;
        let top_query_hosts =
            CreatedCounterVec::new(METRIC_TOP_QUERY_HOSTS, "Top DNS query hosts", &["host"])?;
        let top_blocked_query_hosts = CreatedCounterVec::new(
            METRIC_TOP_BLOCKED_QUERY_HOSTS,
            "Top blocked DNS query hosts",
            &["host"],
        )?;
        let safe_search_enforced_hosts = CreatedCounterVec::new(
            METRIC_SAFE_SEARCH_HOSTS,
            "Safe search enforced hosts",
            &["host"],
        )?;
        let average_response_time = Gauge::new(
            METRIC_AVERAGE_RESPONSE_TIME,
            "Average response time for DNS queries in milliseconds",
        )?;
        let average_upstream_response_time = GaugeVec::new(
            Opts::new(
                METRIC_AVERAGE_UPSTREAM_RESPONSE_TIME,
                "Average response time by upstream server",
            ),
            &["server"],
        )?;

        dns_queries.register(&registry)?;
        blocked_queries.register(&registry)?;
        query_types.register(&registry)?;
        top_query_hosts.register(&registry)?;
        top_blocked_query_hosts.register(&registry)?;
        safe_search_enforced_hosts.register(&registry)?;
        registry.register(Box::new(average_response_time.clone()))?;
        registry.register(Box::new(average_upstream_response_time.clone()))?;

        #[cfg(target_os = "linux")]
        registry.register(Box::new(
            prometheus::process_collector::ProcessCollector::for_self(),
        ))?;

        Ok(Self {
            registry,
            dns_queries,
            blocked_queries,
            query_types,
            top_query_hosts,
            top_blocked_query_hosts,
            safe_search_enforced_hosts,
            average_response_time,
            average_upstream_response_time,
        })
    }

    pub fn registry(&self) -> &PrometheusRegistry {
        &self.registry
    }

    /// Encode every registered family in the Prometheus text format.
    pub fn encode_text(&self) -> ExporterResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| ExporterError::Internal(format!("Metrics output is not UTF-8: {}", e)))
    }

    /// Exposed average latency for `server`, if that child exists.
    pub fn upstream_average(&self, server: &str) -> Option<f64> {
        collect_children(&self.average_upstream_response_time)
            .into_iter()
            .find(|(labels, _)| labels.len() == 1 && labels[0] == server)
            .map(|(_, v)| v)
    }

    /// Every upstream that has an exposed average.
    pub fn upstream_servers(&self) -> Vec<String> {
        collect_children(&self.average_upstream_response_time)
            .into_iter()
            .filter_map(|(mut labels, _)| labels.pop())
            .collect()
    }
}

impl Debug for ExporterMetrics {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterMetrics")
            .field("dns_queries", &self.dns_queries)
            .field("blocked_queries", &self.blocked_queries)
            .field("average_response_time", &self.average_response_time.get())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 9: METRICS AGGREGATOR
// ============================================================================
// Classifies each record, keeps the rolling latency window and publishes the
// top-hosts views. Every record ends with a full metrics refresh.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Record Sink
// ----------------------------------------------------------------------------

/// Downstream consumer of decoded, normalized query log records.
pub trait RecordSink: Send + Sync {
    fn record(&self, record: QueryLogRecord);
}

// ----------------------------------------------------------------------------
// 9.2 Latency Window
// ----------------------------------------------------------------------------

/// Global and per-upstream latency samples.
///
/// After `prune(cutoff)` every retained sample has `timestamp > cutoff`.
#[derive(Debug, Default)]
struct LatencyWindow {
    global: VecDeque<TimeSample>,
    upstreams: AHashMap<CompactString, VecDeque<TimeSample>>,
}

impl LatencyWindow {
    fn push(&mut self, upstream: &str, sample: TimeSample) {
        self.global.push_back(sample);
        if is_known_upstream(upstream) {
            self.upstreams
                .entry(CompactString::from(upstream))
                .or_default()
                .push_back(sample);
        }
    }

    fn prune(&mut self, cutoff: i64) {
        self.global.retain(|s| s.timestamp > cutoff);
        self.upstreams.retain(|_, samples| {
            samples.retain(|s| s.timestamp > cutoff);
            !samples.is_empty()
        });
    }
}

fn average(samples: &VecDeque<TimeSample>) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    let sum: f64 = samples.iter().map(|s| s.value).sum();
    Some(sum / samples.len() as f64)
}

/// Point-in-time view of the latency window.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WindowSnapshot {
    pub global_samples: usize,
    pub global_average_ms: Option<f64>,
    pub upstream_averages_ms: BTreeMap<CompactString, f64>,
}

// ----------------------------------------------------------------------------
// 9.3 Aggregator Options
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AggregatorOptions {
    pub window_seconds: u64,
    pub top_k: usize,
    pub max_tracked_hosts: Option<usize>,
}

impl Default for AggregatorOptions {
    fn default() -> Self {
        Self {
            window_seconds: DEFAULT_WINDOW_SECONDS,
            top_k: DEFAULT_TOP_K,
            max_tracked_hosts: None,
        }
    }
}

impl From<&ExporterConfig> for AggregatorOptions {
    fn from(config: &ExporterConfig) -> Self {
        Self {
            window_seconds: config.window_seconds,
            top_k: config.top_k,
            max_tracked_hosts: config.max_tracked_hosts,
        }
    }
}

// ----------------------------------------------------------------------------
// 9.4 Aggregator
// ----------------------------------------------------------------------------

/// Turns query log records into exporter metrics.
#[derive(Debug)]
pub struct MetricsAggregator {
    metrics: Arc<ExporterMetrics>,
    top_hosts: TopHosts,
    top_blocked_hosts: TopHosts,
    window: Mutex<LatencyWindow>,
    window_seconds: i64,
    clock: Arc<dyn Clock>,
}

impl MetricsAggregator {
    pub fn new(metrics: Arc<ExporterMetrics>, options: AggregatorOptions) -> Self {
        Self {
            metrics,
            top_hosts: TopHosts::new(options.top_k).with_max_tracked(options.max_tracked_hosts),
            top_blocked_hosts: TopHosts::new(options.top_k)
                .with_max_tracked(options.max_tracked_hosts),
            window: Mutex::new(LatencyWindow::default()),
            window_seconds: i64::try_from(options.window_seconds).unwrap_or(i64::MAX),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &Arc<ExporterMetrics> {
        &self.metrics
    }

    /// Count one record and refresh every derived metric.
    pub fn update_metrics(&self, record: &QueryLogRecord) {
        let now = self.clock.now_secs();
        let metrics = &self.metrics;

        metrics.dns_queries.inc();
        metrics
            .query_types
            .with_label_values(&[record.query_type.as_str()])
            .inc();

        if !record.is_filtered {
            self.top_hosts.add(&record.host);
        }

        self.window
            .lock()
            .push(&record.upstream, TimeSample::new(now, record.elapsed_ms()));

        match record.classification() {
            QueryClass::SafeSearchEnforced => {
                metrics
                    .safe_search_enforced_hosts
                    .with_label_values(&[record.host.as_str()])
                    .inc();
            }
            QueryClass::Blocked => {
                metrics.blocked_queries.inc();
                self.top_blocked_hosts.add(&record.host);
            }
            QueryClass::Allowed => {}
        }

        self.process_metrics_at(now);
    }

    /// Republish top hosts, prune the window and recompute the averages.
    pub fn process_metrics(&self) {
        self.process_metrics_at(self.clock.now_secs());
    }

    fn process_metrics_at(&self, now: i64) {
        publish_top(&self.metrics.top_query_hosts, &self.top_hosts);
        publish_top(&self.metrics.top_blocked_query_hosts, &self.top_blocked_hosts);

        let cutoff = now.saturating_sub(self.window_seconds);
        let mut window = self.window.lock();
        window.prune(cutoff);

        if let Some(avg) = average(&window.global) {
            self.metrics.average_response_time.set(avg);
        }

        for (upstream, samples) in &window.upstreams {
            if let Some(avg) = average(samples) {
                self.metrics
                    .average_upstream_response_time
                    .with_label_values(&[upstream.as_str()])
                    .set(avg);
            }
        }
    }

    pub fn top_hosts(&self) -> Vec<HostCount> {
        self.top_hosts.get_top()
    }

    pub fn top_blocked_hosts(&self) -> Vec<HostCount> {
        self.top_blocked_hosts.get_top()
    }

    /// Current window contents, as of the last refresh.
    pub fn snapshot(&self) -> WindowSnapshot {
        let window = self.window.lock();
        WindowSnapshot {
            global_samples: window.global.len(),
            global_average_ms: average(&window.global),
            upstream_averages_ms: window
                .upstreams
                .iter()
                .filter_map(|(upstream, samples)| average(samples).map(|avg| (upstream.clone(), avg)))
                .collect(),
        }
    }
}

fn publish_top(series: &CreatedCounterVec, top: &TopHosts) {
    series.reset();
    for entry in top.get_top() {
        series
            .with_label_values(&[entry.host.as_str()])
            .inc_by(entry.count);
    }
}

impl RecordSink for MetricsAggregator {
    fn record(&self, record: QueryLogRecord) {
        self.update_metrics(&record);
    }
}

// ============================================================================
// SECTION 10: LOG TAILER
// ============================================================================
// Tails the query log from a remembered byte offset:
// - only complete lines are consumed, a partial tail waits for its newline
// - open/seek failures freeze the offset and mark the tailer unhealthy
// - undecodable lines are logged and skipped
// - a create event (rotation) or in-place truncation restarts at offset 0
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Tailer State
// ----------------------------------------------------------------------------

/// Where the tailer stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TailerPhase {
    /// The log file has not been read yet
    WaitingForFile,
    /// The last read succeeded
    Tailing,
    /// The last read failed; the offset is frozen until the next success
    Degraded,
}

#[derive(Debug)]
struct TailCursor {
    offset: u64,
    file_seen: bool,
}

/// Summary of one `process_new_lines` pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TailBatch {
    /// Records handed to the sink
    pub records: u64,
    /// Lines that failed to decode
    pub skipped: u64,
    /// Bytes consumed
    pub bytes: u64,
    /// Offset after the pass
    pub offset: u64,
}

/// What a filesystem event means for the tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileEvent {
    Written,
    Created,
    Ignored,
}

fn classify_event(kind: &EventKind) -> FileEvent {
    match kind {
        EventKind::Create(_) => FileEvent::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::To | RenameMode::Both)) => {
            FileEvent::Created
        }
        EventKind::Modify(ModifyKind::Name(_) | ModifyKind::Metadata(_)) => FileEvent::Ignored,
        EventKind::Modify(_) => FileEvent::Written,
        _ => FileEvent::Ignored,
    }
}

fn trim_line_ending(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

// ----------------------------------------------------------------------------
// 10.2 Log Tailer
// ----------------------------------------------------------------------------

/// Incremental reader of an append-only query log.
pub struct LogTailer {
    path: PathBuf,
    file_name: OsString,
    sink: Arc<dyn RecordSink>,
    cursor: Mutex<TailCursor>,
    healthy: Mutex<bool>,
}

impl LogTailer {
    pub fn new(path: impl Into<PathBuf>, sink: Arc<dyn RecordSink>) -> Result<Self, TailError> {
        let path = path.into();
        let file_name = path
            .file_name()
            .map(OsString::from)
            .ok_or_else(|| TailError::InvalidPath { path: path.clone() })?;

        Ok(Self {
            path,
            file_name,
            sink,
            cursor: Mutex::new(TailCursor {
                offset: 0,
                file_seen: false,
            }),
            healthy: Mutex::new(true),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Directory whose events are watched.
    pub fn watch_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    pub fn is_healthy(&self) -> bool {
        *self.healthy.lock()
    }

    pub fn offset(&self) -> u64 {
        self.cursor.lock().offset
    }

    pub fn phase(&self) -> TailerPhase {
        let file_seen = self.cursor.lock().file_seen;
        match (file_seen, self.is_healthy()) {
            (false, _) => TailerPhase::WaitingForFile,
            (true, true) => TailerPhase::Tailing,
            (true, false) => TailerPhase::Degraded,
        }
    }

    fn set_healthy(&self, healthy: bool) {
        *self.healthy.lock() = healthy;
    }

    /// Read whatever the file already holds. Returns false if it does not exist yet.
    pub fn initial_load(&self) -> bool {
        if !self.path.exists() {
            info!(target: "agh_exporter::tailer", path = %self.path.display(), "Waiting for log file");
            return false;
        }

        info!(target: "agh_exporter::tailer", path = %self.path.display(), "Loading existing log file");
        self.cursor.lock().file_seen = true;
        // Failures are logged and reflected in health.
        let _ = self.process_new_lines();
        true
    }

    /// Consume every complete line past the stored offset.
    pub fn process_new_lines(&self) -> Result<TailBatch, TailError> {
        let mut cursor = self.cursor.lock();
        let result = self.read_from(&mut cursor);

        match &result {
            Ok(batch) => {
                cursor.file_seen = true;
                self.set_healthy(true);
                debug!(
                    target: "agh_exporter::tailer",
                    records = batch.records,
                    skipped = batch.skipped,
                    bytes = batch.bytes,
                    offset = batch.offset,
                    "Processed new log lines"
                );
            }
            Err(err) => {
                self.set_healthy(false);
                error!(
                    target: "agh_exporter::tailer",
                    error = %err,
                    offset = cursor.offset,
                    "Failed to read log file"
                );
            }
        }

        result
    }

    fn read_from(&self, cursor: &mut TailCursor) -> Result<TailBatch, TailError> {
        let file = File::open(&self.path).map_err(|source| TailError::Open {
            path: self.path.clone(),
            source,
        })?;
        let len = file
            .metadata()
            .map_err(|source| TailError::Open {
                path: self.path.clone(),
                source,
            })?
            .len();

        if len < cursor.offset {
            warn!(
                target: "agh_exporter::tailer",
                path = %self.path.display(),
                previous_offset = cursor.offset,
                current_size = len,
                "Log file truncated; restarting from the beginning"
            );
            cursor.offset = 0;
        }

        let mut reader = BufReader::new(file);
        reader
            .seek(SeekFrom::Start(cursor.offset))
            .map_err(|source| TailError::Seek {
                path: self.path.clone(),
                offset: cursor.offset,
                source,
            })?;

        let mut batch = TailBatch::default();
        let mut line = Vec::with_capacity(LINE_BUFFER_CAPACITY);

        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|source| TailError::Read {
                    path: self.path.clone(),
                    offset: cursor.offset,
                    source,
                })?;

            // EOF, or a line still being written
            if read == 0 || line.last() != Some(&b'\n') {
                break;
            }

            cursor.offset += read as u64;
            batch.bytes += read as u64;
            self.dispatch_line(&line, &mut batch);
        }

        batch.offset = cursor.offset;
        Ok(batch)
    }

    fn dispatch_line(&self, raw: &[u8], batch: &mut TailBatch) {
        let line = trim_line_ending(raw);
        if line.iter().all(u8::is_ascii_whitespace) {
            return;
        }

        match QueryLogRecord::decode(line) {
            Ok(record) => {
                self.sink.record(record.normalize());
                batch.records += 1;
            }
            Err(err) => {
                batch.skipped += 1;
                warn!(
                    target: "agh_exporter::tailer",
                    error = %err,
                    "Skipping undecodable log line"
                );
            }
        }
    }

    /// Apply one filesystem event. Returns `None` when the event was ignored.
    pub fn handle_event(&self, event: &Event) -> Option<Result<TailBatch, TailError>> {
        // For a two-path rename only the destination can become the tracked file.
        let paths: &[PathBuf] = match event.kind {
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
                event.paths.get(1..).unwrap_or(&[])
            }
            _ => &event.paths,
        };
        if !paths
            .iter()
            .any(|p| p.file_name() == Some(self.file_name.as_os_str()))
        {
            return None;
        }

        match classify_event(&event.kind) {
            FileEvent::Written => Some(self.process_new_lines()),
            FileEvent::Created => {
                info!(target: "agh_exporter::tailer", path = %self.path.display(), "Log file created");
                {
                    let mut cursor = self.cursor.lock();
                    cursor.file_seen = true;
                    cursor.offset = 0;
                }
                Some(self.process_new_lines())
            }
            FileEvent::Ignored => None,
        }
    }

    /// Watch the containing directory until the notification stream closes.
    ///
    /// Events are applied one at a time. This only ever returns an error;
    /// `TailError::WatchClosed` means no further events will arrive.
    pub async fn watch(self: Arc<Self>) -> Result<(), TailError> {
        let (tx, rx) = mpsc::unbounded_channel::<notify::Result<Event>>();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = tx.send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(self.watch_dir(), RecursiveMode::NonRecursive)?;

        info!(
            target: "agh_exporter::tailer",
            dir = %self.watch_dir().display(),
            file = %self.path.display(),
            "Watching for log changes"
        );

        let result = Arc::clone(&self).drive_events(rx).await;
        drop(watcher);
        result
    }

    /// Apply notification results from `rx` until every sender is gone.
    ///
    /// A notification error marks the tailer unhealthy and the loop goes on.
    pub async fn drive_events(
        self: Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    ) -> Result<(), TailError> {
        while let Some(res) = rx.recv().await {
            match res {
                Ok(event) => {
                    let tailer = Arc::clone(&self);
                    if let Err(err) = task::spawn_blocking(move || tailer.handle_event(&event)).await {
                        self.set_healthy(false);
                        error!(target: "agh_exporter::tailer", error = %err, "Log processing task failed");
                    }
                }
                Err(err) => {
                    self.set_healthy(false);
                    error!(target: "agh_exporter::tailer", error = %err, "File watcher error");
                }
            }
        }

        Err(TailError::WatchClosed)
    }
}

impl Debug for LogTailer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogTailer")
            .field("path", &self.path)
            .field("offset", &self.offset())
            .field("healthy", &self.is_healthy())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// SECTION 11: HTTP EXPOSITION
// ============================================================================

/// Shared state for the HTTP handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub metrics: Arc<ExporterMetrics>,
    pub tailer: Arc<LogTailer>,
}

/// `/metrics`, `/livez` and `/readyz`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/livez", get(livez_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state)
}

async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics.encode_text() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(target: "agh_exporter::server", error = %err, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

async fn livez_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.tailer.is_healthy() {
        (StatusCode::OK, "Alive")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Unhealthy")
    }
}

async fn readyz_handler() -> (StatusCode, &'static str) {
    (StatusCode::OK, "Ready")
}

/// Serve the router on `addr` until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, state: AppState, shutdown: F) -> ExporterResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TokioTcpListener::bind(addr).await?;
    info!(target: "agh_exporter::server", %addr, "Starting metrics server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============================================================================
// SECTION 12: EXPORTER RUNTIME
// ============================================================================

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(target: "agh_exporter::runtime", error = %err, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(target: "agh_exporter::runtime", error = %err, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "agh_exporter::runtime", "Received SIGINT"),
        _ = terminate => info!(target: "agh_exporter::runtime", "Received SIGTERM"),
    }
}

/// Wire the tailer, aggregator and HTTP server together and run until a
/// shutdown signal arrives or the file watcher dies.
pub async fn run(config: ExporterConfig) -> ExporterResult<()> {
    let metrics = Arc::new(ExporterMetrics::new()?);
    let aggregator = Arc::new(MetricsAggregator::new(
        Arc::clone(&metrics),
        AggregatorOptions::from(&config),
    ));
    let tailer = Arc::new(LogTailer::new(&config.log_file_path, aggregator)?);

    tailer.initial_load();

    let mut watch_task = tokio::spawn(Arc::clone(&tailer).watch());

    let server_shutdown = CancellationToken::new();
    let mut server_task = {
        let token = server_shutdown.clone();
        let state = AppState {
            metrics: Arc::clone(&metrics),
            tailer: Arc::clone(&tailer),
        };
        tokio::spawn(serve(config.listen_addr(), state, async move {
            token.cancelled().await
        }))
    };

    let outcome = tokio::select! {
        watched = &mut watch_task => {
            match watched {
                Ok(Err(err)) => Err(ExporterError::Tail(err)),
                Ok(Ok(())) => Err(ExporterError::Tail(TailError::WatchClosed)),
                Err(err) => Err(ExporterError::Internal(format!("Watch task failed: {}", err))),
            }
        }
        served = &mut server_task => {
            watch_task.abort();
            return match served {
                Ok(result) => result,
                Err(err) => Err(ExporterError::Internal(format!("Server task failed: {}", err))),
            };
        }
        _ = shutdown_signal() => {
            info!(target: "agh_exporter::runtime", "Shutting down the server...");
            watch_task.abort();
            Ok(())
        }
    };

    server_shutdown.cancel();
    match timeout(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS), server_task).await {
        Ok(Ok(Err(err))) => {
            error!(target: "agh_exporter::runtime", error = %err, "Server stopped with an error");
        }
        Ok(_) => {}
        Err(_) => {
            warn!(target: "agh_exporter::runtime", "Server forced to shutdown");
        }
    }

    if outcome.is_ok() {
        info!(target: "agh_exporter::runtime", "Server exiting");
    }
    outcome
}

// ============================================================================
// TESTS: RECORDS, CONFIGURATION & ERRORS
// ============================================================================

#[cfg(test)]
mod phase1_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn test_decode_full_record() {
        let line = json!({
            "QH": "example.com",
            "QT": "AAAA",
            "Elapsed": 2_500_000,
            "Upstream": "tls://1.1.1.1",
            "Result": {"IsFiltered": true, "Reason": 3}
        })
        .to_string();

        let record = QueryLogRecord::decode(line.as_bytes()).unwrap();
        assert_eq!(record.host.as_str(), "example.com");
        assert_eq!(record.query_type.as_str(), "AAAA");
        assert_eq!(record.upstream.as_str(), "tls://1.1.1.1");
        assert_eq!(record.reason.as_str(), "3");
        assert!(record.is_filtered);
        assert!((record.elapsed_ms() - 2.5).abs() < 1e-9);
        assert_eq!(record.classification(), QueryClass::Blocked);
    }

    #[test]
    fn test_decode_is_lenient_about_fields() {
        let line = br#"{"QH": 42, "Elapsed": "slow", "Result": "nope", "Extra": [1, 2]}"#;
        let record = QueryLogRecord::decode(line).unwrap();

        assert_eq!(record.host.as_str(), "");
        assert_eq!(record.query_type.as_str(), "");
        assert_eq!(record.elapsed_ns, 0.0);
        assert!(!record.is_filtered);
        assert_eq!(record.reason.as_str(), "");
        assert_eq!(record.upstream.as_str(), "");
        assert_eq!(record.classification(), QueryClass::Allowed);
    }

    #[test]
    fn test_decode_rejects_bad_lines() {
        assert!(matches!(
            QueryLogRecord::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            QueryLogRecord::decode(b"[1, 2, 3]"),
            Err(DecodeError::NotAnObject)
        ));
    }

    #[rstest]
    #[case(json!(7), "7")]
    #[case(json!("7"), "7")]
    #[case(json!(7.0), "7")]
    #[case(json!(3.5), "3.5")]
    #[case(json!(true), "true")]
    #[case(json!(null), "")]
    fn test_reason_stringification(#[case] reason: JsonValue, #[case] expected: &str) {
        let value = json!({"QH": "a.com", "Result": {"IsFiltered": true, "Reason": reason}});
        let record = QueryLogRecord::from_json(&value).unwrap();
        assert_eq!(record.reason.as_str(), expected);
    }

    #[rstest]
    #[case(false, json!(7), QueryClass::Allowed)]
    #[case(false, json!(3), QueryClass::Allowed)]
    #[case(true, json!(3), QueryClass::Blocked)]
    #[case(true, json!(7), QueryClass::SafeSearchEnforced)]
    #[case(true, json!("7"), QueryClass::SafeSearchEnforced)]
    fn test_classification(
        #[case] filtered: bool,
        #[case] reason: JsonValue,
        #[case] expected: QueryClass,
    ) {
        let value = json!({"QH": "a.com", "Result": {"IsFiltered": filtered, "Reason": reason}});
        let record = QueryLogRecord::from_json(&value).unwrap();
        assert_eq!(record.classification(), expected);
    }

    #[test]
    fn test_normalize_fills_missing_upstream() {
        let record = QueryLogRecord::decode(br#"{"QH": "a.com"}"#).unwrap().normalize();
        assert_eq!(record.upstream.as_str(), UNKNOWN_UPSTREAM);
        assert!(!record.has_known_upstream());

        let record = QueryLogRecord::decode(br#"{"QH": "a.com", "Upstream": "8.8.8.8"}"#)
            .unwrap()
            .normalize();
        assert_eq!(record.upstream.as_str(), "8.8.8.8");
        assert!(record.has_known_upstream());
    }

    #[test]
    fn test_default_config() {
        let config = ExporterConfig::default();
        assert_eq!(config.log_file_path, PathBuf::from(DEFAULT_LOG_FILE_PATH));
        assert_eq!(config.metrics_port, 8000);
        assert_eq!(config.window_seconds, 300);
        assert_eq!(config.top_k, 100);
        assert_eq!(config.max_tracked_hosts, None);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ExporterConfig::from_toml_str(
            r#"
            log_file_path = "/tmp/querylog.json"
            metrics_port = 9617
            top_k = 10
            max_tracked_hosts = 5000

            [logging]
            level = "debug"
            format = "json"
            "#,
        )
        .unwrap();

        assert_eq!(config.log_file_path, PathBuf::from("/tmp/querylog.json"));
        assert_eq!(config.metrics_port, 9617);
        assert_eq!(config.window_seconds, DEFAULT_WINDOW_SECONDS);
        assert_eq!(config.top_k, 10);
        assert_eq!(config.max_tracked_hosts, Some(5000));
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.listen_addr().port(), 9617);
    }

    #[rstest]
    #[case("window_seconds = 0", "window_seconds")]
    #[case("top_k = 0", "top_k")]
    #[case("metrics_port = 0", "metrics_port")]
    #[case("log_file_path = \"/\"", "log_file_path")]
    #[case("top_k = 10\nmax_tracked_hosts = 5", "max_tracked_hosts")]
    #[case("top_k = 10\nmax_tracked_hosts = 10", "max_tracked_hosts")]
    fn test_config_validation_rejects(#[case] toml_str: &str, #[case] field: &str) {
        match ExporterConfig::from_toml_str(toml_str) {
            Err(ConfigError::InvalidValue { field: f, .. }) => assert_eq!(f, field),
            other => panic!("expected invalid {}, got {:?}", field, other),
        }
    }

    #[test]
    fn test_config_parse_error() {
        assert!(matches!(
            ExporterConfig::from_toml_str("metrics_port = \"eighty\""),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_missing_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(matches!(
            ExporterConfig::load(Some(&path)),
            Err(ConfigError::FileNotFound { .. })
        ));
    }

    #[test]
    fn test_generated_config_parses_back() {
        let generated = ExporterConfig::generate_default_config();
        assert!(generated.contains("metrics_port = 8000"));
        let parsed = ExporterConfig::from_toml_str(&generated).unwrap();
        assert_eq!(parsed, ExporterConfig::default());
    }

    #[test]
    fn test_created_name() {
        assert_eq!(created_name("agh_dns_queries_total"), "agh_dns_queries_created");
        assert_eq!(created_name("agh_things"), "agh_things_created");
    }

    #[test]
    fn test_error_categories() {
        let err = ExporterError::from(TailError::WatchClosed);
        assert_eq!(err.category(), "tail");
        assert!(!err.is_recoverable());

        let err = ExporterError::from(TailError::Open {
            path: PathBuf::from("/nope"),
            source: io::Error::from(io::ErrorKind::NotFound),
        });
        assert!(err.is_recoverable());

        let err = ExporterError::from(ConfigError::invalid_value("top_k", "zero"));
        assert_eq!(err.category(), "config");
        assert!(!err.is_recoverable());
    }
}

// ============================================================================
// TESTS: TOP-K HOSTS
// ============================================================================

#[cfg(test)]
mod phase2_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn sorted(mut entries: Vec<HostCount>) -> Vec<(String, u64)> {
        entries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.host.cmp(&b.host)));
        entries
            .into_iter()
            .map(|e| (e.host.to_string(), e.count))
            .collect()
    }

    #[test]
    fn test_keeps_heaviest_hosts() {
        let top = TopHosts::new(2);
        for host in ["a", "b", "c", "c", "c", "a", "d"] {
            top.add(host);
        }

        assert_eq!(
            sorted(top.get_top()),
            vec![("c".to_string(), 3), ("a".to_string(), 2)]
        );
        assert_eq!(top.count("b"), 1);
        assert_eq!(top.count("d"), 1);
        assert_eq!(top.count("zzz"), 0);
        assert_eq!(top.tracked_hosts(), 4);
    }

    #[test]
    fn test_tie_at_boundary_keeps_true_counts() {
        let top = TopHosts::new(2);
        for host in ["a", "b", "b", "c", "c", "c", "a", "d"] {
            top.add(host);
        }

        // a and b tie at 2; either may hold the second slot
        let entries = top.get_top();
        let counts: Vec<u64> = sorted(entries.clone()).into_iter().map(|(_, c)| c).collect();
        assert_eq!(counts, vec![3, 2]);
        for entry in &entries {
            assert_eq!(entry.count, top.count(&entry.host));
        }
    }

    #[test]
    fn test_in_heap_host_is_updated_not_duplicated() {
        let top = TopHosts::new(3);
        for _ in 0..5 {
            top.add("a.com");
        }
        let entries = top.get_top();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].count, 5);
    }

    #[test]
    fn test_newcomer_must_exceed_minimum() {
        let top = TopHosts::new(1);
        top.add("a");
        top.add("b");
        assert_eq!(sorted(top.get_top()), vec![("a".to_string(), 1)]);

        top.add("b");
        assert_eq!(sorted(top.get_top()), vec![("b".to_string(), 2)]);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let top = TopHosts::new(0);
        assert_eq!(top.capacity(), 1);
        top.add("a");
        assert_eq!(top.get_top().len(), 1);
    }

    #[test]
    fn test_max_tracked_never_exceeded_when_cap_equals_capacity() {
        let top = TopHosts::new(2).with_max_tracked(Some(2));
        top.add("a");
        top.add("b");
        for i in 0..10 {
            top.add(&format!("x{}", i));
            assert!(top.tracked_hosts() <= 3, "tracked {}", top.tracked_hosts());
        }
        assert_eq!(top.get_top().len(), 2);
    }

    #[test]
    fn test_max_tracked_bounds_counter() {
        let top = TopHosts::new(2).with_max_tracked(Some(3));
        for _ in 0..5 {
            top.add("a");
        }
        for _ in 0..4 {
            top.add("b");
        }
        for i in 0..50 {
            top.add(&format!("one-off-{}", i));
        }

        assert!(top.tracked_hosts() <= 3);
        assert_eq!(
            sorted(top.get_top()),
            vec![("a".to_string(), 5), ("b".to_string(), 4)]
        );
    }

    proptest! {
        #[test]
        fn prop_top_k_is_exact(
            k in 1usize..8,
            hosts in prop::collection::vec(0u8..20, 0..300),
        ) {
            let top = TopHosts::new(k);
            let mut truth: HashMap<String, u64> = HashMap::new();
            for h in &hosts {
                let name = format!("host-{}", h);
                top.add(&name);
                *truth.entry(name).or_default() += 1;
            }

            let entries = top.get_top();
            prop_assert_eq!(entries.len(), k.min(truth.len()));

            for entry in &entries {
                prop_assert_eq!(Some(&entry.count), truth.get(entry.host.as_str()));
            }

            let mut expected: Vec<u64> = truth.values().copied().collect();
            expected.sort_unstable_by(|a, b| b.cmp(a));
            expected.truncate(k);

            let mut actual: Vec<u64> = entries.iter().map(|e| e.count).collect();
            actual.sort_unstable_by(|a, b| b.cmp(a));
            prop_assert_eq!(actual, expected);
        }
    }
}

// ============================================================================
// TESTS: AGGREGATOR & METRICS
// ============================================================================


// ============================================================================
// TESTS: LOG TAILER
// ============================================================================


// ============================================================================
// TESTS: HTTP EXPOSITION
// ============================================================================

#[cfg(test)]
mod phase5_tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use pretty_assertions::assert_eq;
    use tower::ServiceExt;

    fn state(dir: &tempfile::TempDir) -> AppState {
        let metrics = Arc::new(ExporterMetrics::new().unwrap());
        let aggregator = Arc::new(MetricsAggregator::new(
            Arc::clone(&metrics),
            AggregatorOptions::default(),
        ));
        let tailer = Arc::new(LogTailer::new(dir.path().join("querylog.json"), aggregator).unwrap());
        AppState { metrics, tailer }
    }

    async fn get_path(app: Router, uri: &str) -> (StatusCode, String) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_readyz_always_ready() {
        let dir = tempfile::tempdir().unwrap();
        let (status, body) = get_path(router(state(&dir)), "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Ready");
    }

    #[tokio::test]
    async fn test_livez_reflects_tailer_health() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);

        let (status, body) = get_path(router(state.clone()), "/livez").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "Alive");

        assert!(state.tailer.process_new_lines().is_err());
        let (status, body) = get_path(router(state.clone()), "/livez").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body, "Unhealthy");

        std::fs::write(dir.path().join("querylog.json"), "").unwrap();
        state.tailer.process_new_lines().unwrap();
        let (status, _) = get_path(router(state), "/livez").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let state = state(&dir);
        state.metrics.dns_queries.inc();

        let (status, body) = get_path(router(state), "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("agh_dns_queries_total 1"));
        assert!(body.contains("# TYPE agh_dns_average_response_time gauge"));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let dir = tempfile::tempdir().unwrap();
        let (status, _) = get_path(router(state(&dir)), "/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
