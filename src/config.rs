//! Worker configuration.
//!
//! Loaded once at startup (read → parse → validate) and shared read-only by
//! every worker behind an `Arc`. Every section is `#[serde(default)]`, so a
//! minimal file only names what differs from the defaults.

use std::fmt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::arena;
use crate::pipeline::Encoding;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// TCP listen addresses (HTTP/1.1 and HTTP/2).
    pub listen: Vec<SocketAddr>,
    /// UDP address handed to the QUIC transport, if any.
    pub quic_listen: Option<SocketAddr>,
    /// Number of workers; 0 means one per available core.
    pub workers: usize,
    pub accept_mode: AcceptMode,
    /// Static file root served by the default router.
    pub root_dir: PathBuf,
    pub tls: Option<TlsConfig>,
    pub limits: Limits,
    pub compression: CompressionConfig,
    pub keep_alive: KeepAliveConfig,
    pub upstream: UpstreamConfig,
    pub log_level: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen: vec![SocketAddr::from(([0, 0, 0, 0], 8080))],
            quic_listen: None,
            workers: 0,
            accept_mode: AcceptMode::ReusePort,
            root_dir: PathBuf::from("public"),
            tls: None,
            limits: Limits::default(),
            compression: CompressionConfig::default(),
            keep_alive: KeepAliveConfig::default(),
            upstream: UpstreamConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl WorkerConfig {
    /// Resolved worker count.
    pub fn worker_count(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
    }
}

/// How accepted sockets reach workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AcceptMode {
    /// One SO_REUSEPORT listener per worker; the kernel distributes.
    ReusePort,
    /// One acceptor thread hands sockets to workers round-robin.
    Handoff,
}

/// TLS material. Opaque to the core; only the collaborator reads the files.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// Emit `Strict-Transport-Security` on responses.
    #[serde(default)]
    pub hsts: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Limits {
    pub max_connections_per_worker: usize,
    /// Concurrent streams per HTTP/2 or HTTP/3 connection.
    pub max_streams: u32,
    /// In-flight HTTP/1.1 pipelined requests.
    pub pipeline_depth: usize,
    /// HPACK SETTINGS_HEADER_TABLE_SIZE.
    pub header_table_size: u32,
    pub qpack_table_capacity: u32,
    pub qpack_blocked_streams: u32,
    pub qpack_blocked_lifetime_ms: u64,
    pub idle_timeout_ms: u64,
    pub header_timeout_ms: u64,
    /// Per-connection arena allocation budget in bytes.
    pub arena_budget: usize,
    /// Buffered output above which reads are suspended.
    pub write_buffer_limit: usize,
    /// HTTP/2 SETTINGS_INITIAL_WINDOW_SIZE.
    pub initial_window_size: u32,
    /// HTTP/3 connection-level receive limit.
    pub max_data: u64,
    /// HTTP/3 per-stream receive limit.
    pub max_stream_data: u64,
    pub max_header_bytes: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_connections_per_worker: 10_000,
            max_streams: 100,
            pipeline_depth: 16,
            header_table_size: 4096,
            qpack_table_capacity: 4096,
            qpack_blocked_streams: 16,
            qpack_blocked_lifetime_ms: 1_000,
            idle_timeout_ms: 60_000,
            header_timeout_ms: 10_000,
            arena_budget: arena::DEFAULT_BUDGET,
            write_buffer_limit: 256 * 1024,
            initial_window_size: 65_535,
            max_data: 1 << 20,
            max_stream_data: 256 * 1024,
            max_header_bytes: 16 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Server preference, most preferred first.
    pub preference: Vec<Encoding>,
    /// Bodies smaller than this are sent as identity.
    pub min_size: usize,
    pub gzip_level: u32,
    pub brotli_level: u32,
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            preference: vec![Encoding::Zstd, Encoding::Brotli, Encoding::Gzip, Encoding::Deflate],
            min_size: 1024,
            gzip_level: 6,
            brotli_level: 4,
            zstd_level: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct KeepAliveConfig {
    /// Let the worker tune timeout and max from observed reuse.
    pub adaptive: bool,
    pub timeout_s: u64,
    pub max_requests: u32,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self { adaptive: true, timeout_s: 60, max_requests: 100 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    pub attempt_timeout_ms: u64,
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self { attempt_timeout_ms: 5_000, max_attempts: 3, base_backoff_ms: 100, max_backoff_ms: 2_000 }
    }
}

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Invalid(Vec<String>),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {e}"),
            ConfigError::Parse(e) => write!(f, "parse error: {e}"),
            ConfigError::Invalid(errors) => write!(f, "invalid configuration: {}", errors.join(", ")),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Load, parse and validate a TOML configuration file.
pub fn load_config(path: &Path) -> Result<WorkerConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
    parse_config(&content)
}

/// Parse and validate configuration text.
pub fn parse_config(content: &str) -> Result<WorkerConfig, ConfigError> {
    let config: WorkerConfig = toml::from_str(content).map_err(ConfigError::Parse)?;
    validate(&config).map_err(ConfigError::Invalid)?;
    Ok(config)
}

/// Check value ranges. Returns every problem found, not just the first.
pub fn validate(config: &WorkerConfig) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();
    let l = &config.limits;

    if config.listen.is_empty() && config.quic_listen.is_none() {
        errors.push("at least one listen address is required".to_string());
    }
    if l.max_streams == 0 {
        errors.push("limits.max_streams must be > 0".to_string());
    }
    if l.pipeline_depth == 0 {
        errors.push("limits.pipeline_depth must be > 0".to_string());
    }
    if l.arena_budget < arena::SLOT_SIZE || l.arena_budget > 2 * arena::PAGE_SIZE {
        errors.push(format!(
            "limits.arena_budget must be between {} and {} bytes",
            arena::SLOT_SIZE,
            2 * arena::PAGE_SIZE
        ));
    }
    if l.max_header_bytes > l.arena_budget {
        errors.push("limits.max_header_bytes must not exceed limits.arena_budget".to_string());
    }
    if l.initial_window_size > crate::h2::flow_control::MAX_WINDOW_SIZE {
        errors.push("limits.initial_window_size exceeds 2^31-1".to_string());
    }
    if l.idle_timeout_ms == 0 {
        errors.push("limits.idle_timeout_ms must be > 0".to_string());
    }
    if l.max_data == 0 || l.max_stream_data == 0 {
        errors.push("limits.max_data and limits.max_stream_data must be > 0".to_string());
    }
    if l.write_buffer_limit == 0 {
        errors.push("limits.write_buffer_limit must be > 0".to_string());
    }
    let c = &config.compression;
    if !(1..=9).contains(&c.gzip_level) {
        errors.push("compression.gzip_level must be in 1..=9".to_string());
    }
    if c.brotli_level > 11 {
        errors.push("compression.brotli_level must be in 0..=11".to_string());
    }
    if !(1..=22).contains(&c.zstd_level) {
        errors.push("compression.zstd_level must be in 1..=22".to_string());
    }
    let u = &config.upstream;
    if u.max_attempts == 0 {
        errors.push("upstream.max_attempts must be > 0".to_string());
    }
    if u.base_backoff_ms > u.max_backoff_ms {
        errors.push("upstream.base_backoff_ms must not exceed upstream.max_backoff_ms".to_string());
    }
    if config.keep_alive.max_requests == 0 {
        errors.push("keep_alive.max_requests must be > 0".to_string());
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_file_uses_defaults() {
        let config = parse_config("listen = [\"127.0.0.1:9000\"]\n").unwrap();
        assert_eq!(config.listen, vec!["127.0.0.1:9000".parse::<SocketAddr>().unwrap()]);
        assert_eq!(config.limits.arena_budget, arena::DEFAULT_BUDGET);
        assert_eq!(config.accept_mode, AcceptMode::ReusePort);
        assert_eq!(config.compression.preference[0], Encoding::Zstd);
    }

    #[test]
    fn sections_override() {
        let text = r#"
            accept_mode = "handoff"
            [limits]
            max_streams = 8
            [compression]
            preference = ["gzip", "br"]
            [upstream]
            max_attempts = 5
        "#;
        let config = parse_config(text).unwrap();
        assert_eq!(config.accept_mode, AcceptMode::Handoff);
        assert_eq!(config.limits.max_streams, 8);
        assert_eq!(config.compression.preference, vec![Encoding::Gzip, Encoding::Brotli]);
        assert_eq!(config.upstream.max_attempts, 5);
    }

    #[test]
    fn validation_reports_every_problem() {
        let text = r#"
            [limits]
            max_streams = 0
            arena_budget = 10
            [upstream]
            max_attempts = 0
        "#;
        match parse_config(text) {
            Err(ConfigError::Invalid(errors)) => assert!(errors.len() >= 3, "{errors:?}"),
            other => panic!("expected validation failure, got {other:?}"),
        }
    }

    #[test]
    fn syntax_error_is_parse_error() {
        assert!(matches!(parse_config("listen = ["), Err(ConfigError::Parse(_))));
    }
}
