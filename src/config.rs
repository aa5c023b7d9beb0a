use crate::ingest::line_reader::HARD_MAX_LINE_SIZE;
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::{collections::HashMap, env, net::SocketAddr, str::FromStr, time::Duration};
use tracing_subscriber::filter::Builder;
use validator::{Validate, ValidationError};

#[derive(Clone, Deserialize, Validate)]
pub struct AppConfig {
	#[validate(nested)]
	pub server: Server,
	#[validate(nested, length(min = 1, message = "at least one syslog listener must be configured"))]
	pub syslog: Vec<ListenerConfig>,
	#[validate(nested)]
	pub cluster: ClusterConfig,
}

#[derive(Clone, Deserialize, Validate)]
pub struct Server {
	#[validate(custom(function = "validate_ip_addr"))]
	pub listen_addr: String,
	#[serde(with = "humantime_serde")]
	pub timeout: Duration,
	#[validate(nested)]
	pub log: Log,
}

#[derive(Clone, Deserialize, Validate)]
pub struct Log {
	#[validate(custom(function = "validate_log_filter_directives"))]
	pub filter_directives: String,
}

impl Default for Log {
	fn default() -> Self {
		Self {
			filter_directives: "info".to_string(),
		}
	}
}

fn validate_log_filter_directives(dirs: &str) -> Result<(), ValidationError> {
	Builder::default()
		.parse(dirs)
		.map_err(|_| ValidationError::new("invalid log filter directives"))
		.map(|_| ())
}

fn validate_ip_addr(addr: &str) -> Result<(), ValidationError> {
	SocketAddr::from_str(addr)
		.map_err(|_| ValidationError::new("invalid bind address"))
		.map(|_| ())
}

/// Transports a syslog listener can bind to (spec.md §4.3).
#[derive(Clone, Copy, Deserialize, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
	Tcp,
	Udp,
	Unix,
	#[serde(alias = "unixgram")]
	Unixpacket,
}

/// spec.md §9 open question: the validator accepts `zstd` even though the
/// doc string only lists `none/gzip/deflate` — keep accepting it.
#[derive(Clone, Copy, Deserialize, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressMethod {
	#[default]
	None,
	Gzip,
	Deflate,
	Zstd,
}

fn default_max_line_size() -> usize {
	256 * 1024
}

fn default_write_concurrency() -> usize {
	64
}

/// Per listen-address configuration (spec.md §6).
#[derive(Clone, Deserialize, Validate)]
#[validate(schema(function = "validate_listener"))]
pub struct ListenerConfig {
	pub transport: Transport,
	pub bind: String,
	pub tenant_id: String,
	#[serde(default)]
	pub stream_fields: Vec<String>,
	#[serde(default)]
	pub ignore_fields: Vec<String>,
	#[serde(default)]
	pub decolorize_fields: Vec<String>,
	#[serde(default)]
	pub extra_fields: HashMap<String, String>,
	#[serde(default)]
	pub compress_method: CompressMethod,
	#[serde(default)]
	pub use_local_timestamp: bool,
	#[serde(default)]
	pub use_remote_ip: bool,
	#[serde(default = "default_max_line_size")]
	pub max_line_size_bytes: usize,
	#[serde(default = "default_write_concurrency")]
	pub write_concurrency_limit: usize,
	#[serde(default)]
	pub tls: bool,
	pub tls_cert_file: Option<String>,
	pub tls_key_file: Option<String>,
}

fn validate_listener(cfg: &ListenerConfig) -> Result<(), ValidationError> {
	if cfg.max_line_size_bytes > HARD_MAX_LINE_SIZE {
		return Err(ValidationError::new(
			"max_line_size_bytes exceeds the 2 MiB hard ceiling",
		));
	}
	if cfg.max_line_size_bytes == 0 {
		return Err(ValidationError::new("max_line_size_bytes must be positive"));
	}
	if cfg.tls && (cfg.tls_cert_file.is_none() || cfg.tls_key_file.is_none()) {
		return Err(ValidationError::new(
			"tls enabled but tls_cert_file/tls_key_file missing",
		));
	}
	Ok(())
}

#[derive(Clone, Deserialize, Validate)]
pub struct StorageNodeConfig {
	#[validate(custom(function = "validate_ip_addr"))]
	pub addr: String,
	/// Whether this node's `/internal/select/*` endpoints are served over
	/// TLS (spec.md §6 TLS field set, applied node-side rather than
	/// listener-side here).
	#[serde(default)]
	pub tls: bool,
}

#[derive(Clone, Deserialize, Validate)]
pub struct ClusterConfig {
	#[validate(nested, length(min = 1, message = "at least one storage node must be configured"))]
	pub storage_nodes: Vec<StorageNodeConfig>,
	#[serde(default)]
	pub disable_compression: bool,
}

impl AppConfig {
	pub fn new() -> Result<Self, ConfigError> {
		let default_config = env::var("LOGFRONT_CONFIG").unwrap_or("config.yaml".to_string());
		Config::builder()
			.add_source(File::with_name(&default_config))
			.build()?
			.try_deserialize()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use pretty_assertions::assert_eq;

	fn sample_listener() -> ListenerConfig {
		ListenerConfig {
			transport: Transport::Tcp,
			bind: "0.0.0.0:6514".to_string(),
			tenant_id: "1:1".to_string(),
			stream_fields: vec!["host".to_string()],
			ignore_fields: vec![],
			decolorize_fields: vec![],
			extra_fields: HashMap::new(),
			compress_method: CompressMethod::None,
			use_local_timestamp: false,
			use_remote_ip: true,
			max_line_size_bytes: default_max_line_size(),
			write_concurrency_limit: default_write_concurrency(),
			tls: false,
			tls_cert_file: None,
			tls_key_file: None,
		}
	}

	#[test]
	fn listener_transport_parses_from_json() {
		let j = serde_json::json!({
			"transport": "unix",
			"bind": "/tmp/syslog.sock",
			"tenant_id": "1:1",
			"max_line_size_bytes": 4096,
		});
		let cfg: ListenerConfig = serde_json::from_value(j).unwrap();
		assert_eq!(cfg.transport, Transport::Unix);
		assert_eq!(cfg.max_line_size_bytes, 4096);
	}

	#[test]
	fn unixgram_is_an_alias_for_unixpacket() {
		let j = serde_json::json!({"transport": "unixgram", "bind": "/tmp/a.sock", "tenant_id": "1:1"});
		let cfg: ListenerConfig = serde_json::from_value(j).unwrap();
		assert_eq!(cfg.transport, Transport::Unixpacket);
	}

	#[test]
	fn zstd_compress_method_is_accepted() {
		let j = serde_json::json!({"transport": "tcp", "bind": "0.0.0.0:1", "tenant_id": "1:1", "compress_method": "zstd"});
		let cfg: ListenerConfig = serde_json::from_value(j).unwrap();
		assert_eq!(cfg.compress_method, CompressMethod::Zstd);
	}

	#[test]
	fn max_line_size_over_hard_ceiling_fails_validation() {
		let mut cfg = sample_listener();
		cfg.max_line_size_bytes = HARD_MAX_LINE_SIZE + 1;
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn max_line_size_at_hard_ceiling_passes() {
		let mut cfg = sample_listener();
		cfg.max_line_size_bytes = HARD_MAX_LINE_SIZE;
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn tls_enabled_without_cert_files_fails_validation() {
		let mut cfg = sample_listener();
		cfg.tls = true;
		assert!(cfg.validate().is_err());
		cfg.tls_cert_file = Some("cert.pem".to_string());
		cfg.tls_key_file = Some("key.pem".to_string());
		assert!(cfg.validate().is_ok());
	}

	#[test]
	fn server_listen_addr_must_be_a_socket_addr() {
		let test_cases = vec![
			("0.0.0.0:6778", true),
			(":6778", false),
			("0.0.0.0", false),
		];
		for (addr, expect_ok) in test_cases {
			let server = Server {
				listen_addr: addr.to_string(),
				timeout: Duration::from_secs(30),
				log: Log::default(),
			};
			assert_eq!(server.validate().is_ok(), expect_ok, "addr={addr}");
		}
	}

	#[test]
	fn cluster_requires_at_least_one_storage_node() {
		let cluster = ClusterConfig {
			storage_nodes: vec![],
			disable_compression: false,
		};
		assert!(cluster.validate().is_err());
	}
}
