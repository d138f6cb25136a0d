use clap::Parser;
use lib_realtime::connections::RedisBrokerConfig;
use lib_realtime::{BucketPolicy, GatewayConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DEFAULT_CONFIG_FILE: &str = "server_realtime.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "Real-time comment and chat fan-out server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "RT_PORT", help = "Port to listen on for HTTP and WebSocket clients.")]
    pub port: Option<u16>,

    #[clap(long, env = "RT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "RT_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "RT_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(
        long,
        env = "RT_REDIS_URL",
        help = "Redis URL. Without it fan-out and rate limits stay in-process."
    )]
    pub redis_url: Option<String>,

    #[clap(
        long,
        env = "RT_TOKEN_SECRET",
        help = "Shared secret used to validate client credentials."
    )]
    pub token_secret: Option<String>,

    #[clap(long, env = "RT_BLOB_BASE_URL", help = "Base URL attachments are served from.")]
    pub blob_base_url: Option<String>,

    #[clap(
        long,
        env = "RT_HTTP_BUCKET_CAPACITY",
        help = "Token bucket capacity for HTTP requests per client address."
    )]
    pub http_bucket_capacity: Option<f64>,

    #[clap(
        long,
        env = "RT_HTTP_REFILL_PER_SEC",
        help = "Tokens per second refilled into HTTP buckets."
    )]
    pub http_refill_per_sec: Option<f64>,

    #[clap(long, env = "RT_HTTP_BUCKET_EXPIRY_SECS", help = "Seconds an idle HTTP bucket is kept.")]
    pub http_bucket_expiry_secs: Option<u64>,

    #[clap(
        long,
        env = "RT_WS_BUCKET_CAPACITY",
        help = "Token bucket capacity for WebSocket write frames per client address."
    )]
    pub ws_bucket_capacity: Option<f64>,

    #[clap(
        long,
        env = "RT_WS_REFILL_PER_SEC",
        help = "Tokens per second refilled into WebSocket write buckets."
    )]
    pub ws_refill_per_sec: Option<f64>,

    #[clap(
        long,
        env = "RT_WS_BUCKET_EXPIRY_SECS",
        help = "Seconds an idle WebSocket write bucket is kept."
    )]
    pub ws_bucket_expiry_secs: Option<u64>,

    #[clap(
        long,
        env = "RT_SETUP_TIMEOUT_MS",
        help = "Milliseconds allowed for connection authentication and subscription."
    )]
    pub setup_timeout_ms: Option<u64>,

    #[clap(
        long,
        env = "RT_RESUBSCRIBE_DELAY_MS",
        help = "Milliseconds to wait before reopening a failed Redis subscription."
    )]
    pub resubscribe_delay_ms: Option<u64>,

    #[clap(
        long,
        env = "RT_OUTBOUND_BUFFER",
        help = "Frames queued per client before backpressure."
    )]
    pub outbound_buffer: Option<usize>,

    #[clap(
        long,
        env = "RT_ECHO_OWN",
        help = "Deliver a connection's own items back to it (true/false)."
    )]
    pub echo_own: Option<bool>,

    #[clap(
        long,
        env = "RT_COMMIT_ON_ATTACHMENT",
        help = "Complete an item on a binary frame alone (true/false)."
    )]
    pub commit_on_attachment: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            port: other.port.or(self.port),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            redis_url: other.redis_url.or(self.redis_url),
            token_secret: other.token_secret.or(self.token_secret),
            blob_base_url: other.blob_base_url.or(self.blob_base_url),
            http_bucket_capacity: other.http_bucket_capacity.or(self.http_bucket_capacity),
            http_refill_per_sec: other.http_refill_per_sec.or(self.http_refill_per_sec),
            http_bucket_expiry_secs: other.http_bucket_expiry_secs.or(self.http_bucket_expiry_secs),
            ws_bucket_capacity: other.ws_bucket_capacity.or(self.ws_bucket_capacity),
            ws_refill_per_sec: other.ws_refill_per_sec.or(self.ws_refill_per_sec),
            ws_bucket_expiry_secs: other.ws_bucket_expiry_secs.or(self.ws_bucket_expiry_secs),
            setup_timeout_ms: other.setup_timeout_ms.or(self.setup_timeout_ms),
            resubscribe_delay_ms: other.resubscribe_delay_ms.or(self.resubscribe_delay_ms),
            outbound_buffer: other.outbound_buffer.or(self.outbound_buffer),
            echo_own: other.echo_own.or(self.echo_own),
            commit_on_attachment: other.commit_on_attachment.or(self.commit_on_attachment),
        }
    }

    fn defaults() -> Config {
        let bucket = BucketPolicy::default();
        let gateway = GatewayConfig::default();
        Config {
            port: Some(8080),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            blob_base_url: Some("/files".to_string()),
            http_bucket_capacity: Some(bucket.capacity),
            http_refill_per_sec: Some(bucket.refill_per_sec),
            http_bucket_expiry_secs: Some(bucket.expiry_secs),
            ws_bucket_capacity: Some(bucket.capacity),
            ws_refill_per_sec: Some(bucket.refill_per_sec),
            ws_bucket_expiry_secs: Some(bucket.expiry_secs),
            setup_timeout_ms: Some(gateway.setup_timeout_ms),
            resubscribe_delay_ms: Some(RedisBrokerConfig::default().resubscribe_delay_ms),
            outbound_buffer: Some(gateway.outbound_buffer),
            echo_own: Some(gateway.echo_own),
            commit_on_attachment: Some(gateway.commit_on_attachment),
            ..Default::default()
        }
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(8080)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }

    pub fn http_policy(&self) -> BucketPolicy {
        let base = BucketPolicy::default();
        BucketPolicy {
            capacity: self.http_bucket_capacity.unwrap_or(base.capacity),
            refill_per_sec: self.http_refill_per_sec.unwrap_or(base.refill_per_sec),
            expiry_secs: self.http_bucket_expiry_secs.unwrap_or(base.expiry_secs),
        }
    }

    pub fn ws_policy(&self) -> BucketPolicy {
        let base = BucketPolicy::default();
        BucketPolicy {
            capacity: self.ws_bucket_capacity.unwrap_or(base.capacity),
            refill_per_sec: self.ws_refill_per_sec.unwrap_or(base.refill_per_sec),
            expiry_secs: self.ws_bucket_expiry_secs.unwrap_or(base.expiry_secs),
        }
    }

    pub fn gateway(&self) -> GatewayConfig {
        let base = GatewayConfig::default();
        GatewayConfig {
            setup_timeout_ms: self.setup_timeout_ms.unwrap_or(base.setup_timeout_ms),
            outbound_buffer: self.outbound_buffer.unwrap_or(base.outbound_buffer),
            echo_own: self.echo_own.unwrap_or(base.echo_own),
            commit_on_attachment: self.commit_on_attachment.unwrap_or(base.commit_on_attachment),
        }
    }

    pub fn redis_broker(&self) -> RedisBrokerConfig {
        let base = RedisBrokerConfig::default();
        RedisBrokerConfig {
            resubscribe_delay_ms: self.resubscribe_delay_ms.unwrap_or(base.resubscribe_delay_ms),
        }
    }
}

/// Defaults, then the JSON config file, then environment and CLI.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        info!(
            path = %path.display(),
            "config file not found, using defaults and environment/CLI values"
        );
        return None;
    }
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file, falling back to other sources"
            );
            return None;
        }
    };
    match serde_json::from_str::<Config>(&raw) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!(
                path = %path.display(),
                error = %e,
                "failed to parse config file, falling back to other sources"
            );
            None
        }
    }
}

pub fn load_config() -> Config {
    // .env first so clap sees its values as environment variables.
    let _ = dotenvy::dotenv();
    resolve(Config::parse())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_library_defaults() {
        let config = resolve(Config {
            config_path: Some(PathBuf::from("/nonexistent/server_realtime.conf")),
            ..Default::default()
        });
        assert_eq!(config.port(), 8080);
        assert_eq!(config.http_policy(), BucketPolicy::default());
        assert_eq!(config.ws_policy(), BucketPolicy::default());
        assert_eq!(config.gateway(), GatewayConfig::default());
        assert_eq!(config.redis_broker(), RedisBrokerConfig::default());
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn cli_overrides_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"port": 9100, "echoOwn": false, "httpBucketCapacity": 5.0}}"#).unwrap();

        let config = resolve(Config {
            config_path: Some(file.path().to_path_buf()),
            port: Some(9200),
            ..Default::default()
        });
        assert_eq!(config.port(), 9200);
        assert!(!config.gateway().echo_own);
        assert_eq!(config.http_policy().capacity, 5.0);
        assert_eq!(config.ws_policy().capacity, 15.0);
    }

    #[test]
    fn unparsable_file_is_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "port = 1").unwrap();
        let config = resolve(Config {
            config_path: Some(file.path().to_path_buf()),
            ..Default::default()
        });
        assert_eq!(config.port(), 8080);
    }
}
