//! Configuration management for the prediction service

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

/// Default location of the optional config file
pub const DEFAULT_CONFIG_PATH: &str = "config/config.toml";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub model: ModelConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

/// Served model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Version reported in every response and in the model info gauge
    pub version: String,
    /// Location of the serialized artifact, read once at startup
    pub path: String,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub host: IpAddr,
    /// gRPC listener port
    pub rpc_port: u16,
    /// Metrics exposition listener port
    pub metrics_port: u16,
    /// Maximum number of RPC calls executed concurrently
    pub workers: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from `PREDICTION_CONFIG` or the default file path
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("PREDICTION_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from_path(path)
    }

    /// Load configuration from a specific path.
    ///
    /// Precedence, lowest first: built-in defaults, the file (if present),
    /// `PREDICTION__<SECTION>__<KEY>` variables, then `MODEL_VERSION`,
    /// `MODEL_PATH`, `RPC_PORT` (or `PORT`) and `METRICS_PORT`.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let defaults =
            Config::try_from(&AppConfig::default()).context("Failed to encode defaults")?;

        let config = Config::builder()
            .add_source(defaults)
            .add_source(File::from(path.as_ref()).required(false))
            .add_source(
                Environment::with_prefix("PREDICTION")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("model.version", env("MODEL_VERSION"))?
            .set_override_option("model.path", env("MODEL_PATH"))?
            .set_override_option("server.rpc_port", env("RPC_PORT").or_else(|| env("PORT")))?
            .set_override_option("server.metrics_port", env("METRICS_PORT"))?
            .build()
            .context("Failed to build configuration")?;

        let config: AppConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.model.version.trim().is_empty() {
            bail!("model.version must not be empty");
        }
        if self.model.path.trim().is_empty() {
            bail!("model.path must not be empty");
        }
        if self.server.workers == 0 {
            bail!("server.workers must be at least 1");
        }
        if self.server.rpc_port != 0 && self.server.rpc_port == self.server.metrics_port {
            bail!(
                "server.rpc_port and server.metrics_port are both {}",
                self.server.rpc_port
            );
        }
        Ok(())
    }

    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.rpc_port)
    }

    pub fn metrics_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.host, self.server.metrics_port)
    }
}

fn env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig {
                version: "v1.0.0".to_string(),
                path: "models/model.json".to_string(),
            },
            server: ServerConfig {
                host: IpAddr::from([0, 0, 0, 0]),
                rpc_port: 50051,
                metrics_port: 8000,
                workers: 10,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
