use config::{Config, ConfigError, Environment, File};
use mirrorline_page::{ConnectionConfig, LossAction, QueueBackend};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackendKind {
    Memory,
    Disk,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub worker_threads: usize,
    pub client_queue_capacity: usize,
    pub max_payload_bytes: Option<usize>,
    pub output_buffer_limit: usize,
    #[serde(with = "humantime_serde")]
    pub output_buffer_timeout: Duration,
    pub input_buffer_limit: usize,
    #[serde(with = "humantime_serde")]
    pub input_buffer_timeout: Duration,
    pub lossless: bool,
    pub recovery_script: String,
    pub queue_backend: QueueBackendKind,
    pub spill_dir: PathBuf,
    #[serde(with = "humantime_serde")]
    pub missing_sink_warn_after: Duration,
    #[serde(with = "humantime_serde")]
    pub tick_interval: Duration,
    #[serde(default, with = "humantime_serde")]
    pub demo_tick_interval: Option<Duration>,
    #[serde(with = "humantime_serde")]
    pub health_log_interval: Duration,
}

impl ServerConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("bind_addr", "127.0.0.1:8787")?
            .set_default("worker_threads", 2)?
            .set_default("client_queue_capacity", 1024)?
            .set_default("max_payload_bytes", None::<u64>)?
            .set_default("output_buffer_limit", 0)?
            .set_default("output_buffer_timeout", "2s")?
            .set_default("input_buffer_limit", 0)?
            .set_default("input_buffer_timeout", "2s")?
            .set_default("lossless", false)?
            .set_default("recovery_script", "location.reload()")?
            .set_default("queue_backend", "memory")?
            .set_default("spill_dir", "data/queues")?
            .set_default("missing_sink_warn_after", "30s")?
            .set_default("tick_interval", "50ms")?
            .set_default("demo_tick_interval", None::<String>)?
            .set_default("health_log_interval", "30s")?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // Loaded into the process environment so the prefixed source below sees it.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("MIRRORLINE").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    /// Per-connection engine settings derived from this config.
    pub fn connection_config(&self) -> ConnectionConfig {
        let queue_backend = match self.queue_backend {
            QueueBackendKind::Memory => QueueBackend::Memory,
            QueueBackendKind::Disk => QueueBackend::Disk {
                base_dir: self.spill_dir.clone(),
            },
        };
        let loss_action = self
            .lossless
            .then(|| LossAction::with_recovery_task(self.recovery_script.as_bytes().to_vec()));
        ConnectionConfig {
            output_buffer_limit: self.output_buffer_limit,
            output_buffer_timeout: self.output_buffer_timeout,
            input_buffer_limit: self.input_buffer_limit,
            input_buffer_timeout: self.input_buffer_timeout,
            queue_backend,
            loss_action,
            missing_sink_warn_after: self.missing_sink_warn_after,
        }
    }
}
