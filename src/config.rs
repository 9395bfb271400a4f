//! Client configuration.
//!
//! [`GlobalConfig`] is the server-provided configuration, held in a
//! [`ClientConfig`] that hands out immutable snapshots and is updated by
//! shallow-merging new server values over the current ones.
//! [`ClientSettings`] holds the local tuning knobs for batching and
//! acknowledgement syncing.

use std::num::NonZeroUsize;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ApiError;
use crate::transport::Transport;

const CLIENT_CONFIG_PATH: &str = "/api/config/client";

fn default_upload_file_limit() -> u64 {
    1024 * 1024
}

/// Backend-wide settings the client needs to know about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Largest accepted upload, in bytes
    #[serde(default = "default_upload_file_limit")]
    pub upload_file_limit: u64,

    /// Whether registration requires a verified email address
    #[serde(default)]
    pub email_verification: bool,

    /// Anything else the server sends, kept verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            upload_file_limit: default_upload_file_limit(),
            email_verification: false,
            extra: Map::new(),
        }
    }
}

impl GlobalConfig {
    /// A copy of this config with the top-level fields of `patch` laid over
    /// it. Fields absent from the patch keep their current values.
    pub fn merged(&self, patch: &Map<String, Value>) -> Result<Self, serde_json::Error> {
        let mut fields = match serde_json::to_value(self)? {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };

        fields.extend(patch.iter().map(|(key, value)| (key.clone(), value.clone())));
        serde_json::from_value(Value::Object(fields))
    }
}

/// Holder for the current [`GlobalConfig`]. Readers get a cheap immutable
/// snapshot; writers replace the whole thing.
#[derive(Debug)]
pub struct ClientConfig {
    current: ArcSwap<GlobalConfig>,

    // Serializes read-merge-store so concurrent updates don't lose fields
    writer: Mutex<()>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(GlobalConfig::default())
    }
}

impl ClientConfig {
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
            writer: Mutex::new(()),
        }
    }

    /// The process-wide instance, starting out with defaults.
    pub fn global() -> &'static ClientConfig {
        static GLOBAL: OnceLock<ClientConfig> = OnceLock::new();
        GLOBAL.get_or_init(ClientConfig::default)
    }

    pub fn snapshot(&self) -> Arc<GlobalConfig> {
        self.current.load_full()
    }

    /// Replace the configuration outright.
    pub fn initialize(&self, config: GlobalConfig) {
        let _writer = self.writer.lock();
        self.current.store(Arc::new(config));
    }

    /// Shallow-merge `patch`, which must be a JSON object, over the current
    /// configuration. On error the current configuration is left alone.
    pub fn update(&self, patch: Value) -> Result<Arc<GlobalConfig>, ApiError> {
        let patch: Map<String, Value> =
            serde_json::from_value(patch).map_err(|err| ApiError::decode(CLIENT_CONFIG_PATH, err))?;

        let _writer = self.writer.lock();
        let merged = self
            .current
            .load()
            .merged(&patch)
            .map_err(|err| ApiError::decode(CLIENT_CONFIG_PATH, err))?;

        let merged = Arc::new(merged);
        self.current.store(Arc::clone(&merged));
        Ok(merged)
    }

    /// Fetch the client configuration from the server and merge it in.
    /// Returns the configuration as the server sent it.
    pub async fn fetch_global_client_config(
        &self,
        transport: &impl Transport,
    ) -> Result<GlobalConfig, ApiError> {
        let data = transport.get(CLIENT_CONFIG_PATH).await?;
        let config = serde_json::from_value(data.clone())
            .map_err(|err| ApiError::decode(CLIENT_CONFIG_PATH, err))?;

        self.update(data)?;
        tracing::debug!("client config refreshed");

        Ok(config)
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Local knobs for the loaders. Durations are given in milliseconds when
/// (de)serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClientSettings {
    /// Base URL substituted for `{BACKEND}` in server-provided URLs
    pub service_url: String,

    /// How long user lookups are collected before being sent. Zero means
    /// "until the executor next gets control".
    #[serde(with = "duration_ms")]
    pub batch_window: Duration,

    pub max_batch_keys: Option<NonZeroUsize>,

    pub cache_user_info: bool,

    #[serde(with = "duration_ms")]
    pub ack_debounce: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            service_url: String::new(),
            batch_window: Duration::ZERO,
            max_batch_keys: None,
            cache_user_info: true,
            ack_debounce: Duration::from_millis(1000),
        }
    }
}
