//! Configuration loading, validation and hot reload.
//!
//! Configuration is split across four JSON files in one directory:
//!
//!   server.json     server/proxy/admin/logging/openai settings
//!   upstreams.json  upstream pool + load-balancer settings
//!   tenants.json    tenant keys, allow-lists and spend limits
//!   pricing.json    per-model USD prices (per 1,000 tokens)
//!
//! A parsed [`Config`] is an immutable snapshot. [`ConfigStore`] hands out
//! `Arc<Config>` snapshots and swaps in a freshly validated one on reload,
//! so request handlers always observe a consistent view.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::RwLock;

use crate::pricing::ModelPrice;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

// ---------------------------------------------------------------------------
// server.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerFile {
    pub server: ListenConfig,
    pub proxy: ProxyConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
    pub openai: OpenAiConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Whole-request upstream timeout in milliseconds (covers the response
    /// body, so long SSE generations need generous values).
    pub timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self { timeout: 120_000 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub path: String,
    pub username: String,
    pub password: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "/admin".to_string(),
            username: "admin".to_string(),
            password: String::new(),
        }
    }
}

/// Log transport settings. The file-rotation fields are accepted and
/// validated here but consumed by the deployment's log shipper, not by the
/// process itself; `enable_console` governs the console subscriber.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingConfig {
    pub directory: Option<PathBuf>,
    pub max_file_size: Option<u64>,
    pub max_files: Option<u32>,
    pub enable_console: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            max_file_size: None,
            max_files: None,
            enable_console: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OpenAiConfig {
    pub enabled: bool,
    /// OpenAI model name -> Anthropic model name.
    pub models: HashMap<String, String>,
    /// Fallback when the requested model has no mapping entry.
    pub default_model: Option<String>,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            models: HashMap::new(),
            default_model: None,
        }
    }
}

// ---------------------------------------------------------------------------
// upstreams.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamsFile {
    pub upstreams: Vec<Upstream>,
    pub load_balancer: BalancerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Upstream {
    pub id: String,
    pub name: String,
    /// Base URL, e.g. `https://api.anthropic.com` (a path component is
    /// prepended to proxied paths).
    pub url: String,
    /// Secret used to replace the client's Authorization header.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheckConfig {
    /// Probe path, defaults to `/health`.
    pub path: Option<String>,
    /// Probe timeout in milliseconds, defaults to 5000.
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BalancerConfig {
    /// Strategy name; unrecognized names fall back to weighted round-robin
    /// with a warning at balancer construction.
    pub strategy: String,
    pub health_check_enabled: bool,
    pub failover_enabled: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: "round_robin".to_string(),
            health_check_enabled: false,
            failover_enabled: true,
        }
    }
}

fn default_weight() -> u32 {
    100
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// tenants.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantsFile {
    pub tenants: Vec<Tenant>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub key: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Ordered glob patterns; an empty list means no model restriction.
    #[serde(default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub limits: Option<TenantLimits>,
}

impl Tenant {
    /// The configured daily USD cap, if any.
    pub fn daily_max_usd(&self) -> Option<f64> {
        self.limits.as_ref()?.daily.as_ref()?.max_usd
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TenantLimits {
    pub daily: Option<DailyLimit>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct DailyLimit {
    #[serde(rename = "maxUSD")]
    pub max_usd: Option<f64>,
}

// ---------------------------------------------------------------------------
// pricing.json
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct PricingFile {
    /// Pattern -> price entry, in file order. Order matters: pricing lookup
    /// is exact-first, then first wildcard match in insertion order.
    #[serde(
        rename = "modelPricing",
        deserialize_with = "ordered_pricing",
        serialize_with = "pricing_as_map"
    )]
    pub model_pricing: Vec<(String, ModelPrice)>,
}

/// Deserialize a JSON object into a `Vec` so insertion order survives.
fn ordered_pricing<'de, D>(deserializer: D) -> Result<Vec<(String, ModelPrice)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, ModelPrice)>;

        fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.write_str("a map of model pattern to pricing entry")
        }

        fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((pattern, price)) = map.next_entry::<String, ModelPrice>()? {
                entries.push((pattern, price));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor)
}

fn pricing_as_map<S>(
    entries: &[(String, ModelPrice)],
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
}

// ---------------------------------------------------------------------------
// Combined snapshot
// ---------------------------------------------------------------------------

/// One immutable view of the whole configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub listen: ListenConfig,
    pub proxy: ProxyConfig,
    pub admin: AdminConfig,
    pub logging: LoggingConfig,
    pub openai: OpenAiConfig,
    pub upstreams: Vec<Upstream>,
    pub load_balancer: BalancerConfig,
    pub tenants: Vec<Tenant>,
    pub pricing: Vec<(String, ModelPrice)>,
}

impl Config {
    /// Load and validate all four files from `dir`.
    ///
    /// `server.json` and `pricing.json` may be absent (defaults / empty
    /// table); `upstreams.json` and `tenants.json` are required.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let server: ServerFile = read_optional_json(&dir.join("server.json"))?.unwrap_or_default();
        let upstreams: UpstreamsFile = read_json(&dir.join("upstreams.json"))?;
        let tenants: TenantsFile = read_json(&dir.join("tenants.json"))?;
        let pricing: PricingFile =
            read_optional_json(&dir.join("pricing.json"))?.unwrap_or_else(|| {
                tracing::warn!("pricing.json not found; all request costs will be zero");
                PricingFile::default()
            });

        let mut config = Config {
            listen: server.server,
            proxy: server.proxy,
            admin: server.admin,
            logging: server.logging,
            openai: server.openai,
            upstreams: upstreams.upstreams,
            load_balancer: upstreams.load_balancer,
            tenants: tenants.tenants,
            pricing: pricing.model_pricing,
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// `host:port` string suitable for `TcpListener::bind`.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.listen.host, self.listen.port)
    }

    /// Look up a tenant by its secret key (exact match).
    pub fn tenant_by_key(&self, key: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.key == key)
    }

    /// Look up a tenant by id.
    pub fn tenant_by_id(&self, id: &str) -> Option<&Tenant> {
        self.tenants.iter().find(|t| t.id == id)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(port) = std::env::var("PORT") {
            match port.parse::<u16>() {
                Ok(port) => {
                    tracing::info!(port, "server.port overridden by PORT env var");
                    self.listen.port = port;
                }
                Err(_) => {
                    tracing::warn!(value = %port, "Ignoring unparseable PORT env var");
                }
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.upstreams.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one upstream must be configured".to_string(),
            ));
        }

        let mut upstream_ids = HashSet::new();
        for up in &self.upstreams {
            if up.id.is_empty() {
                return Err(ConfigError::Invalid("upstream with empty id".to_string()));
            }
            if !upstream_ids.insert(up.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate upstream id '{}'",
                    up.id
                )));
            }
            url::Url::parse(&up.url).map_err(|e| {
                ConfigError::Invalid(format!("upstream '{}' has invalid url: {e}", up.id))
            })?;
        }

        if self.upstreams.iter().all(|u| !u.enabled) {
            tracing::warn!("all upstreams are disabled; every request will fail with no_upstream");
        }

        let mut tenant_ids = HashSet::new();
        let mut tenant_keys = HashSet::new();
        for tenant in &self.tenants {
            if tenant.id.is_empty() {
                return Err(ConfigError::Invalid("tenant with empty id".to_string()));
            }
            // Tenant ids become directory names in the usage layout.
            if tenant.id.contains('/') || tenant.id.contains('\\') || tenant.id.contains("..") {
                return Err(ConfigError::Invalid(format!(
                    "tenant id '{}' contains path separators",
                    tenant.id
                )));
            }
            if !tenant_ids.insert(tenant.id.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate tenant id '{}'",
                    tenant.id
                )));
            }
            if tenant.key.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "tenant '{}' has an empty key",
                    tenant.id
                )));
            }
            if !tenant_keys.insert(tenant.key.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "tenant '{}' reuses another tenant's key",
                    tenant.id
                )));
            }
            if let Some(max) = tenant.daily_max_usd() {
                if max < 0.0 || !max.is_finite() {
                    return Err(ConfigError::Invalid(format!(
                        "tenant '{}' has a negative daily limit",
                        tenant.id
                    )));
                }
            }
        }

        for (pattern, price) in &self.pricing {
            let fields = [
                price.input,
                price.output,
                price.cache_creation,
                price.cache_read,
            ];
            if fields.iter().any(|p| *p < 0.0 || !p.is_finite()) {
                return Err(ConfigError::Invalid(format!(
                    "pricing entry '{pattern}' has a negative price"
                )));
            }
        }

        if self.admin.enabled {
            if self.admin.password.is_empty() {
                return Err(ConfigError::Invalid(
                    "admin.enabled requires a non-empty admin.password".to_string(),
                ));
            }
            if !self.admin.path.starts_with('/') {
                return Err(ConfigError::Invalid(
                    "admin.path must start with '/'".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Read and parse one required JSON file.
fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.to_path_buf(),
        source: e,
    })?;
    serde_json::from_str(&raw).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Like [`read_json`] but a missing file yields `Ok(None)`.
fn read_optional_json<T: serde::de::DeserializeOwned>(
    path: &Path,
) -> Result<Option<T>, ConfigError> {
    match std::fs::read_to_string(path) {
        Ok(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| ConfigError::Parse {
                path: path.to_path_buf(),
                source: e,
            }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

// ---------------------------------------------------------------------------
// ConfigStore
// ---------------------------------------------------------------------------

/// Shared handle to the current configuration snapshot.
///
/// Readers take a cheap `Arc` clone and keep using it for the whole request,
/// so a concurrent reload never changes semantics mid-request.
pub struct ConfigStore {
    dir: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigStore {
    pub fn new(dir: impl Into<PathBuf>, initial: Config) -> Self {
        Self {
            dir: dir.into(),
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// The directory this store loads from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Current snapshot.
    pub async fn snapshot(&self) -> Arc<Config> {
        self.current.read().await.clone()
    }

    /// Re-read the config directory and swap in the new snapshot.
    ///
    /// On any load or validation error the previous snapshot keeps serving.
    pub async fn reload(&self) -> Result<Arc<Config>, ConfigError> {
        let fresh = Arc::new(Config::load(&self.dir)?);
        *self.current.write().await = fresh.clone();
        tracing::info!(
            upstreams = fresh.upstreams.len(),
            tenants = fresh.tenants.len(),
            pricing_entries = fresh.pricing.len(),
            "Configuration reloaded"
        );
        Ok(fresh)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
