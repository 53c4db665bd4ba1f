use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `OUTREACH__` and TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
}

/// Execution-engine tunables: scheduler cadence, retry policy, completion
/// sweep, and the engagement-gate policy flags.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_scheduler_interval_secs")]
    pub scheduler_interval_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_backoff_secs")]
    pub retry_backoff_secs: u64,
    #[serde(default = "default_stale_claim_timeout_secs")]
    pub stale_claim_timeout_secs: u64,
    #[serde(default = "default_completion_sweep_interval_secs")]
    pub completion_sweep_interval_secs: u64,
    /// How long a reply-gated step waits for its qualifying event before the
    /// recipient is considered exhausted for that step.
    #[serde(default = "default_gate_window_hours")]
    pub gate_window_hours: u32,
    /// Whether a REPLIED recipient satisfies OPENED and CLICKED gates.
    #[serde(default = "default_replied_satisfies_gates")]
    pub replied_satisfies_engagement_gates: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    /// Fallback daily send limit when the plan source has no entry for an
    /// organization. `None` means unlimited.
    #[serde(default)]
    pub default_daily_limit: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default = "default_from_email")]
    pub from_email: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
}

/// Bounce/reply polling sweep. `sweep_interval_secs = None` disables the
/// sweep entirely (webhook-only organizations).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectionConfig {
    #[serde(default)]
    pub sweep_interval_secs: Option<u64>,
}

// Default functions
fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_scheduler_interval_secs() -> u64 {
    30
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_backoff_secs() -> u64 {
    60
}
fn default_stale_claim_timeout_secs() -> u64 {
    900
}
fn default_completion_sweep_interval_secs() -> u64 {
    300
}
fn default_gate_window_hours() -> u32 {
    168
}
fn default_replied_satisfies_gates() -> bool {
    true
}
fn default_from_email() -> String {
    "outreach@example.com".to_string()
}
fn default_from_name() -> String {
    "OutreachExpress".to_string()
}
fn default_worker_count() -> usize {
    4
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_secs: default_scheduler_interval_secs(),
            max_attempts: default_max_attempts(),
            retry_backoff_secs: default_retry_backoff_secs(),
            stale_claim_timeout_secs: default_stale_claim_timeout_secs(),
            completion_sweep_interval_secs: default_completion_sweep_interval_secs(),
            gate_window_hours: default_gate_window_hours(),
            replied_satisfies_engagement_gates: default_replied_satisfies_gates(),
        }
    }
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_daily_limit: None,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            from_email: default_from_email(),
            from_name: default_from_name(),
            worker_count: default_worker_count(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            engine: EngineConfig::default(),
            quota: QuotaConfig::default(),
            delivery: DeliveryConfig::default(),
            detection: DetectionConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("OUTREACH")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
