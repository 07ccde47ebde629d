use serde::Deserialize;

/// Root configuration. Loaded from environment variables with the
/// prefix `PULSE__`; every section carries serde defaults so an empty
/// environment yields a working local setup.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub observability: ObservabilityConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub mirror: MirrorConfig,
    #[serde(default)]
    pub alert: AlertConfig,
    #[serde(default)]
    pub redis: RedisConfig,
    #[serde(default)]
    pub triage: TriageConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub investigator: InvestigatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Global kill switch: when false the store drops every event with
    /// zero side effects.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Fixed-window length for the debug backpressure guard.
    #[serde(default = "default_debug_window_secs")]
    pub debug_window_secs: u64,
    /// Accepted debug events per window per source:component:action key.
    #[serde(default = "default_debug_window_cap")]
    pub debug_window_cap: u32,
    /// Log the first drop and every Nth thereafter per key.
    #[serde(default = "default_drop_log_interval")]
    pub drop_log_interval: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_url")]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_search_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MirrorConfig {
    #[serde(default = "default_mirror_url")]
    pub url: String,
    /// Only events newer than this are mirrored.
    #[serde(default = "default_recency_window_mins")]
    pub recency_window_mins: i64,
    /// Prune pass runs at most once per this interval, process-wide.
    #[serde(default = "default_prune_interval_mins")]
    pub prune_interval_mins: u64,
    #[serde(default = "default_resource_type")]
    pub resource_type: String,
    #[serde(default = "default_mirror_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AlertConfig {
    /// No endpoint means the alert tier is skipped entirely.
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub project_key: String,
    #[serde(default = "default_alert_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TriageConfig {
    /// Failed-event scan lookback.
    #[serde(default = "default_triage_lookback_mins")]
    pub lookback_mins: i64,
    #[serde(default = "default_triage_batch_limit")]
    pub batch_limit: usize,
    /// Dedup window applied when no pattern matched.
    #[serde(default = "default_dedup_hours")]
    pub default_dedup_hours: u64,
    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,
    #[serde(default)]
    pub llm_api_key: String,
    #[serde(default = "default_llm_model")]
    pub llm_model: String,
    /// Explicit timeout raced against the classifier call.
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Recent same-component events attached per LLM candidate.
    #[serde(default = "default_context_events")]
    pub context_events: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Pending entries idle beyond this are stale.
    #[serde(default = "default_stale_pending_mins")]
    pub stale_pending_mins: u64,
    /// Destructive cleanup runs at most once per this window.
    #[serde(default = "default_cleanup_cooldown_mins")]
    pub cleanup_cooldown_mins: u64,
    #[serde(default = "default_queue_threshold")]
    pub queue_threshold: u64,
    #[serde(default = "default_stream_threshold")]
    pub stream_threshold: u64,
    #[serde(default = "default_pending_threshold")]
    pub pending_threshold: u64,
    /// Inbound-queue sample size for envelope validation.
    #[serde(default = "default_queue_sample_size")]
    pub queue_sample_size: usize,
    /// Stream entries older than this and unclaimed are trimmed.
    #[serde(default = "default_trim_age_hours")]
    pub trim_age_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InvestigatorConfig {
    /// Workflow runtime base URL for run-history queries.
    #[serde(default = "default_runtime_url")]
    pub runtime_url: String,
    #[serde(default = "default_inv_lookback_mins")]
    pub lookback_mins: i64,
    #[serde(default = "default_inv_max_runs")]
    pub max_runs: usize,
    #[serde(default = "default_inv_budget")]
    pub inspect_budget: usize,
    #[serde(default = "default_inspected_ttl_hours")]
    pub inspected_ttl_hours: u64,
    /// Function identifiers excluded from the sweep.
    #[serde(default)]
    pub legacy_function_ids: Vec<String>,
    /// Supervisor kick command used by restart_worker.
    #[serde(default = "default_restart_command")]
    pub restart_command: Vec<String>,
}

// Default functions
fn default_enabled() -> bool {
    true
}
fn default_debug_window_secs() -> u64 {
    60
}
fn default_debug_window_cap() -> u32 {
    12
}
fn default_drop_log_interval() -> u64 {
    25
}
fn default_search_url() -> String {
    "http://localhost:8108".to_string()
}
fn default_collection() -> String {
    "system_events".to_string()
}
fn default_search_timeout_ms() -> u64 {
    5000
}
fn default_mirror_url() -> String {
    "http://localhost:3030".to_string()
}
fn default_recency_window_mins() -> i64 {
    30
}
fn default_prune_interval_mins() -> u64 {
    15
}
fn default_resource_type() -> String {
    "system-event".to_string()
}
fn default_mirror_timeout_ms() -> u64 {
    5000
}
fn default_alert_timeout_ms() -> u64 {
    2500
}
fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}
fn default_triage_lookback_mins() -> i64 {
    60
}
fn default_triage_batch_limit() -> usize {
    200
}
fn default_dedup_hours() -> u64 {
    4
}
fn default_llm_endpoint() -> String {
    "http://localhost:11434/v1/chat/completions".to_string()
}
fn default_llm_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    30
}
fn default_context_events() -> usize {
    5
}
fn default_stale_pending_mins() -> u64 {
    15
}
fn default_cleanup_cooldown_mins() -> u64 {
    30
}
fn default_queue_threshold() -> u64 {
    500
}
fn default_stream_threshold() -> u64 {
    5000
}
fn default_pending_threshold() -> u64 {
    100
}
fn default_queue_sample_size() -> usize {
    20
}
fn default_trim_age_hours() -> i64 {
    24
}
fn default_runtime_url() -> String {
    "http://localhost:8288".to_string()
}
fn default_inv_lookback_mins() -> i64 {
    20
}
fn default_inv_max_runs() -> usize {
    40
}
fn default_inv_budget() -> usize {
    12
}
fn default_inspected_ttl_hours() -> u64 {
    6
}
fn default_restart_command() -> Vec<String> {
    vec![
        "launchctl".to_string(),
        "kickstart".to_string(),
        "-k".to_string(),
        "gui/501/com.pulse.worker".to_string(),
    ]
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            debug_window_secs: default_debug_window_secs(),
            debug_window_cap: default_debug_window_cap(),
            drop_log_interval: default_drop_log_interval(),
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            url: default_search_url(),
            api_key: String::new(),
            collection: default_collection(),
            timeout_ms: default_search_timeout_ms(),
        }
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            url: default_mirror_url(),
            recency_window_mins: default_recency_window_mins(),
            prune_interval_mins: default_prune_interval_mins(),
            resource_type: default_resource_type(),
            timeout_ms: default_mirror_timeout_ms(),
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            project_key: String::new(),
            timeout_ms: default_alert_timeout_ms(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Default for TriageConfig {
    fn default() -> Self {
        Self {
            lookback_mins: default_triage_lookback_mins(),
            batch_limit: default_triage_batch_limit(),
            default_dedup_hours: default_dedup_hours(),
            llm_endpoint: default_llm_endpoint(),
            llm_api_key: String::new(),
            llm_model: default_llm_model(),
            llm_timeout_secs: default_llm_timeout_secs(),
            context_events: default_context_events(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stale_pending_mins: default_stale_pending_mins(),
            cleanup_cooldown_mins: default_cleanup_cooldown_mins(),
            queue_threshold: default_queue_threshold(),
            stream_threshold: default_stream_threshold(),
            pending_threshold: default_pending_threshold(),
            queue_sample_size: default_queue_sample_size(),
            trim_age_hours: default_trim_age_hours(),
        }
    }
}

impl Default for InvestigatorConfig {
    fn default() -> Self {
        Self {
            runtime_url: default_runtime_url(),
            lookback_mins: default_inv_lookback_mins(),
            max_runs: default_inv_max_runs(),
            inspect_budget: default_inv_budget(),
            inspected_ttl_hours: default_inspected_ttl_hours(),
            legacy_function_ids: Vec::new(),
            restart_command: default_restart_command(),
        }
    }
}

impl AppConfig {
    /// Load configuration from `PULSE__`-prefixed environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(","),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
