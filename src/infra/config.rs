//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/portal.toml

use anyhow::{ensure, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use tracing::warn;

pub const DEFAULT_CONFIG_PATH: &str = "config/portal.toml";

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    /// Ingress subscription filter
    pub topic: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchwaysConfig {
    #[serde(default = "default_archway_ids")]
    pub ids: Vec<u8>,
}

impl Default for ArchwaysConfig {
    fn default() -> Self {
        Self { ids: default_archway_ids() }
    }
}

fn default_archway_ids() -> Vec<u8> {
    vec![1, 2]
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PresenceSection {
    pub trigger_in: f64,
    pub release_in: f64,
    pub hard_min_in: f64,
    pub max_in: f64,
    pub present_samples: u32,
    pub absent_samples: u32,
}

impl Default for PresenceSection {
    fn default() -> Self {
        Self {
            trigger_in: 13.0,
            release_in: 20.0,
            hard_min_in: 6.0,
            max_in: 254.0,
            present_samples: 1,
            absent_samples: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture window duration
    pub window_ms: u64,
    /// Longest wait for a window before `window-timeout`
    pub max_wait_ms: u64,
    /// Quiet interval between consecutive windows
    pub guard_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { window_ms: 2000, max_wait_ms: 5000, guard_ms: 200 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub near_duplicate_distance: usize,
    pub confidence_tie_epsilon: f32,
    pub min_confidence: f32,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self { near_duplicate_distance: 1, confidence_tie_epsilon: 0.05, min_confidence: 0.25 }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ManifestConfig {
    /// Manifest text file loaded at startup
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub interval_secs: u64,
    /// Prometheus metrics HTTP port (0 to disable)
    #[serde(default = "default_prometheus_port")]
    pub prometheus_port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: 10, prometheus_port: default_prometheus_port() }
    }
}

fn default_prometheus_port() -> u16 {
    9090
}

#[derive(Debug, Clone, Deserialize)]
pub struct EgressConfig {
    /// File path for session report egress (JSONL format)
    #[serde(default = "default_egress_file")]
    pub file: String,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self { file: default_egress_file() }
    }
}

fn default_egress_file() -> String {
    "sessions.jsonl".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttEgressConfig {
    /// Enable MQTT egress publishing
    #[serde(default = "default_mqtt_egress_enabled")]
    pub enabled: bool,
    /// Topic for session reports (QoS 1)
    #[serde(default = "default_results_topic")]
    pub results_topic: String,
    /// Topic for periodic metrics snapshots (QoS 0)
    #[serde(default = "default_metrics_topic")]
    pub metrics_topic: String,
    /// Interval for publishing metrics (seconds)
    #[serde(default = "default_metrics_publish_interval")]
    pub metrics_publish_interval_secs: u64,
}

impl Default for MqttEgressConfig {
    fn default() -> Self {
        Self {
            enabled: default_mqtt_egress_enabled(),
            results_topic: default_results_topic(),
            metrics_topic: default_metrics_topic(),
            metrics_publish_interval_secs: default_metrics_publish_interval(),
        }
    }
}

fn default_mqtt_egress_enabled() -> bool {
    true
}

fn default_results_topic() -> String {
    "portal/results".to_string()
}

fn default_metrics_topic() -> String {
    "portal/metrics".to_string()
}

fn default_metrics_publish_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_enabled")]
    pub enabled: bool,
    #[serde(default = "default_broker_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
}

fn default_broker_enabled() -> bool {
    true
}

fn default_broker_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_broker_port() -> u16 {
    1883
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            enabled: default_broker_enabled(),
            bind_address: default_broker_bind_address(),
            port: default_broker_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier (e.g., "dock-3")
    #[serde(default = "default_site_id")]
    pub id: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self { id: default_site_id() }
    }
}

fn default_site_id() -> String {
    "portal".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct TomlConfig {
    #[serde(default)]
    pub site: SiteConfig,
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub archways: ArchwaysConfig,
    #[serde(default)]
    pub presence: PresenceSection,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub manifest: ManifestConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub egress: EgressConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub mqtt_egress: MqttEgressConfig,
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    site_id: String,
    mqtt_host: String,
    mqtt_port: u16,
    mqtt_topic: String,
    mqtt_username: Option<String>,
    mqtt_password: Option<String>,
    archway_ids: Vec<u8>,
    presence: PresenceSection,
    capture: CaptureConfig,
    reconcile: ReconcileSection,
    manifest_file: Option<String>,
    metrics_interval_secs: u64,
    prometheus_port: u16,
    config_file: String,
    egress_file: String,
    broker_enabled: bool,
    broker_bind_address: String,
    broker_port: u16,
    mqtt_egress_enabled: bool,
    mqtt_egress_results_topic: String,
    mqtt_egress_metrics_topic: String,
    mqtt_egress_metrics_interval_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            site_id: default_site_id(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_topic: "portal/in/#".to_string(),
            mqtt_username: None,
            mqtt_password: None,
            archway_ids: default_archway_ids(),
            presence: PresenceSection::default(),
            capture: CaptureConfig::default(),
            reconcile: ReconcileSection::default(),
            manifest_file: None,
            metrics_interval_secs: 10,
            prometheus_port: default_prometheus_port(),
            config_file: "default".to_string(),
            egress_file: default_egress_file(),
            broker_enabled: default_broker_enabled(),
            broker_bind_address: default_broker_bind_address(),
            broker_port: default_broker_port(),
            mqtt_egress_enabled: default_mqtt_egress_enabled(),
            mqtt_egress_results_topic: default_results_topic(),
            mqtt_egress_metrics_topic: default_metrics_topic(),
            mqtt_egress_metrics_interval_secs: default_metrics_publish_interval(),
        }
    }
}

impl Config {
    /// Determine config file path from the command line or environment
    pub fn resolve_config_path(cli_path: Option<&str>) -> String {
        if let Some(path) = cli_path {
            return path.to_string();
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        DEFAULT_CONFIG_PATH.to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let toml_config: TomlConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        let config = Self {
            site_id: toml_config.site.id,
            mqtt_host: toml_config.mqtt.host,
            mqtt_port: toml_config.mqtt.port,
            mqtt_topic: toml_config.mqtt.topic,
            mqtt_username: toml_config.mqtt.username,
            mqtt_password: toml_config.mqtt.password,
            archway_ids: toml_config.archways.ids,
            presence: toml_config.presence,
            capture: toml_config.capture,
            reconcile: toml_config.reconcile,
            manifest_file: toml_config.manifest.file.filter(|f| !f.trim().is_empty()),
            metrics_interval_secs: toml_config.metrics.interval_secs,
            prometheus_port: toml_config.metrics.prometheus_port,
            config_file: path.display().to_string(),
            egress_file: toml_config.egress.file,
            broker_enabled: toml_config.broker.enabled,
            broker_bind_address: toml_config.broker.bind_address,
            broker_port: toml_config.broker.port,
            mqtt_egress_enabled: toml_config.mqtt_egress.enabled,
            mqtt_egress_results_topic: toml_config.mqtt_egress.results_topic,
            mqtt_egress_metrics_topic: toml_config.mqtt_egress.metrics_topic,
            mqtt_egress_metrics_interval_secs: toml_config.mqtt_egress.metrics_publish_interval_secs,
        };

        config.validate().with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a path, falling back to defaults
    pub fn load_from_path(path: &str) -> Self {
        match Self::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "config_load_failed_using_defaults");
                Self::default()
            }
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        ensure!(!self.archway_ids.is_empty(), "archways.ids must not be empty");
        ensure!(self.capture.window_ms > 0, "capture.window_ms must be > 0");
        ensure!(
            self.presence.release_in >= self.presence.trigger_in,
            "presence.release_in ({}) must be >= presence.trigger_in ({})",
            self.presence.release_in,
            self.presence.trigger_in
        );
        ensure!(
            (0.0..=1.0).contains(&self.reconcile.min_confidence),
            "reconcile.min_confidence must be within 0.0..=1.0"
        );
        ensure!(self.reconcile.confidence_tie_epsilon >= 0.0, "reconcile.confidence_tie_epsilon must be >= 0");
        Ok(())
    }

    // Getters for all config fields
    pub fn site_id(&self) -> &str {
        &self.site_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt_host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt_port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt_topic
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt_username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt_password.as_deref()
    }

    pub fn archway_ids(&self) -> &[u8] {
        &self.archway_ids
    }

    pub fn presence_trigger_in(&self) -> f64 {
        self.presence.trigger_in
    }

    pub fn presence_release_in(&self) -> f64 {
        self.presence.release_in
    }

    pub fn presence_hard_min_in(&self) -> f64 {
        self.presence.hard_min_in
    }

    pub fn presence_max_in(&self) -> f64 {
        self.presence.max_in
    }

    pub fn presence_present_samples(&self) -> u32 {
        self.presence.present_samples
    }

    pub fn presence_absent_samples(&self) -> u32 {
        self.presence.absent_samples
    }

    pub fn window_ms(&self) -> u64 {
        self.capture.window_ms
    }

    pub fn max_wait_ms(&self) -> u64 {
        self.capture.max_wait_ms
    }

    pub fn guard_ms(&self) -> u64 {
        self.capture.guard_ms
    }

    pub fn near_duplicate_distance(&self) -> usize {
        self.reconcile.near_duplicate_distance
    }

    pub fn confidence_tie_epsilon(&self) -> f32 {
        self.reconcile.confidence_tie_epsilon
    }

    pub fn min_confidence(&self) -> f32 {
        self.reconcile.min_confidence
    }

    pub fn manifest_file(&self) -> Option<&str> {
        self.manifest_file.as_deref()
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn prometheus_port(&self) -> u16 {
        self.prometheus_port
    }

    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn egress_file(&self) -> &str {
        &self.egress_file
    }

    pub fn broker_enabled(&self) -> bool {
        self.broker_enabled
    }

    pub fn broker_bind_address(&self) -> &str {
        &self.broker_bind_address
    }

    pub fn broker_port(&self) -> u16 {
        self.broker_port
    }

    // MQTT Egress getters
    pub fn mqtt_egress_enabled(&self) -> bool {
        self.mqtt_egress_enabled
    }

    pub fn mqtt_egress_results_topic(&self) -> &str {
        &self.mqtt_egress_results_topic
    }

    pub fn mqtt_egress_metrics_topic(&self) -> &str {
        &self.mqtt_egress_metrics_topic
    }

    pub fn mqtt_egress_metrics_interval_secs(&self) -> u64 {
        self.mqtt_egress_metrics_interval_secs
    }

    /// Builder method for tests to set capture timings
    pub fn with_capture(mut self, window_ms: u64, guard_ms: u64, max_wait_ms: u64) -> Self {
        self.capture = CaptureConfig { window_ms, max_wait_ms, guard_ms };
        self
    }

    /// Builder method for tests to set the egress file
    pub fn with_egress_file(mut self, file: &str) -> Self {
        self.egress_file = file.to_string();
        self
    }
}
