//! Configuration loading and validation for failoverd

use failover::types::{
    DEFAULT_PROBE_TIMEOUT, DEFAULT_REMOTE_TIMEOUT, DEFAULT_START_DELAY, DEFAULT_TICK,
    MAX_ADAPTERS,
};
use failover::{AdapterBinding, EngineSettings};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use validator::{Validate, ValidationError};

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] validator::ValidationErrors),

    #[error("Invalid engine settings: {0}")]
    EngineError(#[from] common::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeSettings,

    #[serde(default)]
    pub adapters: Vec<AdapterSettings>,

    #[serde(default)]
    pub timing: TimingSettings,

    #[serde(default)]
    pub network: NetworkSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), validator::ValidationErrors> {
        self.node.validate()?;
        validate_adapter_list(&self.adapters)?;
        for adapter in &self.adapters {
            adapter.validate()?;
        }
        self.timing.validate()?;
        self.network.validate()?;
        self.logging.validate()?;
        Ok(())
    }
}

/// Identity and heartbeat endpoints of this node
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct NodeSettings {
    #[validate(length(min = 1, max = 64), custom = "validate_node_id")]
    pub id: String,

    /// Local heartbeat/control endpoint
    pub listen: SocketAddr,

    /// Peer heartbeat endpoint
    pub peer: SocketAddr,
}

/// One monitored adapter; its position in the list is its membership bit
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdapterSettings {
    /// Address identifying the physical adapter
    pub ip: IpAddr,

    /// Virtual address owned by the active node
    pub virtual_ip: IpAddr,

    #[validate(range(min = 1, max = 128))]
    #[serde(default = "default_prefix_len")]
    pub prefix_len: u8,
}

/// Timer settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct TimingSettings {
    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_tick")]
    pub tick: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_start_delay")]
    pub start_delay: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_remote_timeout")]
    pub remote_timeout: Duration,

    #[serde(with = "humantime_serde")]
    #[validate(custom = "validate_probe_timeout")]
    pub probe_timeout: Duration,
}

/// Which network collaborator drives the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    /// In-memory adapters, nothing touches the host
    Simulated,
    /// Operator-supplied shell commands
    Command,
}

/// Network collaborator settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
#[validate(schema(function = "validate_network"))]
pub struct NetworkSettings {
    pub mode: NetworkMode,

    /// Operational adapters in simulated mode, counted from the first
    #[validate(range(max = 8))]
    pub simulated_adapters: u8,

    pub commands: CommandTemplates,
}

/// Shell command templates for the command collaborator.
///
/// Placeholders: `{ip}` and `{prefix}` for the address, `{index}` for the
/// adapter index, `{adapter}` for the adapter address.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplates {
    /// Assign `{ip}/{prefix}` to adapter `{index}`
    pub assign: String,

    /// Remove `{ip}`
    pub clear: String,

    /// Exit 0 when `{adapter}` is up; may print the adapter index
    pub health: String,

    /// Exit 0 when `{ip}` answers
    pub probe: String,

    /// Flush the neighbor cache; optional
    pub flush: Option<String>,

    /// Upper bound for any single command
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct LoggingSettings {
    pub level: Option<String>,

    #[validate(custom = "validate_log_format")]
    pub format: Option<String>,
}

// Default implementations

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            id: "failover".to_string(),
            listen: SocketAddr::from(([0, 0, 0, 0], 7001)),
            peer: SocketAddr::from(([127, 0, 0, 1], 7002)),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            tick: DEFAULT_TICK,
            start_delay: DEFAULT_START_DELAY,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            mode: NetworkMode::Simulated,
            simulated_adapters: MAX_ADAPTERS as u8,
            commands: CommandTemplates::default(),
        }
    }
}

impl Default for CommandTemplates {
    fn default() -> Self {
        Self {
            assign: String::new(),
            clear: String::new(),
            health: String::new(),
            probe: String::new(),
            flush: None,
            timeout: Duration::from_secs(5),
        }
    }
}

fn default_prefix_len() -> u8 {
    24
}

// Custom validators

fn validate_node_id(id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::new("node_id_empty"));
    }
    if id.chars().any(char::is_whitespace) {
        return Err(ValidationError::new("node_id_whitespace"));
    }
    Ok(())
}

fn validate_adapter_list(adapters: &[AdapterSettings]) -> Result<(), validator::ValidationErrors> {
    let mut errors = validator::ValidationErrors::new();
    if adapters.len() < 2 || adapters.len() > MAX_ADAPTERS {
        errors.add("adapters", ValidationError::new("adapter_count_out_of_range"));
    }
    for (i, a) in adapters.iter().enumerate() {
        if adapters[..i].iter().any(|b| b.virtual_ip == a.virtual_ip) {
            errors.add("adapters", ValidationError::new("duplicate_virtual_ip"));
        }
    }
    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn millis_in(value: &Duration, min: u128, max: u128, code: &'static str) -> Result<(), ValidationError> {
    let millis = value.as_millis();
    if millis < min || millis > max {
        return Err(ValidationError::new(code));
    }
    Ok(())
}

fn validate_tick(tick: &Duration) -> Result<(), ValidationError> {
    millis_in(tick, 10, 60_000, "tick_out_of_range")
}

fn validate_start_delay(delay: &Duration) -> Result<(), ValidationError> {
    millis_in(delay, 1, 300_000, "start_delay_out_of_range")
}

fn validate_remote_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    millis_in(timeout, 10, 600_000, "remote_timeout_out_of_range")
}

fn validate_probe_timeout(timeout: &Duration) -> Result<(), ValidationError> {
    millis_in(timeout, 1, 60_000, "probe_timeout_out_of_range")
}

fn validate_network(network: &NetworkSettings) -> Result<(), ValidationError> {
    if network.mode != NetworkMode::Command {
        return Ok(());
    }
    let c = &network.commands;
    if [&c.assign, &c.clear, &c.health, &c.probe]
        .iter()
        .any(|t| t.trim().is_empty())
    {
        return Err(ValidationError::new("command_template_missing"));
    }
    if !c.assign.contains("{ip}") || !c.clear.contains("{ip}") || !c.probe.contains("{ip}") {
        return Err(ValidationError::new("command_template_without_ip"));
    }
    if c.timeout.is_zero() {
        return Err(ValidationError::new("command_timeout_zero"));
    }
    Ok(())
}

fn validate_log_format(format: &str) -> Result<(), ValidationError> {
    match format {
        "text" | "json" => Ok(()),
        _ => Err(ValidationError::new("log_format_unknown")),
    }
}

// Configuration loading implementation

impl Config {
    /// Load from `path` when given, otherwise from the default search paths
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) if !path.is_file() => Err(ConfigError::FileNotFound(path.to_path_buf())),
            Some(path) => Self::load_from_file(path),
            None => Self::load(),
        }
    }

    /// Load configuration from default search paths
    pub fn load() -> Result<Self, ConfigError> {
        match Self::find_config_file() {
            Some(path) => {
                tracing::info!("Loading configuration from: {}", path.display());
                Self::load_from_file(&path)
            }
            None => {
                tracing::info!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_yaml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/failover/failoverd.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./failoverd.yaml"));

        paths.into_iter().find(|p: &PathBuf| p.is_file())
    }

    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/failover/failoverd.yaml"))
    }

    /// Whether logs should be emitted as JSON
    pub fn json_logs(&self) -> bool {
        self.logging.format.as_deref() == Some("json")
    }

    /// Convert to the engine's immutable settings
    pub fn to_engine_settings(&self) -> Result<EngineSettings, ConfigError> {
        let settings = EngineSettings {
            node_id: self.node.id.clone(),
            local_addr: self.node.listen,
            peer_addr: self.node.peer,
            bindings: self
                .adapters
                .iter()
                .enumerate()
                .map(|(position, a)| AdapterBinding::new(position, a.ip, a.virtual_ip, a.prefix_len))
                .collect(),
            tick: self.timing.tick,
            start_delay: self.timing.start_delay,
            remote_timeout: self.timing.remote_timeout,
            probe_timeout: self.timing.probe_timeout,
        };
        settings.validate()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAIR: &str = r#"
node:
  id: node-a
  listen: "10.0.0.1:7001"
  peer: "10.0.0.2:7001"

adapters:
  - ip: 10.12.90.1
    virtual_ip: 10.12.90.88
  - ip: 10.20.90.1
    virtual_ip: 10.20.90.88
    prefix_len: 16
"#;

    fn parse(yaml: &str) -> Config {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_default_config_needs_adapters() {
        let config = Config::default();
        assert!(config.validate().is_err());
        assert!(config.to_engine_settings().is_err());
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = parse(PAIR);
        assert!(config.validate().is_ok());

        assert_eq!(config.timing.tick, Duration::from_secs(1));
        assert_eq!(config.timing.remote_timeout, Duration::from_secs(5));
        assert_eq!(config.network.mode, NetworkMode::Simulated);
        assert_eq!(config.adapters[0].prefix_len, 24);
        assert_eq!(config.adapters[1].prefix_len, 16);
        assert!(!config.json_logs());
    }

    #[test]
    fn test_conversion_assigns_membership_bits_by_position() {
        let settings = parse(PAIR).to_engine_settings().unwrap();

        assert_eq!(settings.node_id, "node-a");
        assert_eq!(settings.peer_addr, "10.0.0.2:7001".parse().unwrap());
        assert_eq!(settings.bindings.len(), 2);
        assert_eq!(settings.bindings[0].adapter_mask, 0b01);
        assert_eq!(settings.bindings[1].adapter_mask, 0b10);
        assert_eq!(settings.bindings[1].virtual_ip, "10.20.90.88".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_humantime_serde_parsing() {
        let yaml = format!(
            "{PAIR}
timing:
  tick: 250ms
  start_delay: 2s
  remote_timeout: 1s
  probe_timeout: 100ms
"
        );
        let config = parse(&yaml);
        assert!(config.validate().is_ok());
        assert_eq!(config.timing.tick, Duration::from_millis(250));
        assert_eq!(config.timing.start_delay, Duration::from_secs(2));
        assert_eq!(config.timing.probe_timeout, Duration::from_millis(100));
    }

    #[test]
    fn test_invalid_tick() {
        let yaml = format!("{PAIR}\ntiming:\n  tick: 5ms  # Invalid: < 10ms\n");
        assert!(parse(&yaml).validate().is_err());

        let yaml = format!("{PAIR}\ntiming:\n  tick: 2m  # Invalid: > 60s\n");
        assert!(parse(&yaml).validate().is_err());
    }

    #[test]
    fn test_adapter_count_bounds() {
        let one = r#"
adapters:
  - ip: 10.12.90.1
    virtual_ip: 10.12.90.88
"#;
        assert!(parse(one).validate().is_err());

        let mut config = parse(PAIR);
        for i in 0..7u8 {
            config.adapters.push(AdapterSettings {
                ip: IpAddr::from([10, 30 + i, 0, 1]),
                virtual_ip: IpAddr::from([10, 30 + i, 0, 88]),
                prefix_len: 24,
            });
        }
        assert_eq!(config.adapters.len(), 9);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_duplicate_virtual_ip_rejected() {
        let yaml = r#"
adapters:
  - ip: 10.12.90.1
    virtual_ip: 10.12.90.88
  - ip: 10.20.90.1
    virtual_ip: 10.12.90.88
"#;
        assert!(parse(yaml).validate().is_err());
    }

    #[test]
    fn test_command_mode_requires_templates() {
        let yaml = format!("{PAIR}\nnetwork:\n  mode: command\n");
        assert!(parse(&yaml).validate().is_err());

        let yaml = format!(
            r#"{PAIR}
network:
  mode: command
  commands:
    assign: "ip addr add {{ip}}/{{prefix}} dev eth{{index}}"
    clear: "ip addr del {{ip}}"
    health: "ip -o addr show to {{adapter}} | grep -q UP"
    probe: "arping -c 1 -w 1 {{ip}}"
    timeout: 3s
"#
        );
        let config = parse(&yaml);
        assert!(config.validate().is_ok());
        assert_eq!(config.network.mode, NetworkMode::Command);
        assert!(config.network.commands.flush.is_none());
        assert_eq!(config.network.commands.timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_node_id_validation() {
        assert!(validate_node_id("node-a").is_ok());
        assert!(validate_node_id("").is_err());
        assert!(validate_node_id("   ").is_err());
        assert!(validate_node_id("node a").is_err());
    }

    #[test]
    fn test_log_format_validation() {
        let yaml = format!("{PAIR}\nlogging:\n  level: debug\n  format: json\n");
        let config = parse(&yaml);
        assert!(config.validate().is_ok());
        assert!(config.json_logs());

        let yaml = format!("{PAIR}\nlogging:\n  format: xml\n");
        assert!(parse(&yaml).validate().is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let missing = Path::new("/nonexistent/failoverd.yaml");
        assert!(matches!(
            Config::resolve(Some(missing)),
            Err(ConfigError::FileNotFound(_))
        ));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("failoverd.yaml");
        std::fs::write(&path, PAIR).unwrap();

        let config = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.node.id, "node-a");

        std::fs::write(&path, "adapters: [").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::ParseError(_))
        ));
    }
}
