use std::time::Duration;

use lockly_core::types::SlotId;

/// Default z2m base topic.
pub const DEFAULT_BASE_TOPIC: &str = "zigbee2mqtt";
/// Default seconds to wait for a device acknowledgement.
pub const DEFAULT_ACTION_TIMEOUT_SECS: u64 = 10;
/// Default number of republishes after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_FIRST_SLOT: SlotId = 1;
pub const DEFAULT_LAST_SLOT: SlotId = 20;
pub const DEFAULT_INSTALLATION: &str = "default";

/// Configuration of one Lockly installation.
///
/// Defaults suit a single z2m bridge with the stock base topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocklyConfig {
    /// Installation identifier; scopes the storage keys.
    pub installation: String,
    /// Flat z2m device names.
    pub lock_names: Vec<String>,
    /// Device handles resolved through the lock directory.
    pub lock_handles: Vec<String>,
    /// Group handle whose members are the managed locks.
    pub group_handle: Option<String>,
    pub first_slot: SlotId,
    pub last_slot: SlotId,
    /// Base MQTT topic of the bridge.
    pub base_topic: String,
    /// Wait per publish attempt before retrying.
    pub action_timeout: Duration,
    /// Republishes allowed after the first attempt.
    pub max_retries: u32,
    /// Finalize jobs right after fan-out instead of waiting for acks.
    pub skip_timeout: bool,
    /// Raw activity events retained.
    pub activity_capacity: usize,
}

impl Default for LocklyConfig {
    fn default() -> Self {
        Self {
            installation: DEFAULT_INSTALLATION.into(),
            lock_names: Vec::new(),
            lock_handles: Vec::new(),
            group_handle: None,
            first_slot: DEFAULT_FIRST_SLOT,
            last_slot: DEFAULT_LAST_SLOT,
            base_topic: DEFAULT_BASE_TOPIC.into(),
            action_timeout: Duration::from_secs(DEFAULT_ACTION_TIMEOUT_SECS),
            max_retries: DEFAULT_MAX_RETRIES,
            skip_timeout: false,
            activity_capacity: lockly_events::DEFAULT_CAPACITY,
        }
    }
}

impl LocklyConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                      | Default        |
    /// |------------------------------|----------------|
    /// | `LOCKLY_INSTALLATION`        | `default`      |
    /// | `LOCKLY_LOCK_NAMES`          | (empty)        |
    /// | `LOCKLY_LOCK_HANDLES`        | (empty)        |
    /// | `LOCKLY_GROUP_HANDLE`        | (none)         |
    /// | `LOCKLY_FIRST_SLOT`          | `1`            |
    /// | `LOCKLY_LAST_SLOT`           | `20`           |
    /// | `LOCKLY_MQTT_TOPIC`          | `zigbee2mqtt`  |
    /// | `LOCKLY_ACTION_TIMEOUT_SECS` | `10`           |
    /// | `LOCKLY_MAX_RETRIES`         | `3`            |
    /// | `LOCKLY_SKIP_TIMEOUT`        | `false`        |
    /// | `LOCKLY_ACTIVITY_CAPACITY`   | `100`          |
    ///
    /// List variables are comma-separated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let config = Self {
            installation: lookup("LOCKLY_INSTALLATION")
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.installation),
            lock_names: lookup("LOCKLY_LOCK_NAMES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            lock_handles: lookup("LOCKLY_LOCK_HANDLES")
                .map(|v| split_list(&v))
                .unwrap_or_default(),
            group_handle: lookup("LOCKLY_GROUP_HANDLE")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            first_slot: parse_var(&lookup, "LOCKLY_FIRST_SLOT", defaults.first_slot)?,
            last_slot: parse_var(&lookup, "LOCKLY_LAST_SLOT", defaults.last_slot)?,
            base_topic: lookup("LOCKLY_MQTT_TOPIC")
                .map(|v| v.trim().trim_end_matches('/').to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.base_topic),
            action_timeout: Duration::from_secs(parse_var(
                &lookup,
                "LOCKLY_ACTION_TIMEOUT_SECS",
                DEFAULT_ACTION_TIMEOUT_SECS,
            )?),
            max_retries: parse_var(&lookup, "LOCKLY_MAX_RETRIES", defaults.max_retries)?,
            skip_timeout: parse_var(&lookup, "LOCKLY_SKIP_TIMEOUT", false)?,
            activity_capacity: parse_var(
                &lookup,
                "LOCKLY_ACTIVITY_CAPACITY",
                defaults.activity_capacity,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.first_slot == 0 || self.first_slot > self.last_slot {
            return Err(ConfigError::InvalidSlotRange {
                first: self.first_slot,
                last: self.last_slot,
            });
        }
        Ok(())
    }

    pub fn slot_range(&self) -> std::ops::RangeInclusive<SlotId> {
        self.first_slot..=self.last_slot
    }

    /// Command topic of `device`.
    pub fn set_topic(&self, device: &str) -> String {
        format!("{}/{device}/set", self.base_topic)
    }

    pub fn slots_key(&self) -> String {
        lockly_store::slots_key(&self.installation)
    }

    pub fn activity_key(&self) -> String {
        lockly_store::activity_key(&self.installation)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(name) {
        Some(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::InvalidValue { name, value: raw })
        }
        _ => Ok(default),
    }
}

/// Errors raised while loading [`LocklyConfig`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    #[error("{name} has invalid value {value:?}")]
    InvalidValue { name: &'static str, value: String },

    /// The slot range is empty or starts at zero.
    #[error("Invalid slot range {first}-{last}")]
    InvalidSlotRange { first: SlotId, last: SlotId },
}
