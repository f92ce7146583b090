//! Link manager configuration
//!
//! Pool capacities, per-transport controller descriptors, allocator
//! constants and every timer duration the link state machine arms.

use crate::link::types::{LinkRole, TransportKind};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Smallest ACL payload a controller may advertise
const MIN_ACL_MTU: u16 = 23;

/// LE controllers report their buffer count in a single byte
const MAX_LE_BUFFERS: u16 = 255;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Link pool capacity must be > 0")]
    ZeroLinkCapacity,

    #[error("Channel pool capacity must be > 0")]
    ZeroChannelCapacity,

    #[error("Invalid ACL MTU for {transport:?}: {mtu}")]
    InvalidMtu { transport: TransportKind, mtu: u16 },

    #[error("Invalid ACL buffer count for {transport:?}: {buffers}")]
    InvalidBufferCount { transport: TransportKind, buffers: u16 },

    #[error("Invalid timeout '{0}': must be > 0")]
    InvalidTimeout(&'static str),

    #[error("High priority quota must be > 0")]
    ZeroHighPriorityQuota,

    #[error("Malformed configuration: {0}")]
    Malformed(String),
}

// ============================================================================
// TRANSPORT DESCRIPTOR
// ============================================================================

/// Controller capabilities for one transport kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportDescriptor {
    /// Largest ACL payload the controller accepts in one packet
    pub mtu: u16,
    /// Number of ACL buffers the controller reported
    pub buffers: u16,
}

impl TransportDescriptor {
    pub fn classic() -> Self {
        Self {
            mtu: 1021,
            buffers: 8,
        }
    }

    pub fn low_energy() -> Self {
        Self {
            mtu: 251,
            buffers: 8,
        }
    }
}

// ============================================================================
// TIMEOUTS
// ============================================================================

/// Timer durations in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkTimeouts {
    pub connect_ms: u64,
    /// Connect timer once the remote asked for a PIN
    pub connect_extended_ms: u64,
    /// Idle timer after connect when no channel is attached yet
    pub startup_ms: u64,
    /// Idle timer after the last channel detaches
    pub idle_ms: u64,
    pub echo_ms: u64,
    pub disconnect_ms: u64,
    pub flow_control_ms: u64,
    /// Retry when the disconnect command could not be issued
    pub no_resources_retry_ms: u64,
    pub info_response_ms: u64,
    pub security_delay_check_ms: u64,
}

impl Default for LinkTimeouts {
    fn default() -> Self {
        Self {
            connect_ms: 60_000,
            connect_extended_ms: 120_000,
            startup_ms: 60_000,
            idle_ms: 4_000,
            echo_ms: 30_000,
            disconnect_ms: 30_000,
            flow_control_ms: 2_000,
            no_resources_retry_ms: 1_000,
            info_response_ms: 3_000,
            security_delay_check_ms: 2_000,
        }
    }
}

impl LinkTimeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn connect_extended(&self) -> Duration {
        Duration::from_millis(self.connect_extended_ms)
    }
    pub fn startup(&self) -> Duration {
        Duration::from_millis(self.startup_ms)
    }
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
    pub fn echo(&self) -> Duration {
        Duration::from_millis(self.echo_ms)
    }
    pub fn disconnect(&self) -> Duration {
        Duration::from_millis(self.disconnect_ms)
    }
    pub fn flow_control(&self) -> Duration {
        Duration::from_millis(self.flow_control_ms)
    }
    pub fn no_resources_retry(&self) -> Duration {
        Duration::from_millis(self.no_resources_retry_ms)
    }
    pub fn info_response(&self) -> Duration {
        Duration::from_millis(self.info_response_ms)
    }
    pub fn security_delay_check(&self) -> Duration {
        Duration::from_millis(self.security_delay_check_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let checks: [(&'static str, u64); 10] = [
            ("connect_ms", self.connect_ms),
            ("connect_extended_ms", self.connect_extended_ms),
            ("startup_ms", self.startup_ms),
            ("idle_ms", self.idle_ms),
            ("echo_ms", self.echo_ms),
            ("disconnect_ms", self.disconnect_ms),
            ("flow_control_ms", self.flow_control_ms),
            ("no_resources_retry_ms", self.no_resources_retry_ms),
            ("info_response_ms", self.info_response_ms),
            ("security_delay_check_ms", self.security_delay_check_ms),
        ];
        for (name, value) in checks {
            if value == 0 {
                return Err(ConfigError::InvalidTimeout(name));
            }
        }
        Ok(())
    }
}

// ============================================================================
// LINK MANAGER CONFIG
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkManagerConfig {
    /// Link pool capacity (simultaneous physical links)
    pub max_links: usize,
    /// Channel pool capacity
    pub max_channels: usize,
    /// Fixed-channel slots per link
    pub fixed_channel_slots: usize,
    pub classic: TransportDescriptor,
    pub low_energy: TransportDescriptor,
    /// Starting per-link quota for high priority links
    pub high_priority_quota: u16,
    /// Channel buffer quota per unit of data-rate hint
    pub channel_buffer_unit: u32,
    /// Role requested on inbound connections when nothing else decides it
    pub preferred_role: LinkRole,
    /// Ask a peripheral-role link to switch to central before paging
    pub role_switch_before_connect: bool,
    pub timeouts: LinkTimeouts,
}

impl Default for LinkManagerConfig {
    fn default() -> Self {
        Self {
            max_links: 7,
            max_channels: 16,
            fixed_channel_slots: 3,
            classic: TransportDescriptor::classic(),
            low_energy: TransportDescriptor::low_energy(),
            high_priority_quota: 5,
            channel_buffer_unit: 100,
            preferred_role: LinkRole::Peripheral,
            role_switch_before_connect: true,
            timeouts: LinkTimeouts::default(),
        }
    }
}

impl LinkManagerConfig {
    /// Parse from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| ConfigError::Malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_max_links(mut self, max_links: usize) -> Self {
        self.max_links = max_links;
        self
    }

    pub fn with_max_channels(mut self, max_channels: usize) -> Self {
        self.max_channels = max_channels;
        self
    }

    pub fn with_transport(mut self, transport: TransportKind, desc: TransportDescriptor) -> Self {
        match transport {
            TransportKind::Classic => self.classic = desc,
            TransportKind::LowEnergy => self.low_energy = desc,
        }
        self
    }

    pub fn with_high_priority_quota(mut self, quota: u16) -> Self {
        self.high_priority_quota = quota;
        self
    }

    pub fn with_preferred_role(mut self, role: LinkRole) -> Self {
        self.preferred_role = role;
        self
    }

    pub fn with_role_switch_before_connect(mut self, enabled: bool) -> Self {
        self.role_switch_before_connect = enabled;
        self
    }

    pub fn with_timeouts(mut self, timeouts: LinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn descriptor(&self, transport: TransportKind) -> TransportDescriptor {
        match transport {
            TransportKind::Classic => self.classic,
            TransportKind::LowEnergy => self.low_energy,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_links == 0 {
            return Err(ConfigError::ZeroLinkCapacity);
        }
        if self.max_channels == 0 {
            return Err(ConfigError::ZeroChannelCapacity);
        }
        if self.high_priority_quota == 0 {
            return Err(ConfigError::ZeroHighPriorityQuota);
        }
        for transport in TransportKind::ALL {
            let desc = self.descriptor(transport);
            if desc.mtu < MIN_ACL_MTU {
                return Err(ConfigError::InvalidMtu {
                    transport,
                    mtu: desc.mtu,
                });
            }
            let max_buffers = match transport {
                TransportKind::Classic => u16::MAX,
                TransportKind::LowEnergy => MAX_LE_BUFFERS,
            };
            if desc.buffers == 0 || desc.buffers > max_buffers {
                return Err(ConfigError::InvalidBufferCount {
                    transport,
                    buffers: desc.buffers,
                });
            }
        }
        self.timeouts.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = LinkManagerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_links, 7);
        assert_eq!(config.high_priority_quota, 5);
        assert_eq!(config.timeouts.flow_control(), Duration::from_secs(2));
    }

    #[test]
    fn test_builder_overrides() {
        let config = LinkManagerConfig::default()
            .with_max_links(2)
            .with_high_priority_quota(2)
            .with_transport(
                TransportKind::Classic,
                TransportDescriptor { mtu: 100, buffers: 4 },
            );
        assert_eq!(config.max_links, 2);
        assert_eq!(config.descriptor(TransportKind::Classic).buffers, 4);
        assert_eq!(config.descriptor(TransportKind::LowEnergy).mtu, 251);
    }

    #[test]
    fn test_validation_rejects_zero_links() {
        let config = LinkManagerConfig::default().with_max_links(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroLinkCapacity));
    }

    #[test]
    fn test_validation_rejects_tiny_mtu() {
        let config = LinkManagerConfig::default().with_transport(
            TransportKind::LowEnergy,
            TransportDescriptor { mtu: 10, buffers: 4 },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMtu { mtu: 10, .. })
        ));
    }

    #[test]
    fn test_validation_rejects_bad_buffer_count() {
        let config = LinkManagerConfig::default().with_transport(
            TransportKind::Classic,
            TransportDescriptor { mtu: 339, buffers: 0 },
        );
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidBufferCount {
                transport: TransportKind::Classic,
                buffers: 0,
            })
        );

        let config = LinkManagerConfig::default().with_transport(
            TransportKind::LowEnergy,
            TransportDescriptor { mtu: 251, buffers: 300 },
        );
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBufferCount { buffers: 300, .. })
        ));

        let config = LinkManagerConfig::default().with_transport(
            TransportKind::Classic,
            TransportDescriptor { mtu: 339, buffers: 300 },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_timeout() {
        let timeouts = LinkTimeouts {
            echo_ms: 0,
            ..LinkTimeouts::default()
        };
        let config = LinkManagerConfig::default().with_timeouts(timeouts);
        assert_eq!(config.validate(), Err(ConfigError::InvalidTimeout("echo_ms")));
    }

    #[test]
    fn test_from_json_partial() {
        let config = LinkManagerConfig::from_json(
            r#"{ "max_links": 3, "classic": { "mtu": 339, "buffers": 10 } }"#,
        )
        .expect("valid json");
        assert_eq!(config.max_links, 3);
        assert_eq!(config.classic.buffers, 10);
        assert_eq!(config.max_channels, 16);
    }

    #[test]
    fn test_from_json_malformed() {
        let result = LinkManagerConfig::from_json("{ not json");
        assert!(matches!(result, Err(ConfigError::Malformed(_))));
    }
}
