// Mesh configuration - every tunable of the clustering core in one place
//
// Time values are deciseconds unless the name says otherwise; radio interval
// and window values are in 0.625 ms units as the GAP layer expects them.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Inbound mesh connection slots (we are peripheral), at most 7
    pub mesh_in_connections: u8,
    /// Outbound mesh connection slots (we are central), at most 31
    pub mesh_out_connections: u8,
    pub app_in_connections: u8,
    pub app_out_connections: u8,

    /// Per-lane capacity of a connection's send queue in bytes
    pub send_queue_bytes: usize,
    /// Maximum size of one reassembled message
    pub reassembly_buffer_bytes: usize,
    /// Per-write payload budget before MTU negotiation
    pub default_mtu: u16,
    /// Unreliable (write command) radio buffers per connection
    pub unreliable_buffer_count: u8,
    /// Reliable (write request) radio buffers per connection
    pub reliable_buffer_count: u8,
    /// Attempts per reliable record before the link is declared dead
    pub write_retry_count: u8,

    pub handshake_timeout_ds: u32,
    pub resolver_timeout_ds: u32,
    pub connecting_timeout_ds: u16,
    pub reestablish_timeout_sec: u16,

    /// Time between partner-selection attempts
    pub decision_interval_ds: u32,
    /// JOIN_ME entries older than this are stale
    pub max_neighbor_age_ds: u32,
    /// Decisions without any candidate before dropping to low duty
    pub no_nodes_found_threshold: u8,
    /// How long a failed partner is ignored
    pub blacklist_duration_ds: u32,
    /// Consecutive sightings of a better partner (with a free slot) required
    /// before sacrificing the worst existing link
    pub emergency_sightings_required: u8,

    pub adv_interval_units_high: u16,
    pub adv_interval_units_low: u16,
    pub scan_interval_units_high: u16,
    pub scan_window_units_high: u16,
    pub scan_interval_units_low: u16,
    pub scan_window_units_low: u16,
    /// Advertising slots the JOIN_ME job claims in the rotation
    pub join_me_adv_slots: u8,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mesh_in_connections: 2,
            mesh_out_connections: 3,
            app_in_connections: 1,
            app_out_connections: 1,

            send_queue_bytes: 512,
            reassembly_buffer_bytes: 256,
            default_mtu: 20,
            unreliable_buffer_count: 7,
            reliable_buffer_count: 1,
            write_retry_count: 3,

            handshake_timeout_ds: 60,
            resolver_timeout_ds: 20,
            connecting_timeout_ds: 30,
            reestablish_timeout_sec: 10,

            decision_interval_ds: 10,
            max_neighbor_age_ds: 100,
            no_nodes_found_threshold: 5,
            blacklist_duration_ds: 140,
            emergency_sightings_required: 2,

            adv_interval_units_high: 160,
            adv_interval_units_low: 1600,
            scan_interval_units_high: 64,
            scan_window_units_high: 32,
            scan_interval_units_low: 1600,
            scan_window_units_low: 16,
            join_me_adv_slots: 5,
        }
    }
}

impl MeshConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mesh_connections(mut self, inbound: u8, outbound: u8) -> Self {
        self.mesh_in_connections = inbound;
        self.mesh_out_connections = outbound;
        self
    }

    pub fn with_default_mtu(mut self, mtu: u16) -> Self {
        self.default_mtu = mtu;
        self
    }

    pub fn with_handshake_timeout_ds(mut self, timeout: u32) -> Self {
        self.handshake_timeout_ds = timeout;
        self
    }

    pub fn with_reestablish_timeout_sec(mut self, timeout: u16) -> Self {
        self.reestablish_timeout_sec = timeout;
        self
    }

    pub fn with_decision_interval_ds(mut self, interval: u32) -> Self {
        self.decision_interval_ds = interval;
        self
    }

    /// Total size of the connection slot pool
    pub fn total_connections(&self) -> usize {
        self.mesh_in_connections as usize
            + self.mesh_out_connections as usize
            + self.app_in_connections as usize
            + self.app_out_connections as usize
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.mesh_in_connections == 0 && self.mesh_out_connections == 0 {
            return Err(ConfigError::Invalid("no mesh connection slots"));
        }
        if self.mesh_in_connections > 7 {
            return Err(ConfigError::Invalid(
                "mesh_in_connections exceeds the 3-bit beacon field",
            ));
        }
        if self.mesh_out_connections > 31 {
            return Err(ConfigError::Invalid(
                "mesh_out_connections exceeds the 5-bit beacon field",
            ));
        }
        if self.default_mtu < 8 {
            return Err(ConfigError::Invalid("mtu too small for a packet header"));
        }
        if self.scan_window_units_high > self.scan_interval_units_high
            || self.scan_window_units_low > self.scan_interval_units_low
        {
            return Err(ConfigError::Invalid("scan window larger than interval"));
        }
        if self.write_retry_count == 0 {
            return Err(ConfigError::Invalid("write_retry_count must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(MeshConfig::default().validate().is_ok());
    }

    #[test]
    fn test_total_connections() {
        let config = MeshConfig::default();
        assert_eq!(
            config.total_connections(),
            (config.mesh_in_connections
                + config.mesh_out_connections
                + config.app_in_connections
                + config.app_out_connections) as usize
        );
    }

    #[test]
    fn test_validate_rejects_beacon_overflow() {
        let config = MeshConfig::default().with_mesh_connections(8, 3);
        assert!(config.validate().is_err());

        let config = MeshConfig::default().with_mesh_connections(1, 32);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_tiny_mtu() {
        let config = MeshConfig::default().with_default_mtu(5);
        assert!(config.validate().is_err());
    }
}
