//! Configuration schema for the Core protocol transport.
//!
//! This module only defines and validates the schema; loading it from a
//! document format is the out-of-scope config manager collaborator. Every
//! type derives `serde::{Serialize, Deserialize}` so an embedder can hang
//! whatever document format they like off of it.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Bitmask selecting which population figure a simple (4-byte) ping echoes.
///
/// `Total` and `Playing` may be combined (`Total | Playing`), in which case
/// the responder alternates between the two every three seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimplePingPopulationMode(pub u8);

impl SimplePingPopulationMode {
    /// Report the total connected population.
    pub const TOTAL: SimplePingPopulationMode = SimplePingPopulationMode(1);
    /// Report only players actively in a ship/playing state.
    pub const PLAYING: SimplePingPopulationMode = SimplePingPopulationMode(2);
    /// Alternate between [`Self::TOTAL`] and [`Self::PLAYING`] every 3 seconds.
    pub const TOTAL_AND_PLAYING: SimplePingPopulationMode = SimplePingPopulationMode(3);

    pub(crate) fn has_total(self) -> bool {
        self.0 & 1 != 0
    }

    pub(crate) fn has_playing(self) -> bool {
        self.0 & 2 != 0
    }
}

impl Default for SimplePingPopulationMode {
    fn default() -> Self {
        SimplePingPopulationMode::TOTAL
    }
}

/// One `{game socket, ping socket, virtual-zone name, client-type allowlist}` tuple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenConfig {
    /// Game-traffic UDP port. The paired ping port is `port + 1`.
    pub port: u16,
    /// Local address to bind both sockets to.
    pub bind_address: IpAddr,
    /// Virtual-zone identifier selecting per-port population and policy.
    pub connect_as: String,
    /// Whether clients identifying as the legacy ("VIE") client type may connect here.
    pub allow_vie: bool,
    /// Whether clients identifying as the "Continuum" client type may connect here.
    pub allow_cont: bool,
}

impl ListenConfig {
    /// The ping port paired with this listen's game port.
    pub fn ping_port(&self) -> u16 {
        self.port.wrapping_add(1)
    }
}

/// Top-level configuration for the Core protocol transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Listen sections, one per bound game/ping port pair.
    pub listens: Vec<ListenConfig>,
    /// Port used for outbound connections made via `MakeClientConnection`.
    pub internal_client_port: u16,

    /// No-data timeout after which a connection lags out. Stored at millisecond
    /// resolution; the wire config historically expressed this in centiseconds.
    pub drop_timeout: Duration,
    /// Outgoing queue length (unsent + sending) above which `hit_max_outlist` fires.
    pub max_outlist_size: usize,
    /// Number of send attempts for a reliable packet before `hit_max_retries` fires.
    pub max_retries: u32,

    /// Reorder-buffer capacity for player (server-side) connections.
    pub player_reliable_receive_window_size: usize,
    /// Reorder-buffer capacity for outbound client connections.
    pub client_connection_reliable_receive_window_size: usize,

    /// If true, cap grouped-reliable nesting to 255 bytes (allows further
    /// regrouping); if false, allow up to the 520-byte envelope for density.
    pub limit_reliable_grouping_size: bool,

    /// Number of already-queued reliable chunks above which the sized-send
    /// engine stops pulling more data for a connection.
    pub sized_queue_threshold: usize,
    /// Number of 480-byte chunks requested from the sized-send callback per pull.
    pub sized_queue_packets: usize,
    /// Whether sized-send is enabled for outbound traffic at all.
    pub sized_send_outgoing: bool,

    /// Fixed overhead (bytes) charged per packet against the bandwidth limiter.
    pub per_packet_overhead: usize,

    /// Minimum interval between population-summary refreshes for ping responses.
    pub ping_refresh_threshold: Duration,
    /// Which population figure(s) a simple ping echoes.
    pub simple_ping_population_mode: SimplePingPopulationMode,

    /// Number of reliable-worker threads draining the ready queue.
    pub reliable_threads: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            listens: Vec::new(),
            internal_client_port: 0,
            drop_timeout: Duration::from_millis(30_000),
            max_outlist_size: 500,
            max_retries: 15,
            player_reliable_receive_window_size: 32,
            client_connection_reliable_receive_window_size: 512,
            limit_reliable_grouping_size: false,
            sized_queue_threshold: 5,
            sized_queue_packets: 25,
            sized_send_outgoing: true,
            per_packet_overhead: 28,
            ping_refresh_threshold: Duration::from_millis(2_000),
            simple_ping_population_mode: SimplePingPopulationMode::default(),
            reliable_threads: 1,
        }
    }
}

impl CoreConfig {
    /// Validates the configuration, returning the first violated invariant found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listens.is_empty() {
            return Err(ConfigError::NoListens);
        }

        let mut seen_ports = std::collections::HashSet::new();
        for listen in &self.listens {
            if !seen_ports.insert(listen.port) {
                return Err(ConfigError::DuplicateListenPort(listen.port));
            }
        }

        if self.max_retries == 0 {
            return Err(ConfigError::MaxRetriesZero);
        }
        if self.player_reliable_receive_window_size == 0
            || self.client_connection_reliable_receive_window_size == 0
        {
            return Err(ConfigError::ReceiveWindowZero);
        }
        if self.sized_queue_packets == 0 {
            return Err(ConfigError::SizedQueuePacketsZero);
        }
        if self.reliable_threads == 0 {
            return Err(ConfigError::ReliableThreadsZero);
        }

        Ok(())
    }

    /// The maximum inner-grouped-item size allowed when promoting unsent reliable
    /// packets into a combined grouped-reliable frame.
    pub fn max_reliable_grouping_size(&self) -> usize {
        if self.limit_reliable_grouping_size {
            255
        } else {
            520
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listen() -> ListenConfig {
        ListenConfig {
            port: 5000,
            bind_address: "0.0.0.0".parse().unwrap(),
            connect_as: "zone".into(),
            allow_vie: true,
            allow_cont: true,
        }
    }

    #[test]
    fn default_config_needs_a_listen() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.validate(), Err(ConfigError::NoListens));
    }

    #[test]
    fn valid_config_passes() {
        let mut cfg = CoreConfig::default();
        cfg.listens.push(listen());
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn duplicate_ports_rejected() {
        let mut cfg = CoreConfig::default();
        cfg.listens.push(listen());
        cfg.listens.push(listen());
        assert_eq!(cfg.validate(), Err(ConfigError::DuplicateListenPort(5000)));
    }

    #[test]
    fn population_mode_bits() {
        assert!(SimplePingPopulationMode::TOTAL.has_total());
        assert!(!SimplePingPopulationMode::TOTAL.has_playing());
        assert!(SimplePingPopulationMode::TOTAL_AND_PLAYING.has_total());
        assert!(SimplePingPopulationMode::TOTAL_AND_PLAYING.has_playing());
    }
}
