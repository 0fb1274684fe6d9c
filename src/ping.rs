//! Ping Responder: answers simple (4-byte) and extended (8-byte) ping probes
//! using cached population stats.

use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};

use crate::collab::ArenaManager;
use crate::config::SimplePingPopulationMode;
use crate::stats::PopulationStats;

/// `GlobalSummary` bit of the extended ping options field.
pub const OPT_GLOBAL_SUMMARY: u8 = 0x01;
/// `ArenaSummary` bit of the extended ping options field.
pub const OPT_ARENA_SUMMARY: u8 = 0x02;

/// Caches population data, refreshed no more often than `refresh_threshold`
/// (default 2s).
pub struct PingCache {
    refresh_threshold: Duration,
    last_refresh: Option<Instant>,
    population: PopulationStats,
    arena_blob: Vec<u8>,
    alternate_tick: bool,
    last_alternate: Option<Instant>,
}

impl PingCache {
    pub fn new(refresh_threshold: Duration) -> Self {
        Self {
            refresh_threshold,
            last_refresh: None,
            population: PopulationStats::default(),
            arena_blob: vec![0],
            alternate_tick: false,
            last_alternate: None,
        }
    }

    /// Refreshes the cached snapshot from `arenas` if the throttle window has
    /// elapsed.
    pub fn refresh(&mut self, arenas: &dyn ArenaManager, now: Instant) {
        let due = match self.last_refresh {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.refresh_threshold,
        };
        if due {
            self.population = arenas.global_population();
            self.arena_blob = arenas.arena_summary_blob();
            self.last_refresh = Some(now);
        }
    }

    /// The population count to echo for `mode`, alternating every 3 seconds
    /// when both bits are set.
    fn population_count(&mut self, mode: SimplePingPopulationMode, now: Instant) -> u32 {
        if mode.has_total() && mode.has_playing() {
            let due = self
                .last_alternate
                .map(|last| now.saturating_duration_since(last) >= Duration::from_secs(3))
                .unwrap_or(true);
            if due {
                self.alternate_tick = !self.alternate_tick;
                self.last_alternate = Some(now);
            }
            if self.alternate_tick {
                self.population.playing
            } else {
                self.population.total
            }
        } else if mode.has_playing() {
            self.population.playing
        } else {
            self.population.total
        }
    }
}

/// Answers a simple (4-byte) ping: writes the population count into [0..4)
/// and echoes the request's 4 bytes into [4..8).
pub fn respond_simple(cache: &mut PingCache, request: &[u8; 4], mode: SimplePingPopulationMode, now: Instant) -> [u8; 8] {
    let mut response = [0u8; 8];
    let count = cache.population_count(mode, now);
    LittleEndian::write_u32(&mut response[0..4], count);
    response[4..8].copy_from_slice(request);
    response
}

/// Answers an extended (8-byte) ping: echoes the client tag, mirrors the
/// requested option bits, and appends the requested summaries.
pub fn respond_extended(cache: &PingCache, request: &[u8; 8]) -> Vec<u8> {
    let tag = &request[0..4];
    let options = request[4];

    let mut response = Vec::with_capacity(8 + 8 + cache.arena_blob.len());
    response.extend_from_slice(tag);
    response.push(options);
    response.extend_from_slice(&[0, 0, 0]);

    if options & OPT_GLOBAL_SUMMARY != 0 {
        let mut buf = [0u8; 8];
        LittleEndian::write_u32(&mut buf[0..4], cache.population.total);
        LittleEndian::write_u32(&mut buf[4..8], cache.population.playing);
        response.extend_from_slice(&buf);
    }
    if options & OPT_ARENA_SUMMARY != 0 {
        response.extend_from_slice(&cache.arena_blob);
    }

    response
}
