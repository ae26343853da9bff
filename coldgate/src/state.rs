use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Destination key: 4 address bytes then 2 port bytes, both big-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey([u8; 6]);

impl TargetKey {
    pub fn new(address: u32, port: u16) -> Self {
        let mut key = [0u8; 6];
        key[..4].copy_from_slice(&address.to_be_bytes());
        key[4..].copy_from_slice(&port.to_be_bytes());
        Self(key)
    }
}

/// Last replica count the coordinator reported for one destination.
#[derive(Debug, Clone, Serialize)]
pub struct TargetEntry {
    pub address: Ipv4Addr,
    pub port: u16,
    pub replicas: u16,
    pub updated_at: DateTime<Utc>,
}

impl TargetEntry {
    pub fn is_cold(&self) -> bool {
        self.replicas == 0
    }
}

/// Session-local shadow of which destinations are cold.
///
/// Only the session reader writes here.  Entries are never removed; a
/// destination that scales back up simply gets a non-zero replica count.
#[derive(Default)]
pub struct TargetCache {
    entries: DashMap<TargetKey, TargetEntry>,
}

impl TargetCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, address: u32, port: u16, replicas: u16) {
        let now = Utc::now();
        self.entries
            .entry(TargetKey::new(address, port))
            .and_modify(|entry| {
                entry.replicas = replicas;
                entry.updated_at = now;
            })
            .or_insert_with(|| TargetEntry {
                address: Ipv4Addr::from(address),
                port,
                replicas,
                updated_at: now,
            });
    }

    /// Number of destinations whose latest replica count is zero.
    pub fn cold_count(&self) -> u16 {
        let cold = self.entries.iter().filter(|e| e.value().is_cold()).count();
        u16::try_from(cold).unwrap_or(u16::MAX)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> Vec<TargetEntry> {
        let mut rows: Vec<_> = self.entries.iter().map(|e| e.value().clone()).collect();
        rows.sort_by_key(|e| (e.address, e.port));
        rows
    }
}

/// Lifecycle of the control-channel session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl SessionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => SessionState::Connecting,
            2 => SessionState::Connected,
            _ => SessionState::Disconnected,
        }
    }
}

/// Counters shared by the capture worker, the session and the status API.
pub struct AgentStats {
    pub captures_total: AtomicU64,
    pub capture_requests_dropped: AtomicU64,
    pub hellos_sent: AtomicU64,
    pub hello_mismatches: AtomicU64,
    pub target_updates_applied: AtomicU64,
    pub target_update_failures: AtomicU64,
    pub unknown_messages: AtomicU64,
    session: AtomicU8,
}

impl AgentStats {
    pub fn new() -> Self {
        Self {
            captures_total: AtomicU64::new(0),
            capture_requests_dropped: AtomicU64::new(0),
            hellos_sent: AtomicU64::new(0),
            hello_mismatches: AtomicU64::new(0),
            target_updates_applied: AtomicU64::new(0),
            target_update_failures: AtomicU64::new(0),
            unknown_messages: AtomicU64::new(0),
            session: AtomicU8::new(SessionState::Disconnected as u8),
        }
    }

    pub fn session_state(&self) -> SessionState {
        SessionState::from_u8(self.session.load(Ordering::Relaxed))
    }

    pub fn set_session_state(&self, state: SessionState) {
        self.session.store(state as u8, Ordering::Relaxed);
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for AgentStats {
    fn default() -> Self {
        Self::new()
    }
}
