//! Per-token state and token list parsing

use std::time::{SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Serialize;
use subtle::ConstantTimeEq;

/// Separator between tokens in the configured list.
pub const TOKEN_SEPARATOR: char = ',';

/// Split a configured token list into individual tokens.
///
/// Entries are trimmed and empty entries dropped. Order and duplicates are
/// preserved; the position in the returned list becomes the token's ordinal.
pub fn parse_token_list(raw: &str) -> Vec<String> {
    raw.split(TOKEN_SEPARATOR)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_owned)
        .collect()
}

/// A single pooled token and its health bookkeeping.
///
/// Only the pool mutates these, always under its lock.
pub(crate) struct Credential {
    value: Secret<String>,
    pub(crate) ordinal: usize,
    pub(crate) consecutive_failures: u32,
    pub(crate) active: bool,
    pub(crate) last_used_at: Option<SystemTime>,
    pub(crate) last_failure_at: Option<SystemTime>,
}

impl Credential {
    pub(crate) fn new(value: String, ordinal: usize) -> Self {
        Self {
            value: Secret::new(value),
            ordinal,
            consecutive_failures: 0,
            active: true,
            last_used_at: None,
            last_failure_at: None,
        }
    }

    pub(crate) fn value(&self) -> &Secret<String> {
        &self.value
    }

    /// Constant-time comparison against a raw token.
    pub(crate) fn matches(&self, candidate: &str) -> bool {
        self.value
            .expose()
            .as_bytes()
            .ct_eq(candidate.as_bytes())
            .into()
    }

    pub(crate) fn mark_used(&mut self) {
        self.last_used_at = Some(SystemTime::now());
    }

    /// Count one failure. Returns true only when this call deactivates the token.
    ///
    /// The streak saturates at `max_failures`; further failures on an
    /// already-inactive token only refresh `last_failure_at`.
    pub(crate) fn record_failure(&mut self, max_failures: u32) -> bool {
        self.last_failure_at = Some(SystemTime::now());
        if self.consecutive_failures < max_failures {
            self.consecutive_failures += 1;
        }
        if self.active && self.consecutive_failures >= max_failures {
            self.active = false;
            return true;
        }
        false
    }

    /// Clear the failure streak. Returns the previous streak if there was one.
    ///
    /// Does not reactivate: an inactive token comes back only through a reset.
    pub(crate) fn record_success(&mut self) -> Option<u32> {
        if self.consecutive_failures == 0 {
            return None;
        }
        let previous = self.consecutive_failures;
        self.consecutive_failures = 0;
        Some(previous)
    }

    pub(crate) fn needs_reset(&self) -> bool {
        self.consecutive_failures > 0 || !self.active
    }

    pub(crate) fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_failure_at = None;
        self.active = true;
    }

    pub(crate) fn info(&self) -> CredentialInfo {
        CredentialInfo {
            ordinal: self.ordinal,
            active: self.active,
            consecutive_failures: self.consecutive_failures,
            last_used_at_ms: self.last_used_at.map(unix_millis),
            last_failure_at_ms: self.last_failure_at.map(unix_millis),
        }
    }
}

/// Redacted view of a pooled token for admin listings. Never carries the secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialInfo {
    pub ordinal: usize,
    pub active: bool,
    pub consecutive_failures: u32,
    pub last_used_at_ms: Option<u64>,
    pub last_failure_at_ms: Option<u64>,
}

fn unix_millis(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
