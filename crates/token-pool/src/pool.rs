//! Round-robin token pool with failure-threshold deactivation
//!
//! All mutable state (token list, rotation cursor, the configured list it was
//! built from) sits behind a single `parking_lot::Mutex`. Every public
//! operation takes the lock once, does O(pool size) work without I/O or
//! awaiting, and releases it, so each operation is atomic with respect to all
//! others.

use std::collections::BTreeMap;

use common::Secret;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::credential::{Credential, CredentialInfo, parse_token_list};
use crate::error::{Error, Result};

/// Consecutive failures after which a token is deactivated, unless configured.
pub const DEFAULT_MAX_FAILURES: u32 = 3;

/// A token handed out by [`Pool::acquire`], ready for one upstream attempt.
#[derive(Debug, Clone)]
pub struct AcquiredCredential {
    pub ordinal: usize,
    pub token: Secret<String>,
}

/// Overall pool condition for health reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// Every token is active
    Healthy,
    /// Some tokens are inactive
    Degraded,
    /// No token can be acquired
    Unhealthy,
}

/// Point-in-time pool summary, computed under the pool lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_tokens: usize,
    pub active_tokens: usize,
    pub inactive_tokens: usize,
    /// Diagnostic only; its value after skipping inactive tokens is not a contract.
    pub current_index: usize,
    /// Consecutive-failure count → number of tokens at that count.
    pub failure_distribution: BTreeMap<u32, usize>,
    pub max_failures: u32,
}

impl PoolStats {
    pub fn status(&self) -> PoolStatus {
        if self.active_tokens == 0 {
            PoolStatus::Unhealthy
        } else if self.active_tokens == self.total_tokens {
            PoolStatus::Healthy
        } else {
            PoolStatus::Degraded
        }
    }
}

/// Token counts before and after a successful reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ReloadSummary {
    pub previous: usize,
    pub current: usize,
}

struct PoolState {
    /// Raw list the current tokens were built from; reused by `reload(None)`.
    source: Secret<String>,
    credentials: Vec<Credential>,
    /// Next slot to inspect; always `< credentials.len()`.
    cursor: usize,
}

/// Pool of interchangeable upstream tokens.
///
/// Constructed once at startup and shared by reference (`Arc<Pool>`) with the
/// dispatcher and admin handlers.
pub struct Pool {
    state: Mutex<PoolState>,
    max_failures: u32,
}

fn build_credentials(raw: &str) -> Result<Vec<Credential>> {
    let credentials: Vec<Credential> = parse_token_list(raw)
        .into_iter()
        .enumerate()
        .map(|(ordinal, value)| Credential::new(value, ordinal))
        .collect();
    if credentials.is_empty() {
        return Err(Error::Configuration(
            "token list contains no tokens".into(),
        ));
    }
    Ok(credentials)
}

impl Pool {
    /// Build a pool from a comma-separated token list.
    ///
    /// Fails with `Error::Configuration` when no non-blank token remains after
    /// parsing. A `max_failures` of 0 is treated as 1.
    pub fn new(token_list: &str, max_failures: u32) -> Result<Self> {
        let credentials = build_credentials(token_list)?;
        let max_failures = if max_failures == 0 {
            warn!("max_failures of 0 would deactivate tokens before use, using 1");
            1
        } else {
            max_failures
        };
        info!(tokens = credentials.len(), max_failures, "token pool initialized");
        Ok(Self {
            state: Mutex::new(PoolState {
                source: Secret::from(token_list),
                credentials,
                cursor: 0,
            }),
            max_failures,
        })
    }

    /// Select the next active token round-robin.
    ///
    /// Scans at most one full cycle from the cursor, advancing it on every
    /// step, and returns the first active token. The cursor is left on the
    /// slot after the returned token. Returns `None` when every token is
    /// inactive; never blocks waiting for one to recover.
    pub fn acquire(&self) -> Option<AcquiredCredential> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let n = state.credentials.len();

        for _ in 0..n {
            let idx = state.cursor;
            state.cursor = (idx + 1) % n;

            let credential = &mut state.credentials[idx];
            if !credential.active {
                continue;
            }
            credential.mark_used();
            debug!(
                ordinal = credential.ordinal,
                failures = credential.consecutive_failures,
                "token assigned"
            );
            return Some(AcquiredCredential {
                ordinal: credential.ordinal,
                token: credential.value().clone(),
            });
        }

        warn!(total = n, "no active token available");
        None
    }

    /// Record an upstream failure for `token`.
    ///
    /// Returns true when this call pushed the token's streak to the threshold
    /// and deactivated it. Unknown tokens (e.g. replaced by a concurrent
    /// reload) are ignored and return false.
    pub fn report_failure(&self, token: &str, reason: &str) -> bool {
        let mut state = self.state.lock();
        let Some(credential) = state.credentials.iter_mut().find(|c| c.matches(token)) else {
            warn!("failure reported for a token not in the pool, ignoring");
            return false;
        };

        let deactivated = credential.record_failure(self.max_failures);
        warn!(
            ordinal = credential.ordinal,
            failures = credential.consecutive_failures,
            max_failures = self.max_failures,
            reason,
            "token failure recorded"
        );
        if deactivated {
            warn!(
                ordinal = credential.ordinal,
                failures = credential.consecutive_failures,
                "token deactivated"
            );
        }
        deactivated
    }

    /// Record an upstream success for `token`, clearing its failure streak.
    ///
    /// Does not reactivate an inactive token. Unknown tokens are ignored.
    pub fn report_success(&self, token: &str) {
        let mut state = self.state.lock();
        match state.credentials.iter_mut().find(|c| c.matches(token)) {
            Some(credential) => {
                if let Some(previous) = credential.record_success() {
                    info!(
                        ordinal = credential.ordinal,
                        previous_failures = previous,
                        "token recovered, failure streak cleared"
                    );
                }
            }
            None => debug!("success reported for a token not in the pool, ignoring"),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        let total_tokens = state.credentials.len();
        let active_tokens = state.credentials.iter().filter(|c| c.active).count();

        let mut failure_distribution = BTreeMap::new();
        for credential in &state.credentials {
            *failure_distribution
                .entry(credential.consecutive_failures)
                .or_insert(0) += 1;
        }

        PoolStats {
            total_tokens,
            active_tokens,
            inactive_tokens: total_tokens - active_tokens,
            current_index: state.cursor,
            failure_distribution,
            max_failures: self.max_failures,
        }
    }

    /// Clear the streak of the token at `ordinal` and reactivate it.
    ///
    /// Returns false, changing nothing, for an out-of-range ordinal.
    pub fn reset_one(&self, ordinal: usize) -> bool {
        let mut state = self.state.lock();
        let total = state.credentials.len();
        let Some(credential) = state.credentials.get_mut(ordinal) else {
            warn!(ordinal, total, "reset requested for invalid token ordinal");
            return false;
        };

        let old_failures = credential.consecutive_failures;
        let old_active = credential.active;
        credential.reset();
        info!(ordinal, old_failures, old_active, "token reset");
        true
    }

    /// Reset every token that has a failure streak or is inactive.
    ///
    /// Returns how many tokens were reset.
    pub fn reset_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut reset_count = 0usize;
        for credential in state.credentials.iter_mut().filter(|c| c.needs_reset()) {
            credential.reset();
            reset_count += 1;
        }
        info!(reset_count, total = state.credentials.len(), "all tokens reset");
        reset_count
    }

    /// Rebuild the pool from `token_list`, or from the stored list when `None`.
    ///
    /// All failure history is discarded, ordinals are reassigned and the
    /// cursor returns to 0. When the list yields no tokens the call fails with
    /// `Error::Configuration` and the current pool, including its stored
    /// list, is left untouched.
    pub fn reload(&self, token_list: Option<&str>) -> Result<ReloadSummary> {
        let mut state = self.state.lock();
        let raw = match token_list {
            Some(raw) => raw.to_owned(),
            None => state.source.expose().clone(),
        };

        let credentials = match build_credentials(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "token reload rejected, keeping current tokens");
                return Err(e);
            }
        };

        let summary = ReloadSummary {
            previous: state.credentials.len(),
            current: credentials.len(),
        };
        state.credentials = credentials;
        state.cursor = 0;
        state.source = Secret::new(raw);
        info!(
            previous = summary.previous,
            current = summary.current,
            "token pool reloaded"
        );
        Ok(summary)
    }

    /// Redacted view of the token at `ordinal`.
    pub fn credential(&self, ordinal: usize) -> Option<CredentialInfo> {
        self.state.lock().credentials.get(ordinal).map(Credential::info)
    }

    /// Redacted views of all tokens in ordinal order.
    pub fn credentials(&self) -> Vec<CredentialInfo> {
        self.state
            .lock()
            .credentials
            .iter()
            .map(Credential::info)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().credentials.len()
    }

    /// Always false for a constructed pool; kept for API symmetry with `len`.
    pub fn is_empty(&self) -> bool {
        self.state.lock().credentials.is_empty()
    }

    pub fn max_failures(&self) -> u32 {
        self.max_failures
    }
}
