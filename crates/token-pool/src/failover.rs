//! Bounded failover across pooled tokens
//!
//! The retry loop a dispatcher runs for one logical request: acquire a token,
//! attempt the upstream call, report the outcome, and move on to the next
//! token on failure. The loop is bounded by the pool size so a fully failed
//! pool cannot spin forever.

use std::fmt::Display;
use std::future::Future;

use tracing::{debug, warn};

use crate::pool::{AcquiredCredential, Pool};

/// Why a dispatch produced no successful result.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError<E> {
    /// The pool had no active token left; the upstream was not called for
    /// this attempt.
    #[error("no active token available after {attempts} attempt(s)")]
    NoCredential { attempts: usize },

    /// Every permitted attempt failed; carries the last upstream error.
    #[error("all {attempts} attempt(s) failed, last error: {last_error}")]
    Exhausted { attempts: usize, last_error: E },
}

/// Run `attempt` against successive tokens until one succeeds.
///
/// At most `pool.len()` attempts are made (pool size sampled once at the
/// start). Each failure is reported with the error's `Display` text as the
/// reason; a success clears the token's streak and is returned immediately.
/// No delay is inserted between attempts.
pub async fn dispatch<T, E, F, Fut>(pool: &Pool, mut attempt: F) -> Result<T, DispatchError<E>>
where
    E: Display,
    F: FnMut(AcquiredCredential) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = pool.len();
    let mut last_error = None;

    for attempts in 0..max_attempts {
        let Some(credential) = pool.acquire() else {
            return Err(match last_error {
                Some(last_error) => DispatchError::Exhausted {
                    attempts,
                    last_error,
                },
                None => DispatchError::NoCredential { attempts },
            });
        };

        let token = credential.token.clone();
        let ordinal = credential.ordinal;
        match attempt(credential).await {
            Ok(value) => {
                pool.report_success(token.expose());
                debug!(ordinal, attempt = attempts + 1, "upstream attempt succeeded");
                return Ok(value);
            }
            Err(e) => {
                let reason = e.to_string();
                let deactivated = pool.report_failure(token.expose(), &reason);
                warn!(
                    ordinal,
                    attempt = attempts + 1,
                    max_attempts,
                    deactivated,
                    error = %reason,
                    "upstream attempt failed, trying next token"
                );
                last_error = Some(e);
            }
        }
    }

    Err(match last_error {
        Some(last_error) => DispatchError::Exhausted {
            attempts: max_attempts,
            last_error,
        },
        None => DispatchError::NoCredential { attempts: 0 },
    })
}
