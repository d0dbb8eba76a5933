//! Credential pool for a single upstream API
//!
//! Holds an ordered list of interchangeable upstream tokens, hands them out
//! round-robin, counts consecutive failures per token and deactivates a token
//! once its streak reaches the configured threshold. Administrative callers
//! can inspect, reset and reload the pool while traffic is flowing.
//!
//! Token lifecycle:
//! 1. Pool is built from a comma-separated list, every token active
//! 2. Dispatcher calls `acquire()` before each upstream attempt
//! 3. Upstream failure → `report_failure()`; `max_failures` in a row → inactive
//! 4. Upstream success → `report_success()` clears the streak
//! 5. Admin `reset_one()`/`reset_all()` reactivate, `reload()` replaces everything
//!
//! `failover::dispatch` packages steps 2-4 into the bounded retry loop the
//! dispatcher runs for each logical request.

pub mod credential;
pub mod error;
pub mod failover;
pub mod pool;

pub use credential::{CredentialInfo, parse_token_list};
pub use error::{Error, Result};
pub use failover::{DispatchError, dispatch};
pub use pool::{AcquiredCredential, DEFAULT_MAX_FAILURES, Pool, PoolStats, PoolStatus, ReloadSummary};
