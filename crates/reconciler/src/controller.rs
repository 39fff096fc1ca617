//! Per-kind capability set.

use async_trait::async_trait;

use crate::differ;
use crate::error::Result;
use crate::planner;
use crate::types::{Action, Delta, DesiredSpec, ObservedState, Outcome, ResourceKey};

/// Adapter between the engine and the external system for one resource kind.
///
/// `fetch_observed` and `apply` are the only places the engine touches the
/// outside world. `diff` and `plan` default to the generic structural
/// versions; a kind overrides them only to add domain rules, and they must
/// stay pure.
#[async_trait]
pub trait Controller: Send + Sync {
    /// Resource kind this controller handles; matches [`ResourceKey::kind`].
    fn kind(&self) -> &str;

    /// Read the actual state of `key`.
    ///
    /// Returns `Ok(None)` when nothing exists for the key yet.
    ///
    /// # Errors
    ///
    /// Return [`crate::Error::Retryable`] for transient failures and
    /// [`crate::Error::Fatal`] for ones that need operator action.
    async fn fetch_observed(&self, key: &ResourceKey) -> Result<Option<ObservedState>>;

    /// Apply one action. Must be idempotent: applying an action the
    /// external system already reflects is a successful no-op.
    async fn apply(&self, key: &ResourceKey, action: &Action) -> Outcome;

    /// Compute the delta for this kind.
    fn diff(&self, desired: Option<&DesiredSpec>, observed: Option<&ObservedState>) -> Delta {
        differ::diff(desired, observed)
    }

    /// Order a delta into actions for this kind.
    fn plan(&self, delta: &Delta) -> Vec<Action> {
        planner::plan(delta)
    }
}
