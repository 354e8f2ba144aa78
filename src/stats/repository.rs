//! Backend-independent statistics contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::signature::Signature;
use crate::error::StatsError;

/// The most frequently recorded signature and its hit count.
///
/// Serializes to the `/stats` response body:
/// `{"parameters": {...}, "hits": 2}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Top {
    pub parameters: Signature,
    pub hits: u64,
}

/// Storage strategy for signature hit counts.
///
/// # Contract
/// - `increment` adds exactly one occurrence unless the backend's capacity
///   policy drops it; it is safe to call concurrently for any signatures.
/// - `top` returns the signature with the highest count. On equal counts the
///   signature whose [`Signature::canonical`] form is byte-wise greatest wins,
///   on every backend. `Ok(None)` means nothing was ever recorded.
/// - Backend failures are returned, never swallowed.
#[async_trait]
pub trait StatsRepository: Send + Sync {
    async fn increment(&self, signature: &Signature) -> Result<(), StatsError>;

    async fn top(&self) -> Result<Option<Top>, StatsError>;

    /// Readiness probe. Backends without external dependencies are always ready.
    async fn ping(&self) -> Result<(), StatsError> {
        Ok(())
    }

    /// Short backend label for logs.
    fn name(&self) -> &'static str;
}

/// Keeps whichever of two equal-count candidates has the greater canonical
/// member. Shared by every backend so they agree on ties.
pub(crate) fn prefer_greater_member(incumbent: String, challenger: String) -> (String, bool) {
    if challenger > incumbent {
        (challenger, true)
    } else {
        (incumbent, false)
    }
}
