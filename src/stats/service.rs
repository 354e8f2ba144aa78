//! [`StatsService`]: the single entry point handlers use for statistics.

use std::sync::Arc;

use super::repository::{StatsRepository, Top};
use super::signature::Signature;
use crate::error::{BuildError, StatsError};

/// Owns exactly one [`StatsRepository`], fixed at construction.
///
/// Cloning is cheap and shares the repository. Every call delegates to the
/// repository and returns its result unchanged.
#[derive(Clone)]
pub struct StatsService {
    repo: Arc<dyn StatsRepository>,
}

impl StatsService {
    pub fn builder() -> StatsServiceBuilder {
        StatsServiceBuilder::default()
    }

    /// Register one occurrence of `signature`.
    pub async fn record(&self, signature: &Signature) -> Result<(), StatsError> {
        self.repo.increment(signature).await
    }

    /// The most frequently recorded signature, or `None` before any record.
    pub async fn most_frequent(&self) -> Result<Option<Top>, StatsError> {
        self.repo.top().await
    }

    /// Whether the backing store answers.
    pub async fn ready(&self) -> Result<(), StatsError> {
        self.repo.ping().await
    }

    pub fn backend(&self) -> &'static str {
        self.repo.name()
    }
}

impl std::fmt::Debug for StatsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsService")
            .field("backend", &self.repo.name())
            .finish()
    }
}

/// Builder for [`StatsService`].
#[derive(Default)]
pub struct StatsServiceBuilder {
    repo: Option<Arc<dyn StatsRepository>>,
}

impl StatsServiceBuilder {
    pub fn repository(mut self, repo: Arc<dyn StatsRepository>) -> Self {
        self.repo = Some(repo);
        self
    }

    /// Fails with [`BuildError::MissingRepository`] when no repository was set.
    pub fn build(self) -> Result<StatsService, BuildError> {
        let repo = self.repo.ok_or(BuildError::MissingRepository)?;
        Ok(StatsService { repo })
    }
}
