//! Request-signature statistics.
//!
//! [`StatsService`] records `/fizzbuzz` signatures and reports the most
//! frequent one. Counting is delegated to one [`StatsRepository`] chosen at
//! startup: [`MemoryRepository`] for a single process, [`RedisRepository`] to
//! share the ranking between instances. Both break ties the same way, on the
//! greatest [`Signature::canonical`] form.

pub mod memory;
pub mod redis;
pub mod repository;
pub mod service;
pub mod signature;

use std::sync::Arc;

use tracing::info;

pub use self::memory::MemoryRepository;
pub use self::redis::RedisRepository;
pub use self::repository::{StatsRepository, Top};
pub use self::service::{StatsService, StatsServiceBuilder};
pub use self::signature::Signature;

use crate::config::Config;
use crate::error::StartupError;

/// Build the statistics service described by `config`.
///
/// Returns `Ok(None)` when statistics are disabled. With Redis enabled the
/// store must answer a `PING` within the dial timeout or startup fails.
pub async fn connect(config: &Config) -> Result<Option<StatsService>, StartupError> {
    if !config.stats.enabled {
        info!("stats disabled");
        return Ok(None);
    }

    let repo: Arc<dyn StatsRepository> = if config.redis.enabled {
        let repo = RedisRepository::connect(&config.redis).await?;
        info!(
            backend = "redis",
            addr = %config.redis.addr,
            db = config.redis.db,
            "stats backend"
        );
        Arc::new(repo)
    } else {
        info!(
            backend = "memory",
            max_keys = config.stats.max_keys,
            "stats backend"
        );
        Arc::new(MemoryRepository::with_max_keys(config.stats.max_keys))
    };

    Ok(Some(StatsService::builder().repository(repo).build()?))
}
