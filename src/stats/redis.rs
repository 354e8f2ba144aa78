//! # Stage: Redis Sorted-Set Statistics
//!
//! ## Responsibility
//! Count signature hits in a Redis sorted set so several API instances share
//! one ranking. Members are canonical signature JSON, scores are hit counts.
//!
//! ## Guarantees
//! - Atomic increments: `ZINCRBY` is the only write, Redis serializes them.
//! - Bounded latency: every call is wrapped in the per-operation timeout;
//!   expiry yields [`StatsError::Timeout`] rather than a hang.
//! - Cancel-safe: dropping a call future abandons the reply without tearing
//!   down the shared connection.
//! - Self-healing: a dropped socket fails the calls in flight, then the
//!   connection manager re-dials and later calls succeed again.
//! - Backend-independent ties: equal scores are resolved explicitly in favour
//!   of the byte-wise greatest member instead of trusting Redis ordering.
//!
//! ## NOT Responsible For
//! - Retries (callers decide; a retry after a timeout may double count)
//! - Clearing or expiring the ranking key

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::IntoConnectionInfo;

use super::repository::{prefer_greater_member, StatsRepository, Top};
use super::signature::Signature;
use crate::config::RedisConfig;
use crate::error::StatsError;

/// Sorted-set key holding the ranking.
pub const RANK_KEY: &str = "fizzbuzz:stats:rank";

// ---------------------------------------------------------------------------
// SortedSetOps: the sorted-set commands this backend needs
// ---------------------------------------------------------------------------

/// The sorted-set commands the repository needs.
/// Implemented by [`ConnectionManager`] and by an in-process mock in tests.
#[async_trait]
pub trait SortedSetOps: Send + Sync {
    /// `ZINCRBY key delta member`, returning the new score.
    async fn zincrby(&self, key: &str, member: &str, delta: i64) -> Result<f64, String>;
    /// `ZREVRANGE key start stop WITHSCORES`.
    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, String>;
    /// `ZRANGEBYSCORE key min max` (inclusive bounds).
    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, String>;
    async fn ping(&self) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// ConnectionManager impl
// ---------------------------------------------------------------------------

// The manager is a cheap handle onto one shared multiplexed socket; each call
// clones it so `&self` methods can issue commands concurrently.
#[async_trait]
impl SortedSetOps for ConnectionManager {
    async fn zincrby(&self, key: &str, member: &str, delta: i64) -> Result<f64, String> {
        let mut conn = self.clone();
        let score: f64 = redis::cmd("ZINCRBY")
            .arg(key)
            .arg(delta)
            .arg(member)
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(score)
    }

    async fn zrevrange_withscores(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<(String, f64)>, String> {
        let mut conn = self.clone();
        let items: Vec<(String, f64)> = redis::cmd("ZREVRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .arg("WITHSCORES")
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(items)
    }

    async fn zrangebyscore(&self, key: &str, min: f64, max: f64) -> Result<Vec<String>, String> {
        let mut conn = self.clone();
        let members: Vec<String> = redis::cmd("ZRANGEBYSCORE")
            .arg(key)
            .arg(min)
            .arg(max)
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(members)
    }

    async fn ping(&self) -> Result<(), String> {
        let mut conn = self.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// RedisRepository
// ---------------------------------------------------------------------------

/// Redis-backed [`StatsRepository`].
///
/// # Construction
/// - `connect(config)`: dials Redis and PINGs it within the dial timeout;
///   fails if either step fails.
/// - `with_ops(ops, op_timeout)`: inject any [`SortedSetOps`] (tests).
pub struct RedisRepository {
    ops: Box<dyn SortedSetOps>,
    rank_key: String,
    op_timeout: Duration,
}

impl RedisRepository {
    /// Open a managed connection described by `config` and verify it.
    pub async fn connect(config: &RedisConfig) -> Result<Self, StatsError> {
        let mut info = format!("redis://{}", config.addr)
            .into_connection_info()
            .map_err(|e| StatsError::Unavailable {
                op: "connect",
                detail: e.to_string(),
            })?;
        info.redis.db = config.db;
        if !config.password.is_empty() {
            info.redis.password = Some(config.password.clone());
        }

        let client = redis::Client::open(info).map_err(|e| StatsError::Unavailable {
            op: "connect",
            detail: e.to_string(),
        })?;

        let conn = match tokio::time::timeout(
            config.dial_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                return Err(StatsError::Unavailable {
                    op: "connect",
                    detail: e.to_string(),
                })
            }
            Err(_) => {
                return Err(StatsError::Timeout {
                    op: "connect",
                    after: config.dial_timeout,
                })
            }
        };

        let repo = Self::with_ops(Box::new(conn), config.op_timeout);
        repo.bounded("ping", config.dial_timeout, repo.ops.ping())
            .await?;
        Ok(repo)
    }

    /// Construct with an injected [`SortedSetOps`] implementation.
    pub fn with_ops(ops: Box<dyn SortedSetOps>, op_timeout: Duration) -> Self {
        Self {
            ops,
            rank_key: RANK_KEY.to_string(),
            op_timeout,
        }
    }

    pub fn op_timeout(&self) -> Duration {
        self.op_timeout
    }

    async fn bounded<T, F>(&self, op: &'static str, limit: Duration, call: F) -> Result<T, StatsError>
    where
        F: Future<Output = Result<T, String>>,
    {
        match tokio::time::timeout(limit, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(detail)) => Err(StatsError::Unavailable { op, detail }),
            Err(_) => Err(StatsError::Timeout { op, after: limit }),
        }
    }
}

/// Scores are stored as doubles; counts are whole numbers, so rounding only
/// absorbs float representation noise. Negative or NaN scores clamp to 0.
fn score_to_hits(score: f64) -> u64 {
    if score.is_nan() || score <= 0.0 {
        return 0;
    }
    // `as` saturates at u64::MAX for out-of-range values.
    score.round() as u64
}

#[async_trait]
impl StatsRepository for RedisRepository {
    async fn increment(&self, signature: &Signature) -> Result<(), StatsError> {
        let member = signature.canonical()?;
        self.bounded(
            "zincrby",
            self.op_timeout,
            self.ops.zincrby(&self.rank_key, &member, 1),
        )
        .await?;
        Ok(())
    }

    async fn top(&self) -> Result<Option<Top>, StatsError> {
        let head = self
            .bounded(
                "zrevrange",
                self.op_timeout,
                self.ops.zrevrange_withscores(&self.rank_key, 0, 0),
            )
            .await?;
        let Some((first, score)) = head.into_iter().next() else {
            return Ok(None);
        };

        // Resolve ties ourselves; Redis' equal-score order is not relied on.
        let tied = self
            .bounded(
                "zrangebyscore",
                self.op_timeout,
                self.ops.zrangebyscore(&self.rank_key, score, score),
            )
            .await?;
        let mut member = first;
        for candidate in tied {
            member = prefer_greater_member(member, candidate).0;
        }

        let parameters = Signature::from_canonical(&member)?;
        Ok(Some(Top {
            parameters,
            hits: score_to_hits(score),
        }))
    }

    async fn ping(&self) -> Result<(), StatsError> {
        self.bounded("ping", self.op_timeout, self.ops.ping()).await
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::memory::MemoryRepository;
    use std::collections::HashMap;
    use std::sync::Mutex;

    // -----------------------------------------------------------------------
    // MockSortedSet
    // -----------------------------------------------------------------------

    /// Which member comes first among equal scores in `ZREVRANGE`.
    #[derive(Clone, Copy)]
    enum EqualScoreOrder {
        /// What Redis does: reverse lexicographic.
        GreatestFirst,
        /// Deliberately wrong, to prove the repository does not trust it.
        LeastFirst,
    }

    /// In-process mock of the sorted-set commands.
    struct MockSortedSet {
        sets: Mutex<HashMap<String, HashMap<String, f64>>>,
        order: EqualScoreOrder,
        fail_with: Option<String>,
        stall: Option<Duration>,
    }

    impl MockSortedSet {
        fn new() -> Self {
            Self {
                sets: Mutex::new(HashMap::new()),
                order: EqualScoreOrder::GreatestFirst,
                fail_with: None,
                stall: None,
            }
        }

        fn with_order(order: EqualScoreOrder) -> Self {
            Self {
                order,
                ..Self::new()
            }
        }

        fn failing(msg: &str) -> Self {
            Self {
                fail_with: Some(msg.to_string()),
                ..Self::new()
            }
        }

        fn stalling(delay: Duration) -> Self {
            Self {
                stall: Some(delay),
                ..Self::new()
            }
        }

        fn seeded(members: &[(&str, f64)]) -> Self {
            let mock = Self::new();
            {
                let mut sets = mock.sets.lock().unwrap();
                let set = sets.entry(RANK_KEY.to_string()).or_default();
                for (m, s) in members {
                    set.insert(m.to_string(), *s);
                }
            }
            mock
        }

        async fn gate(&self) -> Result<(), String> {
            if let Some(delay) = self.stall {
                tokio::time::sleep(delay).await;
            }
            match &self.fail_with {
                Some(msg) => Err(msg.clone()),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl SortedSetOps for MockSortedSet {
        async fn zincrby(&self, key: &str, member: &str, delta: i64) -> Result<f64, String> {
            self.gate().await?;
            let mut sets = self.sets.lock().unwrap();
            let score = sets
                .entry(key.to_string())
                .or_default()
                .entry(member.to_string())
                .or_insert(0.0);
            *score += delta as f64;
            Ok(*score)
        }

        async fn zrevrange_withscores(
            &self,
            key: &str,
            start: isize,
            stop: isize,
        ) -> Result<Vec<(String, f64)>, String> {
            self.gate().await?;
            let sets = self.sets.lock().unwrap();
            let mut items: Vec<(String, f64)> = sets
                .get(key)
                .map(|s| s.iter().map(|(m, v)| (m.clone(), *v)).collect())
                .unwrap_or_default();
            let order = self.order;
            items.sort_by(|(ma, sa), (mb, sb)| {
                sb.total_cmp(sa).then_with(|| match order {
                    EqualScoreOrder::GreatestFirst => mb.cmp(ma),
                    EqualScoreOrder::LeastFirst => ma.cmp(mb),
                })
            });
            let len = items.len() as isize;
            let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };
            let start = start.max(0);
            if start > stop || len == 0 {
                return Ok(vec![]);
            }
            Ok(items[start as usize..=stop as usize].to_vec())
        }

        async fn zrangebyscore(
            &self,
            key: &str,
            min: f64,
            max: f64,
        ) -> Result<Vec<String>, String> {
            self.gate().await?;
            let sets = self.sets.lock().unwrap();
            let mut members: Vec<String> = sets
                .get(key)
                .map(|s| {
                    s.iter()
                        .filter(|(_, v)| **v >= min && **v <= max)
                        .map(|(m, _)| m.clone())
                        .collect()
                })
                .unwrap_or_default();
            members.sort();
            Ok(members)
        }

        async fn ping(&self) -> Result<(), String> {
            self.gate().await
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn repo_with(mock: MockSortedSet) -> RedisRepository {
        RedisRepository::with_ops(Box::new(mock), Duration::from_secs(1))
    }

    fn classic() -> Signature {
        Signature::new(3, 5, 16, "fizz", "buzz")
    }

    // -----------------------------------------------------------------------
    // Counting
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn empty_set_has_no_top() {
        let repo = repo_with(MockSortedSet::new());
        assert_eq!(repo.top().await.unwrap(), None);
    }

    #[tokio::test]
    async fn two_increments_of_same_signature() {
        let repo = repo_with(MockSortedSet::new());
        repo.increment(&classic()).await.unwrap();
        repo.increment(&classic()).await.unwrap();
        let top = repo.top().await.unwrap().unwrap();
        assert_eq!(top.parameters, classic());
        assert_eq!(top.hits, 2);
    }

    #[tokio::test]
    async fn higher_score_wins() {
        let repo = repo_with(MockSortedSet::new());
        let a = Signature::new(2, 7, 10, "a", "b");
        repo.increment(&a).await.unwrap();
        repo.increment(&classic()).await.unwrap();
        repo.increment(&classic()).await.unwrap();
        let top = repo.top().await.unwrap().unwrap();
        assert_eq!(top.parameters, classic());
        assert_eq!(top.hits, 2);
    }

    #[tokio::test]
    async fn increments_use_canonical_member_on_rank_key() {
        let mock = MockSortedSet::new();
        mock.zincrby(RANK_KEY, &classic().canonical().unwrap(), 4)
            .await
            .unwrap();
        let repo = repo_with(mock);
        repo.increment(&classic()).await.unwrap();
        assert_eq!(repo.top().await.unwrap().unwrap().hits, 5);
    }

    // -----------------------------------------------------------------------
    // Tie-break
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn tie_goes_to_greater_member_with_native_order() {
        let repo = repo_with(MockSortedSet::with_order(EqualScoreOrder::GreatestFirst));
        let a = Signature::new(9, 5, 16, "fizz", "buzz");
        let b = classic();
        repo.increment(&b).await.unwrap();
        repo.increment(&a).await.unwrap();
        let top = repo.top().await.unwrap().unwrap();
        assert_eq!(top.parameters, a);
        assert_eq!(top.hits, 1);
    }

    #[tokio::test]
    async fn tie_goes_to_greater_member_even_if_store_orders_least_first() {
        let repo = repo_with(MockSortedSet::with_order(EqualScoreOrder::LeastFirst));
        let a = Signature::new(9, 5, 16, "fizz", "buzz");
        let b = classic();
        repo.increment(&a).await.unwrap();
        repo.increment(&b).await.unwrap();
        for _ in 0..5 {
            assert_eq!(repo.top().await.unwrap().unwrap().parameters, a);
        }
    }

    #[tokio::test]
    async fn agrees_with_memory_backend_on_tied_population() {
        let memory = MemoryRepository::new();
        let redis = repo_with(MockSortedSet::with_order(EqualScoreOrder::LeastFirst));

        let population = [
            Signature::new(3, 5, 16, "fizz", "buzz"),
            Signature::new(3, 5, 16, "fizz", "bu\"zz"),
            Signature::new(10, 5, 16, "fizz", "buzz"),
            Signature::new(2, 5, 100, "x", "y"),
            Signature::new(2, 5, 100, "é", "y"),
        ];
        for s in &population {
            memory.increment(s).await.unwrap();
            redis.increment(s).await.unwrap();
            memory.increment(s).await.unwrap();
            redis.increment(s).await.unwrap();
        }

        let from_memory = memory.top().await.unwrap();
        let from_redis = redis.top().await.unwrap();
        assert_eq!(from_memory, from_redis);
        assert_eq!(from_redis.unwrap().hits, 2);
    }

    // -----------------------------------------------------------------------
    // Failures
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn transport_failure_is_unavailable() {
        let repo = repo_with(MockSortedSet::failing("connection reset"));
        let err = repo.increment(&classic()).await.unwrap_err();
        assert!(matches!(err, StatsError::Unavailable { op: "zincrby", .. }));
        assert!(err.is_backend_unavailable());

        let err = repo.top().await.unwrap_err();
        assert!(matches!(err, StatsError::Unavailable { op: "zrevrange", .. }));
    }

    #[tokio::test]
    async fn slow_store_times_out() {
        let repo = RedisRepository::with_ops(
            Box::new(MockSortedSet::stalling(Duration::from_secs(5))),
            Duration::from_millis(20),
        );
        let started = std::time::Instant::now();
        let err = repo.increment(&classic()).await.unwrap_err();
        assert!(matches!(err, StatsError::Timeout { op: "zincrby", .. }));
        assert!(err.is_backend_unavailable());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[tokio::test]
    async fn ping_reports_failure() {
        let repo = repo_with(MockSortedSet::failing("NOAUTH"));
        assert!(repo.ping().await.is_err());
        let repo = repo_with(MockSortedSet::new());
        assert!(repo.ping().await.is_ok());
    }

    #[tokio::test]
    async fn corrupt_member_is_reported() {
        let repo = repo_with(MockSortedSet::seeded(&[("{not a signature", 3.0)]));
        let err = repo.top().await.unwrap_err();
        assert!(matches!(err, StatsError::CorruptMember { .. }));
    }

    // -----------------------------------------------------------------------
    // Score rounding
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn fractional_score_is_rounded() {
        let member = classic().canonical().unwrap();
        let repo = repo_with(MockSortedSet::seeded(&[(member.as_str(), 2.9999999)]));
        assert_eq!(repo.top().await.unwrap().unwrap().hits, 3);
    }

    #[test]
    fn score_to_hits_clamps() {
        assert_eq!(score_to_hits(-1.0), 0);
        assert_eq!(score_to_hits(f64::NAN), 0);
        assert_eq!(score_to_hits(0.4), 0);
        assert_eq!(score_to_hits(1.5), 2);
        assert_eq!(score_to_hits(f64::INFINITY), u64::MAX);
    }

    // -----------------------------------------------------------------------
    // Reconnect
    // -----------------------------------------------------------------------

    mod resp_server {
        use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
        use tokio::net::{TcpListener, TcpStream};
        use tokio::sync::broadcast;

        /// Minimal RESP2 server: `PING` gets `+PONG`, `ZINCRBY` a score of 1,
        /// anything else `+OK`. A send on the returned channel closes every
        /// open connection; new ones are still accepted.
        pub async fn start() -> (String, broadcast::Sender<()>) {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let addr = listener.local_addr().unwrap().to_string();
            let (sever, _) = broadcast::channel::<()>(4);
            let tx = sever.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve(stream, tx.subscribe()));
                }
            });
            (addr, sever)
        }

        async fn serve(stream: TcpStream, mut sever: broadcast::Receiver<()>) {
            let (read, mut write) = stream.into_split();
            let mut read = BufReader::new(read);
            loop {
                let command = tokio::select! {
                    _ = sever.recv() => return,
                    command = read_command(&mut read) => command,
                };
                let Some(command) = command else { return };
                let reply: &[u8] = match command.first().map(|c| c.to_ascii_uppercase()) {
                    Some(name) if name == "PING" => b"+PONG\r\n",
                    Some(name) if name == "ZINCRBY" => b"$1\r\n1\r\n",
                    _ => b"+OK\r\n",
                };
                if write.write_all(reply).await.is_err() {
                    return;
                }
            }
        }

        async fn read_command<R>(read: &mut R) -> Option<Vec<String>>
        where
            R: AsyncBufRead + Unpin,
        {
            let count: usize = read_line(read).await?.strip_prefix('*')?.parse().ok()?;
            let mut parts = Vec::with_capacity(count);
            for _ in 0..count {
                let len: usize = read_line(read).await?.strip_prefix('$')?.parse().ok()?;
                let mut buf = vec![0u8; len + 2];
                read.read_exact(&mut buf).await.ok()?;
                buf.truncate(len);
                parts.push(String::from_utf8_lossy(&buf).into_owned());
            }
            Some(parts)
        }

        async fn read_line<R>(read: &mut R) -> Option<String>
        where
            R: AsyncBufRead + Unpin,
        {
            let mut line = String::new();
            match read.read_line(&mut line).await {
                Ok(0) | Err(_) => None,
                Ok(_) => Some(line.trim_end().to_string()),
            }
        }
    }

    #[tokio::test]
    async fn recovers_after_connection_drop() {
        let (addr, sever) = resp_server::start().await;
        let mut config = crate::config::Config::default().redis;
        config.enabled = true;
        config.addr = addr;
        config.dial_timeout = Duration::from_secs(2);
        config.op_timeout = Duration::from_millis(500);

        let repo = RedisRepository::connect(&config).await.unwrap();
        repo.increment(&classic()).await.unwrap();

        sever.send(()).unwrap();

        // Calls in flight around the drop may fail; later ones must not.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut recovered = false;
        while std::time::Instant::now() < deadline {
            if repo.ping().await.is_ok() {
                recovered = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(recovered, "ping never succeeded after the drop");
        repo.increment(&classic()).await.unwrap();
        assert!(repo.ping().await.is_ok());
    }

    #[test]
    fn name_is_redis() {
        assert_eq!(repo_with(MockSortedSet::new()).name(), "redis");
    }
}
