//! Per-client fixed-window rate limiting.
//!
//! Each route owns one [`RateLimiter`]. A client (keyed by IP) may make
//! `limit` requests per window; the window starts at its first request and
//! resets once it has fully elapsed.
//!
//! Client keys come from proxy headers and can be forged, so the table is
//! bounded: expired windows are swept at most once per window, and past
//! [`MAX_TRACKED`] new clients pass untracked until the next sweep.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Above this many tracked clients, expired windows are pruned on insert.
const PRUNE_THRESHOLD: usize = 4096;

/// Hard cap on tracked clients.
pub const MAX_TRACKED: usize = 65_536;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed {
        /// Requests left in the current window after this one.
        remaining: u32,
    },
    Denied {
        /// Time until the client's window resets.
        wait: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed { .. })
    }

    /// Whole seconds for a `Retry-After` header, rounded up, at least 1.
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Decision::Allowed { .. } => None,
            Decision::Denied { wait } => {
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                Some(secs.max(1))
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

#[derive(Debug, Default)]
struct Table {
    windows: HashMap<IpAddr, Window>,
    last_pruned: Option<Instant>,
}

impl Table {
    /// Drop expired windows, unless a sweep already ran within `window`.
    fn prune(&mut self, now: Instant, window: Duration) {
        if let Some(last) = self.last_pruned {
            if now.saturating_duration_since(last) < window {
                return;
            }
        }
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < window);
        self.last_pruned = Some(now);
    }
}

/// Fixed-window counter keyed by client IP.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    clients: Mutex<Table>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            clients: Mutex::new(Table::default()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn check(&self, client: IpAddr) -> Decision {
        self.check_at(client, Instant::now())
    }

    /// [`check`](Self::check) against an explicit clock reading.
    pub fn check_at(&self, client: IpAddr, now: Instant) -> Decision {
        let mut table = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        if !table.windows.contains_key(&client) {
            if table.windows.len() >= PRUNE_THRESHOLD {
                table.prune(now, self.window);
            }
            if table.windows.len() >= MAX_TRACKED {
                return Decision::Allowed {
                    remaining: self.limit.saturating_sub(1),
                };
            }
        }

        let entry = table.windows.entry(client).or_insert(Window {
            started: now,
            count: 0,
        });
        let elapsed = now.saturating_duration_since(entry.started);
        if elapsed >= self.window {
            *entry = Window {
                started: now,
                count: 0,
            };
        }

        if entry.count >= self.limit {
            let wait = self
                .window
                .saturating_sub(now.saturating_duration_since(entry.started));
            return Decision::Denied { wait };
        }

        entry.count += 1;
        Decision::Allowed {
            remaining: self.limit - entry.count,
        }
    }

    /// Number of clients with a tracked window.
    pub fn tracked(&self) -> usize {
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .windows
            .len()
    }
}
