//! # Stage: Request Routing
//!
//! ## Responsibility
//! Turn one parsed [`Request`] into one [`Response`]: route matching, rate
//! limiting, `/fizzbuzz` validation, statistics recording and lookup, and the
//! headers every response carries (request ID, security headers, CORS).
//!
//! ## Guarantees
//! - `/fizzbuzz` never fails because recording a statistic failed.
//! - `/stats` answers 204 when there is no data, stats are disabled, or the
//!   backend fails; it never surfaces backend errors to the client.
//! - Validation runs in a fixed order and the first failure is reported.
//!
//! ## NOT Responsible For
//! - Socket I/O, timeouts and access logging (see `web`)

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::config::Config;
use crate::error::ValidationError;
use crate::fizzbuzz;
use crate::http::{Request, Response};
use crate::ratelimit::{Decision, RateLimiter};
use crate::stats::{Signature, StatsService};

const READY_PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_REQUEST_ID_LEN: usize = 200;
const CORS_ALLOWED_HEADERS: &str = "Accept, Content-Type, X-Request-Id";
const CORS_MAX_AGE_SECS: u32 = 300;

const SECURITY_HEADERS: [(&str, &str); 4] = [
    ("X-Content-Type-Options", "nosniff"),
    ("X-Frame-Options", "DENY"),
    ("Referrer-Policy", "no-referrer"),
    ("Content-Security-Policy", "default-src 'none'"),
];

/// Application state shared by every connection.
pub struct App {
    config: Config,
    stats: Option<StatsService>,
    fizzbuzz_limiter: RateLimiter,
    stats_limiter: RateLimiter,
}

impl App {
    /// `stats` is `None` when statistics are disabled.
    pub fn new(config: Config, stats: Option<StatsService>) -> Self {
        let window = config.rate_limit.window;
        Self {
            fizzbuzz_limiter: RateLimiter::new(config.rate_limit.fizzbuzz, window),
            stats_limiter: RateLimiter::new(config.rate_limit.stats, window),
            config,
            stats,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Route `req` and decorate the response.
    pub async fn handle(&self, req: &Request) -> Response {
        let resp = if self.is_preflight(req) {
            self.preflight(req)
        } else {
            self.dispatch(req).await
        };
        self.finish(req, resp)
    }

    /// The response sent when the handler overran its deadline.
    pub fn gateway_timeout(&self, req: &Request) -> Response {
        self.finish(req, Response::error(504, "request timed out"))
    }

    /// Apply the headers every response carries.
    pub fn finish(&self, req: &Request, mut resp: Response) -> Response {
        resp.set_header("X-Request-Id", &request_id(req));
        for (name, value) in SECURITY_HEADERS {
            resp.set_header(name, value);
        }
        if let Some(origin) = self.allowed_origin(req) {
            resp.set_header("Access-Control-Allow-Origin", &origin);
            resp.set_header("Access-Control-Expose-Headers", "X-Request-Id");
            resp.set_header("Vary", "Origin");
        }
        resp
    }

    async fn dispatch(&self, req: &Request) -> Response {
        let known = matches!(
            req.path.as_str(),
            "/healthz" | "/readyz" | "/fizzbuzz" | "/stats"
        );
        if !known {
            return Response::error(404, "not found");
        }
        if req.method != "GET" {
            return Response::error(405, "method not allowed").with_header("Allow", "GET");
        }

        match req.path.as_str() {
            "/healthz" => Response::text(200, "ok"),
            "/readyz" => self.readyz().await,
            "/fizzbuzz" => match limited(&self.fizzbuzz_limiter, req) {
                Some(resp) => resp,
                None => self.fizzbuzz(req).await,
            },
            _ => match limited(&self.stats_limiter, req) {
                Some(resp) => resp,
                None => self.stats_top().await,
            },
        }
    }

    async fn fizzbuzz(&self, req: &Request) -> Response {
        let params = req.query_params();
        let signature = match validate_fizzbuzz(&params, &self.config) {
            Ok(signature) => signature,
            Err(e) => return Response::error(400, &e.to_string()),
        };

        if let Some(stats) = &self.stats {
            if let Err(e) = stats.record(&signature).await {
                warn!(error = %e, backend = stats.backend(), "failed to record stats");
            }
        }

        let out = fizzbuzz::generate(
            signature.int1(),
            signature.int2(),
            signature.limit(),
            signature.str1(),
            signature.str2(),
        );
        Response::json(200, &out)
    }

    async fn stats_top(&self) -> Response {
        let Some(stats) = &self.stats else {
            return Response::no_content();
        };
        match stats.most_frequent().await {
            Ok(Some(top)) => Response::json(200, &top),
            Ok(None) => Response::no_content(),
            Err(e) => {
                warn!(error = %e, backend = stats.backend(), "failed to read stats");
                Response::no_content()
            }
        }
    }

    async fn readyz(&self) -> Response {
        if let Some(stats) = &self.stats {
            let probe = tokio::time::timeout(READY_PROBE_TIMEOUT, stats.ready()).await;
            let failure = match probe {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("readiness probe timed out".to_string()),
            };
            if let Some(reason) = failure {
                warn!(reason = %reason, backend = stats.backend(), "not ready");
                return Response::error(503, "stats backend not ready");
            }
        }
        Response::text(200, "ready")
    }

    // -----------------------------------------------------------------------
    // CORS
    // -----------------------------------------------------------------------

    fn allowed_origin(&self, req: &Request) -> Option<String> {
        if !self.config.cors.enabled {
            return None;
        }
        let origin = req.header("Origin")?;
        let origins = &self.config.cors.allowed_origins;
        if origins.iter().any(|o| o == "*") {
            Some("*".to_string())
        } else if origins.iter().any(|o| o.eq_ignore_ascii_case(origin)) {
            Some(origin.to_string())
        } else {
            None
        }
    }

    /// With CORS on, every preflight is answered here and never routed.
    fn is_preflight(&self, req: &Request) -> bool {
        self.config.cors.enabled
            && req.method == "OPTIONS"
            && req.header("Access-Control-Request-Method").is_some()
    }

    /// Unknown origins get a bare 204 with no `Access-Control-*` grants.
    fn preflight(&self, req: &Request) -> Response {
        let Some(origin) = self.allowed_origin(req) else {
            return Response::no_content();
        };
        Response::no_content()
            .with_header("Access-Control-Allow-Origin", &origin)
            .with_header("Access-Control-Allow-Methods", "GET, OPTIONS")
            .with_header("Access-Control-Allow-Headers", CORS_ALLOWED_HEADERS)
            .with_header("Access-Control-Max-Age", &CORS_MAX_AGE_SECS.to_string())
    }
}

/// 429 response when `req`'s client has used up its budget.
fn limited(limiter: &RateLimiter, req: &Request) -> Option<Response> {
    let decision = limiter.check(client_ip(req));
    if let Decision::Denied { .. } = decision {
        let retry = decision.retry_after_secs().unwrap_or(1);
        return Some(
            Response::error(429, "too many requests")
                .with_header("Retry-After", &retry.to_string()),
        );
    }
    None
}

/// Client address: `X-Real-IP`, then the first `X-Forwarded-For` entry, then
/// the socket peer. Assumes a trusted proxy sets those headers.
pub fn client_ip(req: &Request) -> IpAddr {
    let forwarded = req
        .header("X-Real-IP")
        .or_else(|| {
            req.header("X-Forwarded-For")
                .and_then(|v| v.split(',').next())
        })
        .and_then(|v| v.trim().parse().ok());
    forwarded.unwrap_or(req.peer)
}

/// Incoming `X-Request-Id` if it is short printable ASCII, else a new UUID.
pub fn request_id(req: &Request) -> String {
    match req.header("X-Request-Id") {
        Some(id)
            if !id.is_empty()
                && id.len() <= MAX_REQUEST_ID_LEN
                && id.bytes().all(|b| b.is_ascii_graphic()) =>
        {
            id.to_string()
        }
        _ => Uuid::new_v4().to_string(),
    }
}

/// Check `/fizzbuzz` parameters in order and build the request signature.
pub fn validate_fizzbuzz(
    params: &HashMap<String, String>,
    config: &Config,
) -> Result<Signature, ValidationError> {
    let get = |key: &str| params.get(key).map(String::as_str).unwrap_or("");

    let int1 = positive_int(get("int1")).ok_or(ValidationError::NotPositive("int1"))?;
    let int2 = positive_int(get("int2")).ok_or(ValidationError::NotPositive("int2"))?;
    let limit = positive_int(get("limit")).ok_or(ValidationError::NotPositive("limit"))?;
    if limit > config.max_limit {
        return Err(ValidationError::LimitTooLarge);
    }

    let (str1, str2) = (get("str1"), get("str2"));
    if str1.is_empty() || str2.is_empty() {
        return Err(ValidationError::EmptyString);
    }
    if has_control_chars(str1) || has_control_chars(str2) {
        return Err(ValidationError::ControlCharacters);
    }
    if str1.len() > config.max_str_len || str2.len() > config.max_str_len {
        return Err(ValidationError::StringTooLong);
    }

    Ok(Signature::new(int1, int2, limit, str1, str2))
}

fn positive_int(s: &str) -> Option<u64> {
    s.parse::<u64>().ok().filter(|n| *n > 0)
}

fn has_control_chars(s: &str) -> bool {
    s.chars().any(char::is_control)
}
