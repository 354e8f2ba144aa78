//! # fizzbuzz-api
//!
//! A small HTTP API that computes generalized FizzBuzz sequences and tracks
//! which parameter combination is requested most often.
//!
//! ```text
//! GET /fizzbuzz?int1=3&int2=5&limit=16&str1=fizz&str2=buzz
//!   -> ["1","2","fizz","4","buzz",...,"fizzbuzz","16"]
//! GET /stats
//!   -> {"parameters":{"int1":3,"int2":5,"limit":16,"str1":"fizz","str2":"buzz"},"hits":1}
//! ```
//!
//! ## Layout
//!
//! - [`fizzbuzz`]: the pure sequence generator.
//! - [`stats`]: signature counting behind [`stats::StatsRepository`], with an
//!   in-memory and a Redis backend.
//! - [`routes`]: request routing, validation and response headers.
//! - [`http`], [`web`]: HTTP/1.1 parsing and the TCP server loop.
//! - [`ratelimit`]: per-client fixed-window limiter.
//! - [`config`], [`cli`], [`healthcheck`], [`error`]: process plumbing.

pub mod cli;
pub mod config;
pub mod error;
pub mod fizzbuzz;
pub mod healthcheck;
pub mod http;
pub mod ratelimit;
pub mod routes;
pub mod stats;
pub mod web;
