//! # RPC Access Core
//!
//! Resilient access to blockchain JSON-RPC providers.
//!
//! This crate provides:
//!
//! - **[`upstream`]**: A pool of HTTP endpoints per chain with a reservation-based rate budget,
//!   cooldowns, quota quarantine, round-robin selection preferring free providers,
//!   `with_retry` with rollover, and a self-healing monitor.
//!
//! - **[`websocket`]**: Self-sustaining `newHeads` subscriptions with heartbeats, jittered
//!   reconnection and a circuit breaker, plus a manager that fails over between them.
//!
//! - **[`gas_cache`]**: A short-lived fee cache with request coalescing and stale fallback.
//!
//! - **[`events`]**: Operational notifications fanned out over a broadcast bus.
//!
//! - **[`runtime`]**: Per-chain facades and the lifecycle that owns them.
//!
//! ## Request Flow
//!
//! ```text
//! with_retry(op)
//!       │
//!       ▼
//! ┌──────────────┐   none eligible   ┌────────────────────┐
//! │ get_provider │ ────────────────► │ emergency recovery │
//! └──────┬───────┘                   └─────────┬──────────┘
//!        │◄────────────────────────────────────┘
//!        ▼
//! ┌──────────────┐   window full   ┌──────────────────────┐
//! │ reserve slot │ ──────────────► │ wait / pick another  │
//! └──────┬───────┘                 └──────────────────────┘
//!        ▼
//!   throttle, op(endpoint)
//!        │
//!   ┌────┴─────────────┬───────────────────────┐
//!   ▼                  ▼                       ▼
//! success       rate/quota limited        other failure
//!   │           cooldown + rollover       penalty + backoff
//!   ▼           (no attempt spent)        (attempt spent)
//! result
//! ```

pub mod config;
pub mod events;
pub mod gas_cache;
pub mod runtime;
pub mod types;
pub mod upstream;
pub mod websocket;
