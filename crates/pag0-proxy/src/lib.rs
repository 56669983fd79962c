//! pag0 proxy: the payment-aware reverse proxy.
//!
//! Two HTTP surfaces share one pipeline:
//!
//! - `POST /proxy` — JSON-envelope surface: target, method, headers, body,
//!   and an optional signed payment in one request document; responses come
//!   wrapped with cost/cache/budget metadata.
//! - `/relay` (any method) — transparent surface: the original request
//!   passes through with `X-Pag0-Target-Url` selecting the upstream, and
//!   metadata rides in `x-pag0-*` response headers. Upstream 402s are
//!   relayed byte-for-byte.
//!
//! Around the pipeline sit spend policies and budgets, response caching,
//! replay protection, endpoint curation, and the on-chain audit trail.

pub mod analytics;
pub mod audit;
pub mod budget;
pub mod cache;
pub mod config;
pub mod curation;
pub mod onchain;
pub mod policy;
pub mod proxy;
mod relay;
pub mod shutdown;
mod wildcard;
pub mod x402;

pub use proxy::{build_router, AppState};
pub use shutdown::{shutdown_signal, ShutdownCoordinator};
