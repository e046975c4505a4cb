//! Rate limiting ports and application service.
//!
//! Counts requests per identity in a fixed main window plus a short burst
//! sub-window, selected by tier, and escalates repeat offenders to bans.
//! Counters live in the store; this service holds no mutable state.

mod config;
mod ports;
mod service;

#[cfg(test)]
mod tests;

pub use config::{RateLimitConfig, default_thresholds};
pub use ports::RateLimitRepository;
pub use service::RateLimitService;
