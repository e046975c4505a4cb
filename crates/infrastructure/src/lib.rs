//! Infrastructure adapters for application ports.

#![forbid(unsafe_code)]

mod in_memory_security_store;
mod postgres_nonce_repository;
mod postgres_rate_limit_repository;
mod postgres_threat_event_repository;
mod redis_nonce_repository;
mod redis_rate_limit_repository;
mod system_clock;

pub use in_memory_security_store::InMemorySecurityStore;
pub use postgres_nonce_repository::PostgresNonceRepository;
pub use postgres_rate_limit_repository::PostgresRateLimitRepository;
pub use postgres_threat_event_repository::PostgresThreatEventRepository;
pub use redis_nonce_repository::RedisNonceRepository;
pub use redis_rate_limit_repository::RedisRateLimitRepository;
pub use system_clock::SystemClock;
