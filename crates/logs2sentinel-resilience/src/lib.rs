// logs2sentinel-resilience - reliability primitives
//
// The cross-cutting machinery every remote-facing component leans on:
// - token-bucket rate limiter (admission control for outbound calls)
// - three-state circuit breaker (fail fast while a dependency is down)
// - bounded exponential-backoff retry with jitter
// - read-through credential cache over a pluggable secret store, with
//   at-rest encryption of cache entries
//
// All primitives are async-first: waiting happens via tokio::time, never
// while holding a lock.

pub mod circuit_breaker;
pub mod credentials;
pub mod rate_limit;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState,
};
pub use credentials::{
    CredentialCache, CredentialCacheConfig, CredentialError, MemorySecretStore, SecretStore,
    SecretStoreError,
};
pub use rate_limit::{RateLimitError, RateLimiter};
pub use retry::{retry, RetryPolicy};
