#![forbid(unsafe_code)]

//! # Nodeforge
//!
//! An event-driven runtime that hosts a fixed population of typed processing
//! nodes. Nodes are described by declarative YAML contracts rather than code:
//! a contract names a protocol (REST, Cypher-over-Bolt, SQL, or broker
//! production), an ordered table of operations, and a resilience policy. The
//! runtime turns contracts into live consumers, producers, and handler pools
//! with uniform backpressure and resilience semantics.
//!
//! The hot path runs one direction: broker → router → executor → (resilience
//! pipeline → protocol handler) → publisher → broker. Contracts are loaded
//! and validated once at startup and never mutated afterward.
//!
//! ## Quick start
//!
//! ```rust
//! use nodeforge::resilience::{Backoff, Jitter, RetryPolicy, ResiliencePipeline, ResiliencePipelineBuilder};
//! use nodeforge::resilience::ResilienceError;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[derive(Debug, Clone)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "flaky")
//!     }
//! }
//! impl std::error::Error for Flaky {}
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), ResilienceError<Flaky>> {
//! let attempts = Arc::new(AtomicUsize::new(0));
//! let retry = RetryPolicy::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(50)))
//!     .with_jitter(Jitter::full())
//!     .build()?;
//! let pipeline: ResiliencePipeline<Flaky> = ResiliencePipelineBuilder::new()
//!     .retry(retry)
//!     .timeout(Duration::from_secs(1))?
//!     .build();
//!
//! pipeline
//!     .execute(|| {
//!         let attempts = attempts.clone();
//!         async move {
//!             let n = attempts.fetch_add(1, Ordering::Relaxed);
//!             if n < 2 { Err(ResilienceError::Inner(Flaky)) } else { Ok(()) }
//!         }
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod config;
pub mod contract;
pub mod envelope;
pub mod error;
pub mod executor;
pub mod handler;
pub mod health;
pub mod metrics;
pub mod path;
pub mod publisher;
pub mod registry;
pub mod resilience;
pub mod router;
pub mod substitute;

pub use contract::{Contract, Operation};
pub use envelope::{CorrelationId, Envelope};
pub use error::{ErrorCode, NodeforgeError};
pub use executor::{EffectInput, EffectOutput, Executor};
pub use handler::{HandlerRequest, HandlerResponse, ProtocolHandler};
pub use registry::{NodeRegistry, RuntimeProfile};
