//! # Switchyard
//!
//! A bounded, streaming task-dispatch engine with multi-provider fallback.
//!
//! This library provides:
//! - A uniform [`provider::ProviderClient`] interface over interchangeable
//!   text-generation backends, with a typed error taxonomy
//! - [`chain::FallbackChain`]: ordered providers with per-link circuit
//!   breakers, bounded retries, and explicit switch events
//! - An agent registry with atomic snapshot swaps and a deterministic
//!   [`router::Router`]
//! - [`supervisor::TaskSupervisor`]: per-request lifecycle, budget
//!   enforcement, and an event stream with exactly one terminal event
//!
//! ## Dispatch Flow
//! 1. Route the request to an agent (override, capability tags, default)
//! 2. Walk the agent's fallback chain, skipping open circuits
//! 3. Stream `Token` events through the budget gate as they arrive
//! 4. Emit one terminal `Done` or `Error` event and return the result
//!
//! ## Modules
//! - `provider`: backend clients (OpenAI-compatible SSE, scripted test double)
//! - `chain`: fallback chain, circuit breakers, fallback journal
//! - `agent`: agent specs, registry snapshots, persistent catalog
//! - `supervisor`: request lifecycle and budget gating

pub mod agent;
pub mod chain;
pub mod circuit;
pub mod config;
pub mod event;
pub mod provider;
pub mod request;
pub mod router;
pub mod supervisor;

pub use chain::{FallbackChain, ProviderLink};
pub use config::Config;
pub use event::{Event, EventSink};
pub use request::{Budget, DispatchResult, DispatchStatus, Request};
pub use supervisor::TaskSupervisor;
