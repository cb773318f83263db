//! Durable scheduler adapter for the cascade workflow engine.
//!
//! The engine's orchestration machine is pure; this crate gives it
//! durability:
//!
//! - **History**: every signal the machine consumes is appended to a
//!   per-execution event log. Crash recovery rebuilds the machine by
//!   replaying the log; the event stream is the source of truth.
//! - **Stores**: an [`ExecutionStore`] trait with a JetStream-backed
//!   implementation for production and an in-memory one for tests and
//!   embedded runs.
//! - **Worker**: pulls queued executions, drives their machines, runs
//!   step tasks under a timeout, retry policy and concurrency bound, and
//!   arms durable timers (re-armed from history after restarts).
//! - **Client**: start / status / result / cancel over the same store.

pub mod client;
pub mod event;
pub mod memory;
pub mod nats;
pub mod store;
pub mod worker;

pub use client::{ExecutionClient, ExecutionStatusReport, ReportedStatus};
pub use event::{HistoryEvent, ReplayOutcome, replay};
pub use memory::InMemoryExecutionStore;
pub use nats::{NatsExecutionStore, SchedulerConnection};
pub use store::{ExecutionRequest, ExecutionStore, StoreError};
pub use worker::{RetryPolicy, Worker, WorkerConfig, WorkerError};
