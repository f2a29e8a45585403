//! metrond: a configurable in-process metric aggregation engine.
//!
//! Consumers install declarative configurations that name the atoms to
//! watch, boolean predicates over them, the aggregations to compute (counts,
//! durations, event captures, gauges), how to slice results by dimension and
//! state, and which aggregates should raise alerts. The engine evaluates
//! every ingested atom against each installed configuration and emits
//! periodic reports plus real-time anomaly signals.
//!
//! Entry points: [`engine::Engine`] for the multi-configuration front door,
//! [`config::EngineConfig`] for the declarative schema, and
//! [`wire::AtomStream`] for the inbound atom format.

pub mod anomaly;
pub mod condition;
pub mod config;
pub mod dimension;
pub mod engine;
pub mod external;
pub mod field;
pub mod guardrail;
pub mod matcher;
pub mod metrics;
pub mod report;
pub mod snapshot;
pub mod state;
pub mod wire;
