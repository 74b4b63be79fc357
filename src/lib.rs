//! Crystal: policy-driven automation for object storage pipelines.
//!
//! Operators declare rules such as
//! `TENANT alice WHEN put_bw > 100 DO SET compress TRANSIENT` and the
//! engine turns them into persistent policies: static ones are inserted
//! into a target's filter pipeline immediately, dynamic ones become
//! long-lived monitors that watch the metric stream and apply the filter
//! action when their condition fires.
//!
//! # Architecture
//!
//! * `crystal_core`: configuration, canonical errors, tracing and database helpers
//! * `crystal_protocol`: persisted records and wire types shared by every crate
//! * `crystal_rules`: compiled rules, conditions and the rule parser seam
//! * `crystal_engine`: registry, resolver, dispatcher, monitors and the HTTP boundary

pub use crystal_core;
pub use crystal_engine;
pub use crystal_protocol;
pub use crystal_rules;

// Commonly used re-exports
pub use crystal_engine::{EngineError, MonitorManager, PolicyRegistry, PolicyService};
pub use crystal_protocol::{DynamicPolicyRecord, MetricSample, ResolvedTarget, StaticPolicyEntry};
pub use crystal_rules::{CompiledRule, DslParser, RuleParser};
