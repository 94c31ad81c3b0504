//! PostRoute Core - State-driven mail processing pipeline
//!
//! This crate provides the routing engine for PostRoute: named processor
//! chains of matcher/mailet pairs, the state router that drives a mail
//! through them until a terminal outcome, the score aggregation and
//! threshold gate shared with the protocol hook layer, and the spool
//! dispatcher that feeds mail into the router from a worker pool.

pub mod hooks;
pub mod mailets;
pub mod matchers;
pub mod pipeline;
pub mod score;
pub mod spool;

pub use hooks::{run_hooks, HookResult, HookReturnCode, HookSession, MessageHook, ScoreGateHook};
pub use pipeline::{
    CapabilityRegistry, LinearChain, Mailet, Matched, Matcher, StateRouter, StepError,
};
pub use score::{
    ComposedScore, GateAction, GateOutcome, RejectContext, Rejection, ScoreBoard, ScoreGate,
};
pub use spool::SpoolDispatcher;
