//! # eventgate
//!
//! Multi-tenant event classification. Raw events are resolved to a
//! registered type, validated and fingerprinted, then run through their
//! tenant's rules. The first rule that marks an event handled is recorded
//! in Postgres, which also suppresses repeats inside the rule's dedup window.

pub mod cancel;
pub mod config;
pub mod db;
pub mod error;
pub mod evaluator;
pub mod event;
pub mod events;
pub mod janitor;
pub mod model;
pub mod processor;
pub mod registry;
pub mod rules;
pub mod store;
pub mod telemetry;

pub use error::{Error, Result};
