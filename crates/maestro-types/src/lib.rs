//! Shared domain types for the Maestro orchestration platform.
//!
//! This crate holds the serde-derived types that every layer agrees on:
//! workflow definitions, execution lifecycle state, step records,
//! checkpoints, agent profiles, events, and configuration. It depends only
//! on serialization and id/time crates -- never on the runtime or on any
//! storage crate.

pub mod agent;
pub mod config;
pub mod error;
pub mod event;
pub mod workflow;
