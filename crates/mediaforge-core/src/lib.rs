//! Core type definitions and trait seams for mediaforge.
//!
//! This crate contains everything the other workspace members agree on:
//! - domain types (projects, stages, artifacts, telemetry rows)
//! - the `StageProcessor` contract that stage implementations plug into
//! - the dependency planner that turns a workflow into execution phases
//! - store and workspace traits (implementations live in `mediaforge-store`
//!   and `mediaforge-files`)

pub mod layout;
pub mod planner;
pub mod stage;
pub mod store;
pub mod types;
pub mod workspace;
