//! # retrace-core
//!
//! Core types and the diff engine for Retrace.
//!
//! This crate provides the foundational types shared across all Retrace crates:
//! - Audit record and field-detail entity structs
//! - Action/channel/failure enums
//! - The type-erased entity model (static fields + dynamic attributes)
//! - Point-in-time snapshots and the pure before/after diff engine
//! - The operation context value type carried across a logical operation
//! - ID prefix constants
//! - Cross-cutting error types
//!
//! Everything here is persistence-agnostic: no database handles, no async.

pub mod context;
pub mod diff;
pub mod entities;
pub mod entity;
pub mod enums;
pub mod errors;
pub mod ids;
pub mod snapshot;
