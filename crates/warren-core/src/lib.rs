//! warren-core - Sandbox Worker Orchestration Core Library
//!
//! Core types shared by the warren orchestrator: the wire protocol spoken
//! with the sandbox host process, worker identity and lifecycle state,
//! per-worker scoped filesystems, correlation tables for in-flight
//! request/response pairs, and configuration.
//!
//! This crate is transport-light on purpose. It defines what travels over
//! the host channel and how worker state may move; the process supervision
//! and routing live in `warren-orchestrator`.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration for the orchestrator and host process
//! - [`pending`]: Bounded correlation tables for in-flight requests
//! - [`protocol`]: Newline-delimited JSON protocol with the host process
//! - [`scoped_fs`]: Per-worker filesystem roots with escape protection
//! - [`worker`]: Worker identity, options, and lifecycle state machine

pub mod config;
pub mod pending;
pub mod protocol;
pub mod scoped_fs;
pub mod worker;
