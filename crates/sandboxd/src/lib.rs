//! Per-user sandbox session orchestrator.
//!
//! `sandboxd` runs one container per user with a fixed port triple (SSH,
//! HTTP, agent), exposes the container through Cloudflare DNS and tunnel
//! ingress, bridges browser terminals to SSH over WebSockets, and drives
//! coding-agent tasks against the `sandbox-runner` companion inside each
//! container.

pub mod agent;
pub mod api;
pub mod auth;
pub mod config;
pub mod container;
pub mod db;
pub mod exposure;
pub mod notify;
pub mod ports;
pub mod runner;
pub mod session;
pub mod terminal;
pub mod vault;
