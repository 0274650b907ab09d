//! Per-event synchronization server for collaborative incident logs.
//!
//! One authoritative instance per event SKU: a durable log plus broadcast
//! hub. Clients authenticate every request with their P-256 key; admission
//! is by invitation rooted in the instance creator.

pub mod auth;
pub mod config;
pub mod db;
pub mod export;
pub mod instance;
pub mod membership;
pub mod server;
pub mod web;
