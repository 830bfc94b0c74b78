//! SBS - ticketed network access
//!
//! Grants client devices (by MAC, IPv4 or IPv6 address) time-limited
//! network access and enforces it through nftables sets.
//!
//! # Architecture
//!
//! - [`core`] - Addresses, ticket and list stores, policy compiler, set synchronizer
//! - [`service`] - Ties the stores to the compiler and runs the background tasks
//! - [`rpc`] - JSON method dispatch and the unix socket transport
//! - [`audit`] - Audit log of access-changing operations
//! - [`validators`] - Input validation and sanitization
//! - [`config`] - Daemon settings
//! - [`elevation`] - Running nft with elevated privileges
//!
//! # Enforcement guarantees
//!
//! - Blocklisted addresses never appear in an allow set
//! - Set updates are per-element diffs; sets are never flushed
//! - Tickets survive restarts; expired ones are dropped on load
//! - Atomic file writes with 0600 permissions and SHA-256 sidecars

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::needless_lifetimes)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::missing_errors_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod elevation;
pub mod rpc;
pub mod service;
pub mod validators;

pub use core::error::{Error, Result};
