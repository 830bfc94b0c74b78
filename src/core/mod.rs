//! Core ticket and packet-filter logic
//!
//! - [`address`]: MAC/IPv4/IPv6 address type and family split
//! - [`tickets`]: Time-limited access grants and their persistent store
//! - [`config_store`]: Named allow/block list files
//! - [`policy`]: Compiles lists, resolved domains and tickets into set contents
//! - [`sync`]: Diffs compiled sets against the live filter and applies the delta
//! - [`filter`] / [`nft`]: Packet filter capability and its nftables backend
//! - [`resolver`]: Domain resolution for the remote allowlist
//! - [`error`]: Error types shared across the crate

pub mod address;
pub mod clock;
pub mod config_store;
pub mod error;
pub mod filter;
pub mod nft;
pub mod policy;
pub mod resolver;
pub mod state;
pub mod sync;
pub mod tickets;

#[cfg(test)]
pub mod test_helpers;
