//! Ticket store
//!
//! The authoritative table of active tickets. A ticket grants one address
//! access until its expiry; adding a ticket for an address that already has
//! one replaces it.
//!
//! Every mutation is written to the state file before it is applied in
//! memory. If the write fails the in-memory table is unchanged and the
//! caller gets [`Error::Io`], so a restart always reconstructs exactly the
//! committed set of tickets.

use crate::core::address::Address;
use crate::core::error::{Error, Result};
use crate::core::state;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Version tag of the persisted ticket file
pub const STATE_VERSION: u32 = 1;

/// A time-limited grant of network access for one address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticket {
    pub address: Address,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// Requested duration in seconds, reported as `timeout`
    pub duration_secs: u64,
    pub comment: String,
}

impl Ticket {
    pub fn new(address: Address, duration_secs: u64, comment: String, now: DateTime<Utc>) -> Self {
        Self {
            address,
            created_at: now,
            expires_at: now + Duration::seconds(duration_secs as i64),
            duration_secs,
            comment,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whole seconds until expiry, zero once expired.
    pub fn remaining_secs(&self, now: DateTime<Utc>) -> u64 {
        (self.expires_at - now).num_seconds().max(0) as u64
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedTickets {
    version: u32,
    tickets: Vec<Ticket>,
}

type TicketTable = BTreeMap<Address, Ticket>;

/// In-memory ticket table with write-through persistence.
///
/// Mutations are serialized by the write half of the lock, readers share
/// the read half.
#[derive(Debug)]
pub struct TicketStore {
    tickets: RwLock<TicketTable>,
    path: Option<PathBuf>,
}

impl TicketStore {
    /// A store that keeps tickets in memory only (dry-run and tests).
    pub fn in_memory() -> Self {
        Self {
            tickets: RwLock::new(BTreeMap::new()),
            path: None,
        }
    }

    /// Loads persisted tickets from `path`, dropping any that expired while
    /// the daemon was down.
    ///
    /// A missing file yields an empty store.
    pub async fn open(path: PathBuf, now: DateTime<Utc>) -> Result<Self> {
        let mut table = BTreeMap::new();

        if let Some(json) = state::read_with_checksum(&path).await? {
            let persisted: PersistedTickets = serde_json::from_str(&json)?;
            if persisted.version != STATE_VERSION {
                return Err(Error::Internal(format!(
                    "Ticket state version mismatch: found v{}, expected v{}",
                    persisted.version, STATE_VERSION
                )));
            }

            let total = persisted.tickets.len();
            for ticket in persisted.tickets {
                if !ticket.is_expired(now) {
                    table.insert(ticket.address, ticket);
                }
            }
            info!(
                "Recovered {} ticket(s) from {} ({} expired while down)",
                table.len(),
                path.display(),
                total - table.len()
            );
        }

        Ok(Self {
            tickets: RwLock::new(table),
            path: Some(path),
        })
    }

    async fn persist(&self, table: &TicketTable) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let persisted = PersistedTickets {
            version: STATE_VERSION,
            tickets: table.values().cloned().collect(),
        };
        let json = serde_json::to_string_pretty(&persisted)?;
        state::write_with_checksum(path, json.as_bytes()).await?;
        Ok(())
    }

    /// Issues or refreshes the ticket for `ticket.address`.
    ///
    /// Validation of address, duration and comment happens before the
    /// ticket is built; see [`crate::service::Service::add_ticket`].
    pub async fn add(&self, ticket: Ticket) -> Result<Ticket> {
        let mut table = self.tickets.write().await;

        let mut next = table.clone();
        let replaced = next.insert(ticket.address, ticket.clone()).is_some();
        self.persist(&next).await?;
        *table = next;

        if replaced {
            info!("Refreshed ticket for {} ({}s)", ticket.address, ticket.duration_secs);
        } else {
            info!("Issued ticket for {} ({}s)", ticket.address, ticket.duration_secs);
        }
        Ok(ticket)
    }

    /// Removes the ticket for `address`. Returns whether one existed.
    pub async fn delete(&self, address: &Address) -> Result<bool> {
        let mut table = self.tickets.write().await;
        if !table.contains_key(address) {
            return Ok(false);
        }

        let mut next = table.clone();
        next.remove(address);
        self.persist(&next).await?;
        *table = next;

        info!("Deleted ticket for {}", address);
        Ok(true)
    }

    /// Active tickets, soonest-expiring first.
    pub async fn list(&self) -> Vec<Ticket> {
        let table = self.tickets.read().await;
        let mut tickets: Vec<Ticket> = table.values().cloned().collect();
        tickets.sort_by(|a, b| {
            a.expires_at
                .cmp(&b.expires_at)
                .then_with(|| a.address.cmp(&b.address))
        });
        tickets
    }

    /// Tickets not yet expired at `now`, in address order.
    pub async fn active(&self, now: DateTime<Utc>) -> Vec<Ticket> {
        let table = self.tickets.read().await;
        table
            .values()
            .filter(|t| !t.is_expired(now))
            .cloned()
            .collect()
    }

    /// Removes and returns every ticket with `expires_at <= now`.
    pub async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<Ticket>> {
        let mut table = self.tickets.write().await;

        let due: Vec<Address> = table
            .values()
            .filter(|t| t.is_expired(now))
            .map(|t| t.address)
            .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }

        let mut next = table.clone();
        let expired: Vec<Ticket> = due.iter().filter_map(|a| next.remove(a)).collect();
        if let Err(e) = self.persist(&next).await {
            warn!("Failed to persist expiry of {} ticket(s): {}", expired.len(), e);
            return Err(e);
        }
        *table = next;

        for ticket in &expired {
            info!("Ticket for {} expired", ticket.address);
        }
        Ok(expired)
    }

    pub async fn len(&self) -> usize {
        self.tickets.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tickets.read().await.is_empty()
    }
}
