//! Ticket service
//!
//! Owns the ticket and config stores and turns every mutation into a
//! recompute request. Requests go through a single-slot [`RecomputeSignal`]
//! consumed by one recompute task, so a burst of mutations collapses into
//! one compile + apply of the latest state and mutation latency never
//! depends on nft.
//!
//! # Background tasks
//!
//! - [`Service::run_recompute_loop`]: waits for the signal, compiles, applies
//! - [`Service::run_scheduler`]: expires due tickets every tick and
//!   periodically re-resolves the remote allowlist
//!
//! Errors in either task are logged and retried on the next trigger; the
//! tasks never exit on their own.

use crate::audit::{AuditLog, EventType};
use crate::core::address::Address;
use crate::core::clock::Clock;
use crate::core::config_store::{ConfigStore, ListName};
use crate::core::error::{Error, Result};
use crate::core::filter::PacketFilter;
use crate::core::policy::{CompiledSets, PolicyInputs, compile};
use crate::core::resolver::DomainResolver;
use crate::core::sync::{ApplyReport, SetSynchronizer};
use crate::core::tickets::{Ticket, TicketStore};
use crate::validators::{sanitize_comment, validate_domain, validate_duration};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::IntoEnumIterator;
use tokio::sync::{Notify, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::AbortHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Single-slot pending-recompute flag.
///
/// Any number of `request` calls before the consumer wakes up result in one
/// recompute.
#[derive(Debug, Default)]
pub struct RecomputeSignal {
    pending: AtomicBool,
    notify: Notify,
}

impl RecomputeSignal {
    pub fn request(&self) {
        self.pending.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    /// Clears the flag, returning whether a recompute was pending.
    pub fn take(&self) -> bool {
        self.pending.swap(false, Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    /// Waits until a recompute is pending and claims it.
    pub async fn wait(&self) {
        loop {
            if self.take() {
                return;
            }
            self.notify.notified().await;
        }
    }
}

/// Parts a [`Service`] is assembled from.
pub struct ServiceParts {
    pub tickets: TicketStore,
    pub configs: ConfigStore,
    pub filter: Arc<dyn PacketFilter>,
    pub resolver: Arc<dyn DomainResolver>,
    pub clock: Arc<dyn Clock>,
    pub apply_timeout: Duration,
    pub audit: Option<AuditLog>,
}

pub struct Service {
    tickets: TicketStore,
    configs: ConfigStore,
    resolver: Arc<dyn DomainResolver>,
    sync: SetSynchronizer,
    clock: Arc<dyn Clock>,
    audit: Option<AuditLog>,
    /// Remote allowlist entry to the addresses it last resolved to
    resolved: RwLock<BTreeMap<String, BTreeSet<Address>>>,
    /// Held across compile + apply
    apply_lock: AsyncMutex<()>,
    signal: RecomputeSignal,
    apply_failed: AtomicBool,
    processing: Mutex<HashMap<ListName, (u64, AbortHandle)>>,
    process_generation: AtomicU64,
}

impl Service {
    pub fn new(parts: ServiceParts) -> Self {
        Self {
            tickets: parts.tickets,
            configs: parts.configs,
            resolver: parts.resolver,
            sync: SetSynchronizer::new(parts.filter, parts.apply_timeout),
            clock: parts.clock,
            audit: parts.audit,
            resolved: RwLock::new(BTreeMap::new()),
            apply_lock: AsyncMutex::new(()),
            signal: RecomputeSignal::default(),
            apply_failed: AtomicBool::new(false),
            processing: Mutex::new(HashMap::new()),
            process_generation: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    pub fn signal(&self) -> &RecomputeSignal {
        &self.signal
    }

    async fn audit(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        if let Some(audit) = &self.audit {
            audit.record(event_type, success, details, error).await;
        }
    }

    // ── Tickets ──────────────────────────────────────────────────────────

    /// Issues (or refreshes) a ticket and requests a recompute.
    ///
    /// The reply does not wait for nft; application follows shortly after
    /// on the recompute task.
    pub async fn add_ticket(&self, addr: &str, duration_secs: i64, comment: &str) -> Result<Ticket> {
        let address: Address = addr.parse()?;
        let duration = validate_duration(duration_secs)?;
        let ticket = Ticket::new(address, duration, sanitize_comment(comment), self.now());

        let result = self.tickets.add(ticket).await;
        self.audit(
            EventType::AddTicket,
            result.is_ok(),
            json!({ "addr": address.to_string(), "duration": duration }),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;

        let ticket = result?;
        self.signal.request();
        Ok(ticket)
    }

    /// Removes the ticket for `addr`; absent tickets are not an error.
    pub async fn delete_ticket(&self, addr: &str) -> Result<bool> {
        let address: Address = addr.parse()?;
        let existed = self.tickets.delete(&address).await?;
        if existed {
            self.audit(
                EventType::DeleteTicket,
                true,
                json!({ "addr": address.to_string() }),
                None,
            )
            .await;
            self.signal.request();
        }
        Ok(existed)
    }

    /// Active tickets, soonest-expiring first.
    pub async fn tickets(&self) -> Vec<Ticket> {
        self.tickets.list().await
    }

    /// One expiry scheduler tick. Returns how many tickets expired.
    ///
    /// A recompute is requested only if something expired or the previous
    /// apply failed.
    pub async fn tick(&self) -> Result<usize> {
        let now = self.now();
        let expired = self.tickets.expire_due(now).await?;

        if !expired.is_empty() {
            let addrs: Vec<String> = expired.iter().map(|t| t.address.to_string()).collect();
            self.audit(EventType::ExpireTickets, true, json!({ "addrs": addrs }), None)
                .await;
            self.signal.request();
        } else if self.apply_failed.load(Ordering::SeqCst) {
            debug!("Retrying failed apply");
            self.signal.request();
        }

        Ok(expired.len())
    }

    // ── Config lists ─────────────────────────────────────────────────────

    pub async fn get_config(&self, name: ListName) -> Result<String> {
        self.configs.read(name).await
    }

    /// Stores new list content, then processes it.
    pub async fn set_config(self: &Arc<Self>, name: ListName, content: &str) -> Result<()> {
        self.configs.write(name, content).await?;
        self.process_config(name).await
    }

    /// Re-reads a list and applies the resulting policy.
    ///
    /// A newer call for the same list aborts this one, which then returns a
    /// [`Error::Process`] saying it was superseded.
    pub async fn process_config(self: &Arc<Self>, name: ListName) -> Result<()> {
        let generation = self.process_generation.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.process_list(name).await });

        {
            let mut running = self.processing.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some((_, previous)) = running.insert(name, (generation, handle.abort_handle())) {
                previous.abort();
            }
        }

        let outcome = handle.await;

        {
            let mut running = self.processing.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            if running.get(&name).is_some_and(|(g, _)| *g == generation) {
                running.remove(&name);
            }
        }

        match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                info!("Processing of {name} superseded by a newer request");
                Err(Error::Process {
                    list: name.to_string(),
                    failures: vec!["superseded by a newer process_config call".to_string()],
                })
            }
            Err(e) => Err(Error::Internal(format!("process_config task failed: {e}"))),
        }
    }

    /// Parses a list and reports invalid entries. For the remote allowlist
    /// this also re-resolves every domain.
    ///
    /// Returns the entry count and the per-entry failures.
    async fn load_list(&self, name: ListName) -> Result<(usize, Vec<String>)> {
        let entries = self.configs.parse(name).await?;
        let mut failures = Vec::new();

        match name {
            ListName::LocalBlocklist | ListName::LocalAllowlist => {
                for entry in &entries {
                    if let Err(e) = entry.parse::<Address>() {
                        failures.push(format!("{entry}: {e}"));
                    }
                }
            }
            ListName::RemoteAllowlist => {
                let previous = self.resolved.read().await.clone();
                let (resolved, resolve_failures) = self.resolve_entries(&entries, &previous).await;
                failures.extend(resolve_failures);
                info!(
                    "{name}: {} entries resolved to {} address(es)",
                    entries.len(),
                    resolved.values().map(BTreeSet::len).sum::<usize>()
                );
                *self.resolved.write().await = resolved;
            }
        }

        Ok((entries.len(), failures))
    }

    async fn process_list(&self, name: ListName) -> Result<()> {
        let (entries, mut failures) = self.load_list(name).await?;

        let report = self.recompute_and_apply().await?;
        failures.extend(report.failure_messages());

        self.audit(
            EventType::ProcessConfig,
            failures.is_empty(),
            json!({ "list": name.to_string(), "entries": entries }),
            (!failures.is_empty()).then(|| failures.join("; ")),
        )
        .await;

        if failures.is_empty() {
            Ok(())
        } else {
            for failure in &failures {
                warn!("{name}: {failure}");
            }
            Err(Error::Process {
                list: name.to_string(),
                failures,
            })
        }
    }

    /// Resolves remote allowlist entries. IP literals are taken as-is.
    ///
    /// A domain whose lookup fails keeps the addresses it had in
    /// `previous`, so a DNS outage does not revoke access; the failure is
    /// still reported.
    async fn resolve_entries(
        &self,
        entries: &[String],
        previous: &BTreeMap<String, BTreeSet<Address>>,
    ) -> (BTreeMap<String, BTreeSet<Address>>, Vec<String>) {
        let mut resolved = BTreeMap::new();
        let mut failures = Vec::new();

        for entry in entries {
            if let Ok(ip) = entry.parse::<IpAddr>() {
                resolved.insert(entry.clone(), BTreeSet::from([Address::from(ip)]));
                continue;
            }

            let domain = match validate_domain(entry) {
                Ok(domain) => domain,
                Err(e) => {
                    failures.push(format!("{entry}: {e}"));
                    continue;
                }
            };

            match self.resolver.resolve(&domain).await {
                Ok(addrs) => {
                    resolved.insert(domain, addrs.into_iter().map(Address::from).collect());
                }
                Err(e @ Error::Resolution { .. }) => {
                    if let Some(kept) = previous.get(&domain) {
                        warn!("Keeping {} stale address(es) for {domain}: {e}", kept.len());
                        resolved.insert(domain, kept.clone());
                    }
                    failures.push(e.to_string());
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        (resolved, failures)
    }

    /// Loads every list, then applies once; used at startup.
    ///
    /// Applying only after the remote allowlist is resolved keeps its
    /// addresses from being removed and re-added on restart.
    pub async fn process_all(&self) {
        for name in ListName::iter() {
            match self.load_list(name).await {
                Ok((_, failures)) => {
                    for failure in failures {
                        warn!("Startup processing of {name}: {failure}");
                    }
                }
                Err(e) => warn!("Startup processing of {name}: {e}"),
            }
        }

        match self.recompute_and_apply().await {
            Ok(report) => {
                for failure in report.failure_messages() {
                    warn!("Initial apply: {failure}");
                }
            }
            Err(e) => warn!("Initial apply failed, will retry: {e}"),
        }
    }

    // ── Compile + apply ──────────────────────────────────────────────────

    async fn local_list(&self, name: ListName) -> Result<BTreeSet<Address>> {
        Ok(self
            .configs
            .parse(name)
            .await?
            .iter()
            .filter_map(|entry| entry.parse::<Address>().ok())
            .collect())
    }

    /// Compiles the current policy without touching the filter.
    pub async fn compile_now(&self) -> Result<CompiledSets> {
        let now = self.now();
        let inputs = PolicyInputs {
            blocklist: self.local_list(ListName::LocalBlocklist).await?,
            allowlist: self.local_list(ListName::LocalAllowlist).await?,
            remote: self.resolved.read().await.values().flatten().copied().collect(),
            tickets: self.tickets.active(now).await,
        };
        Ok(compile(&inputs, now))
    }

    /// Compiles the current policy and applies it.
    ///
    /// Compile and apply run under one lock: an apply compiled from older
    /// state can never land after one compiled from newer state.
    ///
    /// Element failures are reported in the returned [`ApplyReport`] and
    /// mark the apply as failed so the next scheduler tick retries it.
    pub async fn recompute_and_apply(&self) -> Result<ApplyReport> {
        let _apply = self.apply_lock.lock().await;
        let compiled = match self.compile_now().await {
            Ok(compiled) => compiled,
            Err(e) => {
                self.apply_failed.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        let report = self.sync.apply(&compiled).await;
        self.apply_failed.store(!report.is_clean(), Ordering::SeqCst);

        if report.mutations() > 0 || !report.is_clean() {
            self.audit(
                EventType::ApplySets,
                report.is_clean(),
                json!({ "added": report.added, "removed": report.removed }),
                (!report.is_clean()).then(|| report.failure_messages().join("; ")),
            )
            .await;
        }
        Ok(report)
    }

    /// Runs a recompute if one is pending. Returns whether it ran.
    pub async fn run_pending(&self) -> bool {
        if !self.signal.take() {
            return false;
        }
        self.recompute_once().await;
        true
    }

    async fn recompute_once(&self) {
        if let Err(e) = self.recompute_and_apply().await {
            warn!("Recompute failed, will retry on next trigger: {e}");
        }
    }

    /// Live filter contents of every managed set.
    pub async fn live_sets(&self) -> Result<CompiledSets> {
        self.sync.live_sets().await
    }

    // ── Background tasks ─────────────────────────────────────────────────

    /// Consumes recompute requests forever.
    pub async fn run_recompute_loop(self: Arc<Self>) {
        loop {
            self.signal.wait().await;
            self.recompute_once().await;
        }
    }

    /// Expires tickets every `interval` and re-resolves the remote
    /// allowlist every `refresh`.
    ///
    /// Domain refreshes run as their own tasks so slow DNS never delays an
    /// expiry tick. A refresh still running when the next one starts is
    /// superseded by it.
    pub async fn run_scheduler(self: Arc<Self>, interval: Duration, refresh: Duration) {
        let mut expiry = tokio::time::interval(interval);
        expiry.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut domains = tokio::time::interval_at(tokio::time::Instant::now() + refresh, refresh);
        domains.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Expiry scheduler running every {}s, domain refresh every {}s",
            interval.as_secs(),
            refresh.as_secs()
        );

        loop {
            tokio::select! {
                _ = expiry.tick() => {
                    match self.tick().await {
                        Ok(0) => {}
                        Ok(n) => info!("Expired {n} ticket(s)"),
                        Err(e) => warn!("Expiry tick failed, will retry: {e}"),
                    }
                }
                _ = domains.tick() => {
                    let service = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = service.process_config(ListName::RemoteAllowlist).await {
                            warn!("Domain refresh: {e}");
                        }
                    });
                }
            }
        }
    }
}
