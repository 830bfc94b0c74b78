//! Policy compiler
//!
//! Merges the three config lists and the active tickets into the exact
//! contents of every managed nftables set. This is a pure function: the
//! same inputs and `now` always produce the same output, and all
//! collections are ordered so serialized output is byte-identical.
//!
//! # Precedence
//!
//! 1. Blocklisted addresses never appear in an allow set.
//! 2. Allowlisted addresses are allowed permanently (no metadata).
//! 3. Resolved remote-allowlist addresses are allowed permanently.
//! 4. Active tickets are allowed with `timeout`, `expires` and `comment`.
//! 5. Block sets mirror the blocklist.
//!
//! An address already allowed permanently by rule 2 or 3 keeps its
//! permanent element even if it also holds a ticket.

use crate::core::address::{Address, Family};
use crate::core::tickets::Ticket;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use strum::IntoEnumIterator;

/// Purpose of a managed set
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::AsRefStr,
)]
pub enum SetKind {
    #[strum(serialize = "allow")]
    Allow,
    #[strum(serialize = "block")]
    Block,
}

/// Name of one managed nftables set, e.g. `allow_ether`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SetName {
    pub kind: SetKind,
    pub family: Family,
}

impl SetName {
    pub const fn new(kind: SetKind, family: Family) -> Self {
        Self { kind, family }
    }

    /// Every set the daemon manages, in a fixed order.
    pub fn all() -> impl Iterator<Item = SetName> {
        SetKind::iter().flat_map(|kind| Family::iter().map(move |family| SetName::new(kind, family)))
    }

    /// Only allow sets carry ticket timeouts.
    pub const fn has_timeouts(self) -> bool {
        matches!(self.kind, SetKind::Allow)
    }
}

impl fmt::Display for SetName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.kind, self.family)
    }
}

/// Optional metadata attached to a set element.
///
/// `timeout` is the ticket's full duration, `expires` the seconds left at
/// compile time. Permanent elements have no metadata at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Element {
    pub fn permanent() -> Self {
        Self::default()
    }

    pub fn for_ticket(ticket: &Ticket, now: DateTime<Utc>) -> Self {
        Self {
            timeout: Some(ticket.duration_secs),
            expires: Some(ticket.remaining_secs(now)),
            comment: (!ticket.comment.is_empty()).then(|| ticket.comment.clone()),
        }
    }

    pub fn is_permanent(&self) -> bool {
        self.timeout.is_none() && self.expires.is_none()
    }
}

/// Element value (canonical address text) to metadata, sorted by value.
pub type Elements = BTreeMap<String, Element>;

/// Contents of every managed set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompiledSets {
    pub sets: BTreeMap<SetName, Elements>,
}

impl CompiledSets {
    pub fn get(&self, name: SetName) -> Option<&Elements> {
        self.sets.get(&name)
    }

    /// Whether `address` is in the allow set of its family.
    pub fn allows(&self, address: &Address) -> bool {
        self.get(SetName::new(SetKind::Allow, address.family()))
            .is_some_and(|e| e.contains_key(&address.to_string()))
    }

    /// Whether `address` is in the block set of its family.
    pub fn blocks(&self, address: &Address) -> bool {
        self.get(SetName::new(SetKind::Block, address.family()))
            .is_some_and(|e| e.contains_key(&address.to_string()))
    }

    /// Serialized form with deterministic ordering, as reported over RPC.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;

        let sets: Vec<serde_json::Value> = self
            .sets
            .iter()
            .map(|(name, elements)| {
                json!({
                    "name": name.to_string(),
                    "elements": elements_to_json(elements),
                })
            })
            .collect();
        json!({ "sets": sets })
    }
}

/// RPC element list: `[{val, timeout?, expires?, comment?}]`
pub fn elements_to_json(elements: &Elements) -> Vec<serde_json::Value> {
    elements
        .iter()
        .map(|(val, meta)| {
            let mut obj = serde_json::Map::new();
            obj.insert("val".into(), val.clone().into());
            if let Some(t) = meta.timeout {
                obj.insert("timeout".into(), t.into());
            }
            if let Some(e) = meta.expires {
                obj.insert("expires".into(), e.into());
            }
            if let Some(c) = &meta.comment {
                obj.insert("comment".into(), c.clone().into());
            }
            serde_json::Value::Object(obj)
        })
        .collect()
}

/// Everything the compiler needs, already parsed and validated.
#[derive(Debug, Clone, Default)]
pub struct PolicyInputs {
    pub blocklist: BTreeSet<Address>,
    pub allowlist: BTreeSet<Address>,
    /// Addresses resolved from the remote domain allowlist
    pub remote: BTreeSet<Address>,
    pub tickets: Vec<Ticket>,
}

/// Computes the contents of every managed set.
pub fn compile(inputs: &PolicyInputs, now: DateTime<Utc>) -> CompiledSets {
    let mut sets: BTreeMap<SetName, Elements> =
        SetName::all().map(|name| (name, Elements::new())).collect();

    let mut allow = |address: &Address, element: Element| {
        if inputs.blocklist.contains(address) {
            return;
        }
        let name = SetName::new(SetKind::Allow, address.family());
        if let Some(set) = sets.get_mut(&name) {
            set.entry(address.to_string()).or_insert(element);
        }
    };

    for address in &inputs.allowlist {
        allow(address, Element::permanent());
    }
    for address in &inputs.remote {
        allow(address, Element::permanent());
    }

    // Sorted so that duplicate addresses resolve the same way every time.
    let mut tickets: Vec<&Ticket> = inputs.tickets.iter().filter(|t| !t.is_expired(now)).collect();
    tickets.sort_by(|a, b| a.address.cmp(&b.address).then(b.expires_at.cmp(&a.expires_at)));
    for ticket in tickets {
        allow(&ticket.address, Element::for_ticket(ticket, now));
    }

    for address in &inputs.blocklist {
        let name = SetName::new(SetKind::Block, address.family());
        if let Some(set) = sets.get_mut(&name) {
            set.insert(address.to_string(), Element::permanent());
        }
    }

    CompiledSets { sets }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use crate::core::address::MacAddr;
    use crate::core::test_helpers::t0;
    use proptest::prelude::*;
    use std::net::Ipv4Addr;

    fn arb_address() -> impl Strategy<Value = Address> {
        prop_oneof![
            // Small ranges so the lists overlap often
            (0u8..8).prop_map(|n| Address::Ether(MacAddr([0xaa, 0, 0, 0, 0, n]))),
            (0u8..8).prop_map(|n| Address::Ipv4(Ipv4Addr::new(10, 0, 0, n))),
        ]
    }

    prop_compose! {
        fn arb_ticket()(address in arb_address(), secs in 1u64..7200) -> Ticket {
            Ticket::new(address, secs, "t".to_string(), t0())
        }
    }

    prop_compose! {
        fn arb_inputs()(
            blocklist in proptest::collection::btree_set(arb_address(), 0..6),
            allowlist in proptest::collection::btree_set(arb_address(), 0..6),
            remote in proptest::collection::btree_set(arb_address(), 0..6),
            tickets in proptest::collection::vec(arb_ticket(), 0..8),
        ) -> PolicyInputs {
            PolicyInputs { blocklist, allowlist, remote, tickets }
        }
    }

    proptest! {
        #[test]
        fn test_compile_is_deterministic(inputs in arb_inputs(), offset in 0i64..7200) {
            let now = t0() + chrono::Duration::seconds(offset);
            let first = compile(&inputs, now);
            let second = compile(&inputs, now);
            prop_assert_eq!(
                serde_json::to_string(&first.to_json()).unwrap(),
                serde_json::to_string(&second.to_json()).unwrap()
            );
        }

        #[test]
        fn test_blocked_never_allowed(inputs in arb_inputs()) {
            let compiled = compile(&inputs, t0());
            for blocked in &inputs.blocklist {
                prop_assert!(!compiled.allows(blocked));
                prop_assert!(compiled.blocks(blocked));
            }
        }

        #[test]
        fn test_ticket_order_does_not_matter(inputs in arb_inputs()) {
            let mut reversed = inputs.clone();
            reversed.tickets.reverse();
            prop_assert_eq!(compile(&inputs, t0()), compile(&reversed, t0()));
        }
    }
}
