//! nftables backend
//!
//! Implements [`PacketFilter`] by running `nft --json`. Payloads are built
//! as JSON values and fed on stdin, so element values and comments never
//! pass through a shell or the nft text parser.
//!
//! The managed table holds one set per [`SetName`]; allow sets are created
//! with `flags timeout` so ticket elements can carry `timeout`/`expires`.

use crate::core::error::{Error, Result, nftables_hint};
use crate::core::filter::PacketFilter;
use crate::core::policy::{Element, Elements, SetName};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

/// Location of the managed sets in the ruleset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NftTarget {
    /// Table family (`inet`, `bridge`, ...)
    pub family: String,
    pub table: String,
    /// nft binary to run
    pub command: String,
}

impl Default for NftTarget {
    fn default() -> Self {
        Self {
            family: "inet".to_string(),
            table: "sbs".to_string(),
            command: "nft".to_string(),
        }
    }
}

/// [`PacketFilter`] backed by the nft command line tool.
#[derive(Debug, Clone)]
pub struct NftFilter {
    target: NftTarget,
}

impl NftFilter {
    pub fn new(target: NftTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &NftTarget {
        &self.target
    }

    /// Creates the managed table and every set if they do not exist yet.
    ///
    /// `add` is idempotent in nftables, so existing elements are untouched.
    pub async fn ensure_sets(&self) -> Result<()> {
        let payload = ensure_sets_payload(&self.target);
        self.run(&["--json", "-f", "-"], Some(&payload)).await?;
        info!(
            "nftables table {} {} ready",
            self.target.family, self.target.table
        );
        Ok(())
    }

    async fn run(&self, args: &[&str], stdin: Option<&Value>) -> Result<Vec<u8>> {
        let mut cmd = crate::elevation::create_elevated_nft_command(&self.target.command, args)?;
        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            error!("Failed to spawn {}: {e}", self.target.command);
            Error::Nftables {
                message: format!("failed to spawn {}: {e}", self.target.command),
                stderr: None,
                exit_code: None,
            }
        })?;

        if let (Some(payload), Some(mut pipe)) = (stdin, child.stdin.take()) {
            let json_string = serde_json::to_string(payload)?;
            pipe.write_all(json_string.as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;

        if output.status.success() {
            Ok(output.stdout)
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let message = parse_nft_errors(&stderr).join("; ");
            match nftables_hint(&stderr) {
                Some(hint) => error!("nft failed: {message} ({hint})"),
                None => error!("nft failed: {message}"),
            }
            Err(Error::Nftables {
                message,
                stderr: Some(stderr),
                exit_code: output.status.code(),
            })
        }
    }

    fn element_error(set: SetName, value: &str, op: &'static str, err: Error) -> Error {
        match err {
            Error::Nftables { message, .. } => Error::FilterApply {
                set: set.to_string(),
                element: value.to_string(),
                op,
                message,
            },
            other => other,
        }
    }
}

#[async_trait]
impl PacketFilter for NftFilter {
    async fn list_elements(&self, set: SetName) -> Result<Elements> {
        let name = set.to_string();
        let stdout = self
            .run(
                &["--json", "list", "set", &self.target.family, &self.target.table, &name],
                None,
            )
            .await?;

        let listing: Value = serde_json::from_slice(&stdout)?;
        parse_set_listing(&listing, &name)
    }

    async fn add_element(&self, set: SetName, value: &str, element: &Element) -> Result<()> {
        debug!("nft add element {set} {value}");
        let payload = element_payload(&self.target, "add", set, vec![element_json(value, element)]);
        self.run(&["--json", "-f", "-"], Some(&payload))
            .await
            .map(drop)
            .map_err(|e| Self::element_error(set, value, "add", e))
    }

    async fn remove_element(&self, set: SetName, value: &str) -> Result<()> {
        debug!("nft delete element {set} {value}");
        let payload = element_payload(&self.target, "delete", set, vec![Value::from(value)]);
        self.run(&["--json", "-f", "-"], Some(&payload))
            .await
            .map(drop)
            .map_err(|e| Self::element_error(set, value, "delete", e))
    }
}

/// `add table` + `add set` commands for every managed set
pub fn ensure_sets_payload(target: &NftTarget) -> Value {
    let mut commands = vec![json!({
        "add": { "table": { "family": target.family, "name": target.table } }
    })];

    for set in SetName::all() {
        let mut set_def = json!({
            "family": target.family,
            "table": target.table,
            "name": set.to_string(),
            "type": set.family.nft_type(),
        });
        if set.has_timeouts() {
            set_def["flags"] = json!(["timeout"]);
        }
        commands.push(json!({ "add": { "set": set_def } }));
    }

    json!({ "nftables": commands })
}

/// Element in nft JSON form: a bare string when permanent, an `elem`
/// object when it carries metadata.
pub fn element_json(value: &str, element: &Element) -> Value {
    if element.is_permanent() && element.comment.is_none() {
        return Value::from(value);
    }

    let mut elem = serde_json::Map::new();
    elem.insert("val".into(), value.into());
    if let Some(t) = element.timeout {
        elem.insert("timeout".into(), t.into());
    }
    if let Some(e) = element.expires {
        elem.insert("expires".into(), e.into());
    }
    if let Some(c) = &element.comment {
        elem.insert("comment".into(), c.clone().into());
    }
    json!({ "elem": elem })
}

fn element_payload(target: &NftTarget, verb: &str, set: SetName, elems: Vec<Value>) -> Value {
    let element = json!({
        "element": {
            "family": target.family,
            "table": target.table,
            "name": set.to_string(),
            "elem": elems,
        }
    });

    let mut command = serde_json::Map::new();
    command.insert(verb.to_string(), element);
    json!({ "nftables": [command] })
}

/// Extracts the elements of set `name` from `nft --json list set` output.
pub fn parse_set_listing(listing: &Value, name: &str) -> Result<Elements> {
    let items = listing
        .get("nftables")
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Internal("nft listing: missing nftables array".to_string()))?;

    let set = items
        .iter()
        .filter_map(|item| item.get("set"))
        .find(|set| set.get("name").and_then(Value::as_str) == Some(name))
        .ok_or_else(|| Error::Internal(format!("nft listing: set {name} not found")))?;

    let mut elements = Elements::new();
    let Some(elems) = set.get("elem").and_then(Value::as_array) else {
        return Ok(elements);
    };

    for item in elems {
        match item {
            Value::String(val) => {
                elements.insert(val.to_ascii_lowercase(), Element::permanent());
            }
            Value::Object(_) => {
                let Some(inner) = item.get("elem") else {
                    warn!("nft listing: skipping unsupported element {item}");
                    continue;
                };
                let Some(val) = inner.get("val").and_then(Value::as_str) else {
                    warn!("nft listing: skipping element without string value {item}");
                    continue;
                };
                elements.insert(
                    val.to_ascii_lowercase(),
                    Element {
                        timeout: inner.get("timeout").and_then(Value::as_u64),
                        expires: inner.get("expires").and_then(Value::as_u64),
                        comment: inner.get("comment").and_then(Value::as_str).map(String::from),
                    },
                );
            }
            other => warn!("nft listing: skipping unsupported element {other}"),
        }
    }

    Ok(elements)
}

/// Parses nft error output into readable messages.
///
/// Tries the JSON error format first and falls back to cleaning up
/// stderr line by line.
pub fn parse_nft_errors(stderr: &str) -> Vec<String> {
    if let Ok(json_err) = serde_json::from_str::<Value>(stderr)
        && let Some(errors) = json_err.get("errors").and_then(|e| e.as_array())
    {
        return errors
            .iter()
            .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
            .map(String::from)
            .collect();
    }

    stderr
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            line.trim()
                .trim_start_matches("Error: ")
                .trim_start_matches("nft: ")
                .to_string()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::address::Family;
    use crate::core::policy::SetKind;

    const ALLOW_ETHER: SetName = SetName::new(SetKind::Allow, Family::Ether);

    #[test]
    fn test_ensure_sets_payload() {
        let payload = ensure_sets_payload(&NftTarget::default());
        let cmds = payload["nftables"].as_array().unwrap();

        // table + 6 sets
        assert_eq!(cmds.len(), 7);
        assert_eq!(cmds[0]["add"]["table"]["name"], "sbs");
        assert_eq!(cmds[1]["add"]["set"]["name"], "allow_ether");
        assert_eq!(cmds[1]["add"]["set"]["type"], "ether_addr");
        assert_eq!(cmds[1]["add"]["set"]["flags"][0], "timeout");
        assert_eq!(cmds[4]["add"]["set"]["name"], "block_ether");
        assert!(cmds[4]["add"]["set"].get("flags").is_none());
    }

    #[test]
    fn test_element_json_permanent_is_plain_string() {
        assert_eq!(element_json("10.0.0.1", &Element::permanent()), json!("10.0.0.1"));
    }

    #[test]
    fn test_element_json_with_metadata() {
        let element = Element {
            timeout: Some(60),
            expires: Some(42),
            comment: Some("guest".into()),
        };
        let value = element_json("aa:bb:cc:dd:ee:ff", &element);
        assert_eq!(value["elem"]["val"], "aa:bb:cc:dd:ee:ff");
        assert_eq!(value["elem"]["timeout"], 60);
        assert_eq!(value["elem"]["expires"], 42);
        assert_eq!(value["elem"]["comment"], "guest");
    }

    #[test]
    fn test_element_payload_shape() {
        let payload = element_payload(
            &NftTarget::default(),
            "delete",
            ALLOW_ETHER,
            vec![json!("aa:bb:cc:dd:ee:ff")],
        );
        let element = &payload["nftables"][0]["delete"]["element"];
        assert_eq!(element["family"], "inet");
        assert_eq!(element["table"], "sbs");
        assert_eq!(element["name"], "allow_ether");
        assert_eq!(element["elem"][0], "aa:bb:cc:dd:ee:ff");
    }

    #[test]
    fn test_parse_set_listing() {
        let listing = json!({
            "nftables": [
                { "metainfo": { "version": "1.0.9", "json_schema_version": 1 } },
                { "set": {
                    "family": "inet", "name": "allow_ether", "table": "sbs",
                    "type": "ether_addr", "handle": 3, "flags": ["timeout"],
                    "elem": [
                        "AA:BB:CC:DD:EE:01",
                        { "elem": { "val": "aa:bb:cc:dd:ee:02", "timeout": 60, "expires": 17, "comment": "guest" } }
                    ]
                } }
            ]
        });

        let elements = parse_set_listing(&listing, "allow_ether").unwrap();
        assert_eq!(elements.len(), 2);
        assert!(elements["aa:bb:cc:dd:ee:01"].is_permanent());
        let ticketed = &elements["aa:bb:cc:dd:ee:02"];
        assert_eq!(ticketed.timeout, Some(60));
        assert_eq!(ticketed.expires, Some(17));
        assert_eq!(ticketed.comment.as_deref(), Some("guest"));
    }

    #[test]
    fn test_parse_set_listing_empty_set() {
        let listing = json!({
            "nftables": [{ "set": { "name": "block_ipv4", "table": "sbs", "type": "ipv4_addr" } }]
        });
        assert!(parse_set_listing(&listing, "block_ipv4").unwrap().is_empty());
    }

    #[test]
    fn test_parse_set_listing_missing_set() {
        let listing = json!({ "nftables": [] });
        assert!(parse_set_listing(&listing, "allow_ipv4").is_err());
        assert!(parse_set_listing(&json!({}), "allow_ipv4").is_err());
    }

    #[test]
    fn test_parse_nft_errors_plain_text() {
        let stderr = "Error: Could not process rule: No such file or directory\nnft: syntax error\n";
        let errors = parse_nft_errors(stderr);
        assert_eq!(
            errors,
            vec!["Could not process rule: No such file or directory", "syntax error"]
        );
    }

    #[test]
    fn test_parse_nft_errors_json() {
        let stderr = r#"{"errors":[{"message":"element already exists"}]}"#;
        assert_eq!(parse_nft_errors(stderr), vec!["element already exists"]);
    }

    #[test]
    fn test_parse_nft_errors_empty() {
        assert!(parse_nft_errors("").is_empty());
    }
}
