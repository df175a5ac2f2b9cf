use cin_kea::{commands, KeaClient};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

/// CableLabs vendor option space (enterprise 4491).
pub const VENDOR_SPACE: &str = "vendor-4491";

/// The vendor-4491 option definitions subnets rely on: global time-offset,
/// syslog and time servers, and the per-subnet CCAP core list.
pub fn vendor_option_defs() -> Vec<Value> {
    [
        ("time-offset", 38, "uint32"),
        ("syslog-servers", 34, "ipv6-address"),
        ("rfc868-servers", 37, "ipv6-address"),
        ("ccap-core", 61, "ipv6-address"),
    ]
    .into_iter()
    .map(|(name, code, kind)| {
        json!({
            "name": name,
            "code": code,
            "space": VENDOR_SPACE,
            "type": kind,
            "array": true
        })
    })
    .collect()
}

/// Whether a `Dhcp6` config carries any vendor-4491 option definition.
pub fn has_vendor_option_defs(dhcp6: &Value) -> bool {
    dhcp6
        .get("option-def")
        .and_then(Value::as_array)
        .is_some_and(|defs| {
            defs.iter()
                .any(|d| d.get("space").and_then(Value::as_str) == Some(VENDOR_SPACE))
        })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionDefSyncReport {
    pub definitions: usize,
    pub servers: usize,
    pub succeeded: usize,
    pub failures: Vec<String>,
}

impl OptionDefSyncReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Push every vendor definition to every active server, one definition per
/// `option-def6-set`, and report per-server failures.
pub async fn sync_vendor_option_defs(kea: &KeaClient) -> OptionDefSyncReport {
    let defs = vendor_option_defs();
    let mut report = OptionDefSyncReport {
        definitions: defs.len(),
        servers: kea.servers().len(),
        ..Default::default()
    };

    for def in defs {
        let name = def["name"].as_str().unwrap_or_default().to_string();
        let args = json!({
            "option-defs": [def],
            "operation-target": "all",
            "server-tags": ["all"]
        });

        for outcome in kea.broadcast(commands::OPTION_DEF6_SET, args).await {
            match outcome.result {
                Ok(resp) if resp.is_success() => report.succeeded += 1,
                Ok(resp) => report.failures.push(format!(
                    "{}: {name}: {}",
                    outcome.server,
                    resp.text().unwrap_or("unknown error")
                )),
                Err(e) => report.failures.push(format!("{}: {name}: {e}", outcome.server)),
            }
        }
    }

    if report.is_complete() {
        info!(
            definitions = report.definitions,
            servers = report.servers,
            "Vendor option definitions synced"
        );
    } else {
        warn!(failures = report.failures.len(), "Vendor option definition sync incomplete");
    }
    report
}
