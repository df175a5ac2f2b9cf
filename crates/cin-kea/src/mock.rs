//! In-process stand-in for a Kea Control Agent with the dhcp6 config backend.
//!
//! Serves the command API on `127.0.0.1:<random>` over real HTTP so the whole
//! client path is exercised. State is inspectable and individual commands can
//! be forced to fail.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv6Addr;
use std::sync::{Arc, Mutex, MutexGuard};

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use cin_common::{KeaConfig, KeaServerConfig};
use serde_json::{json, Value};

use crate::protocol::commands;

#[derive(Debug, Default)]
struct MockState {
    subnets: BTreeMap<u64, Value>,
    leases: Vec<Value>,
    reservations: Vec<Value>,
    option_defs: Vec<Value>,
    log: Vec<(String, Value)>,
    failures: HashMap<String, (i64, String)>,
}

#[derive(Debug, Clone)]
pub struct MockKea {
    pub url: String,
    state: Arc<Mutex<MockState>>,
}

impl MockKea {
    pub async fn start() -> std::io::Result<Self> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}", listener.local_addr()?);
        let state = Arc::new(Mutex::new(MockState::default()));

        let app = Router::new()
            .route("/", post(handle))
            .with_state(state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { url, state })
    }

    pub fn server_config(&self, name: &str, priority: u32) -> KeaServerConfig {
        KeaServerConfig {
            name: name.to_string(),
            url: self.url.clone(),
            priority,
            active: true,
        }
    }

    pub fn kea_config(&self) -> KeaConfig {
        KeaConfig::single(self.url.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed a subnet directly, as if another tool had written it.
    pub fn insert_subnet(&self, subnet: Value) {
        if let Some(id) = subnet.get("id").and_then(Value::as_u64) {
            self.lock().subnets.insert(id, subnet);
        }
    }

    pub fn subnet(&self, id: u64) -> Option<Value> {
        self.lock().subnets.get(&id).cloned()
    }

    pub fn subnet_ids(&self) -> Vec<u64> {
        self.lock().subnets.keys().copied().collect()
    }

    pub fn add_lease(&self, lease: Value) {
        self.lock().leases.push(lease);
    }

    pub fn lease_count(&self) -> usize {
        self.lock().leases.len()
    }

    pub fn reservations(&self) -> Vec<Value> {
        self.lock().reservations.clone()
    }

    pub fn option_defs(&self) -> Vec<Value> {
        self.lock().option_defs.clone()
    }

    /// Answer `command` with `result`/`text` until [`MockKea::clear_failure`].
    pub fn fail_command(&self, command: &str, result: i64, text: &str) {
        self.lock()
            .failures
            .insert(command.to_string(), (result, text.to_string()));
    }

    pub fn clear_failure(&self, command: &str) {
        self.lock().failures.remove(command);
    }

    /// Names of all received commands, oldest first.
    pub fn commands(&self) -> Vec<String> {
        self.lock().log.iter().map(|(c, _)| c.clone()).collect()
    }

    pub fn count(&self, command: &str) -> usize {
        self.lock().log.iter().filter(|(c, _)| c == command).count()
    }

    pub fn last_arguments(&self, command: &str) -> Option<Value> {
        self.lock()
            .log
            .iter()
            .rev()
            .find(|(c, _)| c == command)
            .map(|(_, args)| args.clone())
    }
}

fn answer(result: i64, text: &str, arguments: Option<Value>) -> Json<Value> {
    let mut item = json!({ "result": result, "text": text });
    if let Some(arguments) = arguments {
        item["arguments"] = arguments;
    }
    Json(json!([item]))
}

fn first_subnet_id(args: &Value) -> Option<u64> {
    args.pointer("/subnets/0/id").and_then(Value::as_u64)
}

fn lease_addr(lease: &Value) -> Option<Ipv6Addr> {
    lease.get("ip-address")?.as_str()?.parse().ok()
}

async fn handle(State(state): State<Arc<Mutex<MockState>>>, Json(body): Json<Value>) -> Json<Value> {
    let command = body
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let args = body.get("arguments").cloned().unwrap_or(Value::Null);

    let mut st = state.lock().unwrap_or_else(|e| e.into_inner());
    st.log.push((command.clone(), args.clone()));

    if let Some((result, text)) = st.failures.get(&command) {
        return answer(*result, text, None);
    }

    match command.as_str() {
        commands::CONFIG_GET => {
            let subnets: Vec<Value> = st.subnets.values().cloned().collect();
            answer(
                0,
                "",
                Some(json!({ "Dhcp6": { "subnet6": subnets, "option-def": st.option_defs } })),
            )
        }
        commands::CONFIG_RELOAD => answer(0, "Configuration successful.", None),
        commands::CONFIG_WRITE => {
            let filename = args
                .get("filename")
                .and_then(Value::as_str)
                .unwrap_or("kea-dhcp6.conf")
                .to_string();
            answer(
                0,
                "Configuration written.",
                Some(json!({ "filename": filename, "size": 1024 })),
            )
        }

        commands::REMOTE_SUBNET6_SET => {
            let Some(list) = args.get("subnets").and_then(Value::as_array) else {
                return answer(1, "missing 'subnets' argument", None);
            };
            let mut set = Vec::new();
            for subnet in list {
                let Some(id) = subnet.get("id").and_then(Value::as_u64) else {
                    return answer(1, "subnet without id", None);
                };
                set.push(json!({ "id": id, "subnet": subnet.get("subnet") }));
                st.subnets.insert(id, subnet.clone());
            }
            answer(0, "IPv6 subnet successfully set.", Some(json!({ "subnets": set })))
        }
        commands::REMOTE_SUBNET6_DEL_BY_ID => {
            let removed = first_subnet_id(&args).and_then(|id| st.subnets.remove(&id));
            match removed {
                Some(_) => answer(0, "1 IPv6 subnet(s) deleted.", Some(json!({ "count": 1 }))),
                None => answer(3, "0 IPv6 subnet(s) deleted.", Some(json!({ "count": 0 }))),
            }
        }
        commands::REMOTE_SUBNET6_LIST => {
            let summaries: Vec<Value> = st
                .subnets
                .values()
                .map(|s| {
                    json!({
                        "id": s.get("id"),
                        "subnet": s.get("subnet"),
                        "shared-network-name": null,
                        "metadata": { "server-tags": ["all"] }
                    })
                })
                .collect();
            let count = summaries.len();
            let text = format!("{count} IPv6 subnet(s) found.");
            let code = if count == 0 { 3 } else { 0 };
            answer(code, &text, Some(json!({ "count": count, "subnets": summaries })))
        }
        commands::REMOTE_SUBNET6_GET_BY_ID => {
            match first_subnet_id(&args).and_then(|id| st.subnets.get(&id)) {
                Some(subnet) => answer(
                    0,
                    "IPv6 subnet found.",
                    Some(json!({ "count": 1, "subnets": [subnet] })),
                ),
                None => answer(3, "IPv6 subnet not found.", Some(json!({ "count": 0, "subnets": [] }))),
            }
        }

        commands::LEASE6_GET_PAGE => {
            let from = match args.get("from").and_then(Value::as_str) {
                None | Some("start") => None,
                Some(ip) => ip.parse::<Ipv6Addr>().ok(),
            };
            let limit = args.get("limit").and_then(Value::as_u64).unwrap_or(100) as usize;

            let mut leases: Vec<(Ipv6Addr, Value)> = st
                .leases
                .iter()
                .filter_map(|l| lease_addr(l).map(|a| (a, l.clone())))
                .filter(|(a, _)| from.is_none_or(|f| *a > f))
                .collect();
            leases.sort_by_key(|(a, _)| *a);
            let page: Vec<Value> = leases.into_iter().take(limit).map(|(_, l)| l).collect();

            if page.is_empty() {
                answer(3, "0 IPv6 lease(s) found.", Some(json!({ "count": 0, "leases": [] })))
            } else {
                let text = format!("{} IPv6 lease(s) found.", page.len());
                answer(0, &text, Some(json!({ "count": page.len(), "leases": page })))
            }
        }
        commands::LEASE6_DEL => {
            let target = args
                .get("ip-address")
                .and_then(Value::as_str)
                .and_then(|s| s.parse::<Ipv6Addr>().ok());
            let before = st.leases.len();
            st.leases.retain(|l| target.is_none() || lease_addr(l) != target);
            if target.is_some() && st.leases.len() < before {
                answer(0, "IPv6 lease deleted.", None)
            } else {
                answer(3, "IPv6 lease not found.", None)
            }
        }

        commands::RESERVATION_ADD => {
            let Some(host) = args.get("reservation").cloned() else {
                return answer(1, "missing 'reservation' argument", None);
            };
            if st.reservations.iter().any(|h| same_host(h, &host)) {
                return answer(1, "Host already exists.", None);
            }
            st.reservations.push(host);
            answer(0, "Host added.", None)
        }
        commands::RESERVATION_UPDATE => {
            let Some(host) = args.get("reservation").cloned() else {
                return answer(1, "missing 'reservation' argument", None);
            };
            match st.reservations.iter_mut().find(|h| same_host(h, &host)) {
                Some(existing) => {
                    *existing = host;
                    answer(0, "Host updated.", None)
                }
                None => answer(1, "Host not updated (not found).", None),
            }
        }
        commands::RESERVATION_DEL => {
            let before = st.reservations.len();
            st.reservations.retain(|h| !reservation_matches(h, &args));
            if st.reservations.len() < before {
                answer(0, "Host deleted.", None)
            } else {
                answer(3, "Host not deleted (not found).", None)
            }
        }
        commands::RESERVATION_GET_ALL => {
            let subnet_id = args.get("subnet-id").and_then(Value::as_u64);
            let hosts: Vec<Value> = st
                .reservations
                .iter()
                .filter(|h| h.get("subnet-id").and_then(Value::as_u64) == subnet_id)
                .cloned()
                .collect();
            let text = format!("{} IPv6 host(s) found.", hosts.len());
            let code = if hosts.is_empty() { 3 } else { 0 };
            answer(code, &text, Some(json!({ "hosts": hosts })))
        }

        commands::OPTION_DEF6_SET => {
            if let Some(defs) = args.get("option-defs").and_then(Value::as_array) {
                for def in defs {
                    st.option_defs.retain(|d| d.get("code") != def.get("code") || d.get("space") != def.get("space"));
                    st.option_defs.push(def.clone());
                }
            }
            answer(0, "DHCPv6 option definition successfully set.", None)
        }

        other => answer(2, &format!("'{other}' command not supported."), None),
    }
}

fn same_host(a: &Value, b: &Value) -> bool {
    a.get("subnet-id") == b.get("subnet-id")
        && (a.get("duid").is_some() && a.get("duid") == b.get("duid")
            || a.get("hw-address").is_some() && a.get("hw-address") == b.get("hw-address"))
}

fn reservation_matches(host: &Value, args: &Value) -> bool {
    if host.get("subnet-id") != args.get("subnet-id") {
        return false;
    }
    if let Some(ip) = args.get("ip-address") {
        return host
            .get("ip-addresses")
            .and_then(Value::as_array)
            .is_some_and(|ips| ips.contains(ip));
    }
    match (
        args.get("identifier-type").and_then(Value::as_str),
        args.get("identifier"),
    ) {
        (Some(kind), Some(id)) => host.get(kind) == Some(id),
        _ => false,
    }
}
