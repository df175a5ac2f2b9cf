//! Request-body checks for subnet forms. Every problem is collected so the
//! caller gets the full list in one 400 response.

use std::net::Ipv6Addr;

use cin_ipv6::{validate_prefix, PoolRange};
use cin_registry::{Lifetimes, SubnetRequest};
use serde::Deserialize;
use serde_json::Value;

/// Subnet create/update body as posted by the UI. Numeric fields accept
/// numbers or numeric strings.
#[derive(Debug, Default, Deserialize)]
pub struct SubnetForm {
    pub subnet_id: Option<Value>,
    pub subnet: Option<String>,
    pub pool_start: Option<String>,
    pub pool_end: Option<String>,
    pub relay_address: Option<String>,
    pub bvi_interface_id: Option<Value>,
    pub ccap_core_address: Option<String>,
    pub valid_lifetime: Option<Value>,
    pub preferred_lifetime: Option<Value>,
    pub renew_timer: Option<Value>,
    pub rebind_timer: Option<Value>,
}

impl SubnetForm {
    pub fn validate(&self) -> Result<SubnetRequest, Vec<String>> {
        let mut errors = Vec::new();

        let subnet = required_str(&self.subnet, "subnet", &mut errors);
        let relay = required_str(&self.relay_address, "relay_address", &mut errors);
        let bvi_id = match &self.bvi_interface_id {
            None | Some(Value::Null) => {
                errors.push("Field 'bvi_interface_id' is required".into());
                None
            }
            Some(v) => match as_integer(v) {
                Some(id) if id > 0 => Some(id),
                _ => {
                    errors.push("BVI interface ID must be numeric".into());
                    None
                }
            },
        };

        if let Some(subnet) = subnet {
            if let Err(e) = validate_prefix(subnet) {
                errors.push(e.to_string());
            }
        }
        let relay_address = relay.and_then(|r| address("relay_address", r, &mut errors));

        let pool_start = optional_str(&self.pool_start);
        let pool_end = optional_str(&self.pool_end);
        let pool = match (pool_start, pool_end) {
            (None, None) => None,
            (Some(start), Some(end)) => {
                let start = address("pool_start", start, &mut errors);
                let end = address("pool_end", end, &mut errors);
                start.zip(end).map(|(start, end)| PoolRange { start, end })
            }
            _ => {
                errors.push("Fields 'pool_start' and 'pool_end' must be given together".into());
                None
            }
        };

        let ccap_core = optional_str(&self.ccap_core_address).map(|list| {
            let addrs: Vec<&str> = list.split(',').map(str::trim).collect();
            for a in &addrs {
                if a.parse::<Ipv6Addr>().is_err() {
                    errors.push(format!("Invalid IPv6 address format in ccap_core_address: {a}"));
                }
            }
            addrs.join(",")
        });

        let defaults = Lifetimes::default();
        let lifetimes = Lifetimes {
            valid_lifetime: seconds(&self.valid_lifetime, "valid_lifetime", defaults.valid_lifetime, &mut errors),
            preferred_lifetime: seconds(
                &self.preferred_lifetime,
                "preferred_lifetime",
                defaults.preferred_lifetime,
                &mut errors,
            ),
            renew_timer: seconds(&self.renew_timer, "renew_timer", defaults.renew_timer, &mut errors),
            rebind_timer: seconds(&self.rebind_timer, "rebind_timer", defaults.rebind_timer, &mut errors),
        };

        match (subnet, relay_address, bvi_id) {
            (Some(subnet), Some(relay_address), Some(bvi_interface_id)) if errors.is_empty() => {
                Ok(SubnetRequest {
                    subnet: subnet.to_string(),
                    bvi_interface_id,
                    relay_address,
                    pool,
                    ccap_core,
                    lifetimes,
                })
            }
            _ => Err(errors),
        }
    }

    /// `subnet_id` of an update body.
    pub fn subnet_id(&self) -> Result<u32, String> {
        match &self.subnet_id {
            None | Some(Value::Null) => Err("Field 'subnet_id' is required".into()),
            Some(v) => as_integer(v)
                .and_then(|id| u32::try_from(id).ok())
                .filter(|id| *id > 0)
                .ok_or_else(|| "Subnet ID must be a positive integer".into()),
        }
    }
}

/// Number or numeric string.
pub fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn optional_str(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

fn required_str<'a>(value: &'a Option<String>, field: &str, errors: &mut Vec<String>) -> Option<&'a str> {
    let found = optional_str(value);
    if found.is_none() {
        errors.push(format!("Field '{field}' is required"));
    }
    found
}

fn address(field: &str, value: &str, errors: &mut Vec<String>) -> Option<Ipv6Addr> {
    match value.parse() {
        Ok(addr) => Some(addr),
        Err(_) => {
            errors.push(format!("Invalid IPv6 address format for {field}"));
            None
        }
    }
}

fn seconds(value: &Option<Value>, field: &str, default: u32, errors: &mut Vec<String>) -> u32 {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::String(s)) if s.trim().is_empty() => default,
        Some(v) => match as_integer(v).and_then(|n| u32::try_from(n).ok()) {
            Some(n) if n > 0 => n,
            _ => {
                errors.push(format!("Field '{field}' must be a positive integer"));
                default
            }
        },
    }
}
