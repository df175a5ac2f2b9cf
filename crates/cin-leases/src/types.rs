use std::net::Ipv6Addr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Host identifier kinds Kea accepts for DHCPv6 reservations.
pub const IDENTIFIER_TYPES: [&str; 3] = ["duid", "hw-address", "flex-id"];

/// A DHCPv6 lease as returned by `lease6-get-page`. Fields this service does
/// not interpret are carried through untouched in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease6 {
    #[serde(rename = "ip-address")]
    pub ip_address: Ipv6Addr,
    #[serde(rename = "subnet-id", default)]
    pub subnet_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iaid: Option<u32>,
    #[serde(rename = "hw-address", default, skip_serializing_if = "Option::is_none")]
    pub hw_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(rename = "valid-lft", default, skip_serializing_if = "Option::is_none")]
    pub valid_lft: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cltt: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<u32>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One page of leases for a subnet.
///
/// `next` is the cursor for the following page: the last address Kea
/// returned, whatever subnet it belonged to. `None` once Kea runs out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeasePage {
    pub subnet_id: u32,
    pub leases: Vec<Lease6>,
    pub next: Option<Ipv6Addr>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    #[serde(rename = "subnet-id")]
    pub subnet_id: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duid: Option<String>,
    #[serde(rename = "hw-address", default, skip_serializing_if = "Option::is_none")]
    pub hw_address: Option<String>,
    #[serde(rename = "ip-addresses", default, skip_serializing_if = "Vec::is_empty")]
    pub ip_addresses: Vec<Ipv6Addr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prefixes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Reservation {
    pub fn has_identifier(&self) -> bool {
        self.duid.as_deref().is_some_and(|d| !d.trim().is_empty())
            || self.hw_address.as_deref().is_some_and(|h| !h.trim().is_empty())
            || self.extra.contains_key("flex-id")
    }
}

/// How a reservation is addressed for deletion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationKey {
    Address(Ipv6Addr),
    Identifier { kind: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lease_keeps_unknown_fields() {
        let lease: Lease6 = serde_json::from_value(json!({
            "ip-address": "2001:db8:1::10",
            "subnet-id": 1,
            "duid": "00:01:02",
            "iaid": 7,
            "valid-lft": 7200,
            "cltt": 1700000000,
            "type": "IA_NA",
            "preferred-lft": 3600,
            "fqdn-fwd": false
        }))
        .unwrap();

        assert_eq!(lease.subnet_id, 1);
        assert_eq!(lease.extra["type"], "IA_NA");
        let back = serde_json::to_value(&lease).unwrap();
        assert_eq!(back["preferred-lft"], 3600);
        assert_eq!(back["ip-address"], "2001:db8:1::10");
    }

    #[test]
    fn test_reservation_identifier() {
        let mut host: Reservation = serde_json::from_value(json!({
            "subnet-id": 1,
            "ip-addresses": ["2001:db8:1::100"]
        }))
        .unwrap();
        assert!(!host.has_identifier());

        host.hw_address = Some("aa:bb:cc:dd:ee:ff".into());
        assert!(host.has_identifier());
        assert!(serde_json::to_value(&host).unwrap().get("duid").is_none());
    }
}
