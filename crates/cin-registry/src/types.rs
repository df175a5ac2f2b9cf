use std::net::Ipv6Addr;

use chrono::{DateTime, Utc};
use cin_ipv6::PoolRange;
use serde::{Deserialize, Serialize};

use crate::option_defs::VENDOR_SPACE;

/// Option code of the CCAP core list in the CableLabs vendor space.
pub const CCAP_CORE_CODE: u16 = 61;
pub const CCAP_CORE_NAME: &str = "ccap-core";

/// Interface numbers are stored zero-based and displayed from BVI100.
pub const BVI_DISPLAY_OFFSET: u32 = 100;

// ── Local registry ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Switch {
    pub id: i64,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BviInterface {
    pub id: i64,
    pub switch_id: i64,
    pub interface_number: u32,
    pub ipv6_address: Ipv6Addr,
    pub created_at: DateTime<Utc>,
}

impl BviInterface {
    pub fn display_name(&self) -> String {
        bvi_display_name(self.interface_number)
    }
}

pub fn bvi_display_name(interface_number: u32) -> String {
    format!("BVI{}", BVI_DISPLAY_OFFSET + interface_number)
}

/// One `cin_bvi_dhcp_core` row. Its key is the BVI interface id, so a BVI
/// carries at most one subnet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubnetMapping {
    pub bvi_interface_id: i64,
    pub switch_id: i64,
    pub kea_subnet_id: u32,
    pub interface_number: u32,
    pub ipv6_address: Ipv6Addr,
    pub pool: Option<PoolRange>,
    pub ccap_core: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SubnetMapping {
    pub fn for_bvi(
        bvi: &BviInterface,
        kea_subnet_id: u32,
        pool: Option<PoolRange>,
        ccap_core: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            bvi_interface_id: bvi.id,
            switch_id: bvi.switch_id,
            kea_subnet_id,
            interface_number: bvi.interface_number,
            ipv6_address: bvi.ipv6_address,
            pool,
            ccap_core,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Snapshot of one server's running config taken before a subnet change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigBackup {
    pub id: i64,
    pub server: String,
    pub operation: String,
    pub config: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Requests ────────────────────────────────────────────────────

/// valid/preferred lifetimes and renew/rebind timers, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifetimes {
    pub valid_lifetime: u32,
    pub preferred_lifetime: u32,
    pub renew_timer: u32,
    pub rebind_timer: u32,
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            valid_lifetime: 7200,
            preferred_lifetime: 3600,
            renew_timer: 1000,
            rebind_timer: 2000,
        }
    }
}

/// A validated subnet create/update request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetRequest {
    /// CIDR prefix, e.g. `2001:db8:1::/64`.
    pub subnet: String,
    pub bvi_interface_id: i64,
    pub relay_address: Ipv6Addr,
    /// Explicit pool; derived from the prefix when `None`.
    pub pool: Option<PoolRange>,
    /// Comma-separated CCAP core addresses, sent as vendor option 61.
    pub ccap_core: Option<String>,
    pub lifetimes: Lifetimes,
}

// ── Kea subnet6 objects ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeaPool {
    pub pool: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeaRelay {
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeaOptionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space: Option<String>,
    #[serde(rename = "csv-format", default, skip_serializing_if = "Option::is_none")]
    pub csv_format: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(rename = "always-send", default, skip_serializing_if = "Option::is_none")]
    pub always_send: Option<bool>,
}

impl KeaOptionData {
    pub fn ccap_core(addresses: &str) -> Self {
        Self {
            name: Some(CCAP_CORE_NAME.into()),
            code: Some(CCAP_CORE_CODE),
            space: Some(VENDOR_SPACE.into()),
            csv_format: Some(true),
            data: Some(addresses.into()),
            always_send: Some(true),
        }
    }

    fn is_ccap_core(&self) -> bool {
        self.name.as_deref() == Some(CCAP_CORE_NAME)
            || (self.code == Some(CCAP_CORE_CODE) && self.space.as_deref() == Some(VENDOR_SPACE))
    }
}

/// A `subnet6` entry as Kea returns or accepts it. `remote-subnet6-list`
/// only fills `id` and `subnet`; the other fields come with full fetches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeaSubnet {
    pub id: u32,
    pub subnet: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pools: Vec<KeaPool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay: Option<KeaRelay>,
    #[serde(rename = "option-data", default, skip_serializing_if = "Vec::is_empty")]
    pub option_data: Vec<KeaOptionData>,
    #[serde(rename = "valid-lifetime", default, skip_serializing_if = "Option::is_none")]
    pub valid_lifetime: Option<u32>,
    #[serde(rename = "preferred-lifetime", default, skip_serializing_if = "Option::is_none")]
    pub preferred_lifetime: Option<u32>,
    #[serde(rename = "renew-timer", default, skip_serializing_if = "Option::is_none")]
    pub renew_timer: Option<u32>,
    #[serde(rename = "rebind-timer", default, skip_serializing_if = "Option::is_none")]
    pub rebind_timer: Option<u32>,
}

impl KeaSubnet {
    pub fn new(
        id: u32,
        subnet: &str,
        pool: PoolRange,
        relay: Ipv6Addr,
        ccap_core: Option<&str>,
        lifetimes: Lifetimes,
    ) -> Self {
        Self {
            id,
            subnet: subnet.trim().to_string(),
            pools: vec![KeaPool {
                pool: pool.to_kea_pool(),
            }],
            relay: Some(KeaRelay {
                ip_addresses: vec![relay.to_string()],
            }),
            option_data: ccap_core.map(KeaOptionData::ccap_core).into_iter().collect(),
            valid_lifetime: Some(lifetimes.valid_lifetime),
            preferred_lifetime: Some(lifetimes.preferred_lifetime),
            renew_timer: Some(lifetimes.renew_timer),
            rebind_timer: Some(lifetimes.rebind_timer),
        }
    }

    /// First pool, if Kea sent one in `"start - end"` form.
    pub fn pool_range(&self) -> Option<PoolRange> {
        self.pools
            .first()
            .and_then(|p| PoolRange::parse_kea_pool(&p.pool).ok())
    }

    pub fn ccap_core(&self) -> Option<&str> {
        self.option_data
            .iter()
            .find(|o| o.is_ccap_core())
            .and_then(|o| o.data.as_deref())
    }

    pub fn relay_address(&self) -> Option<&str> {
        self.relay
            .as_ref()
            .and_then(|r| r.ip_addresses.first())
            .map(String::as_str)
    }

    /// Lifetimes Kea reported, with the usual defaults for missing values.
    pub fn lifetimes(&self) -> Lifetimes {
        let d = Lifetimes::default();
        Lifetimes {
            valid_lifetime: self.valid_lifetime.unwrap_or(d.valid_lifetime),
            preferred_lifetime: self.preferred_lifetime.unwrap_or(d.preferred_lifetime),
            renew_timer: self.renew_timer.unwrap_or(d.renew_timer),
            rebind_timer: self.rebind_timer.unwrap_or(d.rebind_timer),
        }
    }
}

// ── Results ─────────────────────────────────────────────────────

/// Kea subnet left-joined with its mapping row and switch. Mapping fields
/// are `None` for orphans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedSubnet {
    pub id: u32,
    pub subnet: String,
    pub pool: Option<PoolRange>,
    pub relay_address: Option<String>,
    pub ccap_core: Option<String>,
    pub bvi_interface_id: Option<i64>,
    pub interface_number: Option<u32>,
    pub bvi_name: Option<String>,
    pub ipv6_address: Option<Ipv6Addr>,
    pub switch_id: Option<i64>,
    pub switch_hostname: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub lifetimes: Lifetimes,
}

impl EnrichedSubnet {
    pub fn is_orphan(&self) -> bool {
        self.bvi_interface_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOutcome {
    pub subnet_id: u32,
    /// Kea reported an actual deletion (`count > 0`).
    pub removed_from_kea: bool,
    pub mapping_removed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmappedSubnet {
    pub id: u32,
    pub subnet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrphanReport {
    /// In Kea, no mapping row.
    pub unmapped_subnets: Vec<UnmappedSubnet>,
    /// Mapping rows pointing at a subnet id Kea no longer has.
    pub stale_mappings: Vec<SubnetMapping>,
}

impl OrphanReport {
    pub fn is_clean(&self) -> bool {
        self.unmapped_subnets.is_empty() && self.stale_mappings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSubnetState {
    pub server: String,
    pub subnet_count: Option<usize>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigSyncStatus {
    pub in_sync: bool,
    pub server_count: usize,
    pub message: String,
    pub servers: Vec<ServerSubnetState>,
    pub differences: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_bvi_display_name() {
        assert_eq!(bvi_display_name(0), "BVI100");
        assert_eq!(bvi_display_name(7), "BVI107");
    }

    #[test]
    fn test_kea_subnet_wire_shape() {
        let pool = cin_ipv6::pool_for_prefix("2001:db8:1::/64").unwrap();
        let subnet = KeaSubnet::new(
            5,
            "2001:db8:1::/64",
            pool,
            "2001:db8:1::1".parse().unwrap(),
            Some("2001:db8:9::1"),
            Lifetimes::default(),
        );

        assert_eq!(
            serde_json::to_value(&subnet).unwrap(),
            json!({
                "id": 5,
                "subnet": "2001:db8:1::/64",
                "pools": [{"pool": "2001:db8:1::2 - 2001:db8:1::fffe"}],
                "relay": {"ip-addresses": ["2001:db8:1::1"]},
                "option-data": [{
                    "name": "ccap-core",
                    "code": 61,
                    "space": "vendor-4491",
                    "csv-format": true,
                    "data": "2001:db8:9::1",
                    "always-send": true
                }],
                "valid-lifetime": 7200,
                "preferred-lifetime": 3600,
                "renew-timer": 1000,
                "rebind-timer": 2000
            })
        );
    }

    #[test]
    fn test_no_ccap_means_no_option_data() {
        let pool = cin_ipv6::pool_for_prefix("2001:db8:1::/64").unwrap();
        let subnet = KeaSubnet::new(
            1,
            "2001:db8:1::/64",
            pool,
            "2001:db8:1::1".parse().unwrap(),
            None,
            Lifetimes::default(),
        );
        let wire = serde_json::to_value(&subnet).unwrap();
        assert!(wire.get("option-data").is_none());
    }

    #[test]
    fn test_list_summary_parses_with_defaults() {
        let subnet: KeaSubnet = serde_json::from_value(json!({
            "id": 9,
            "subnet": "2001:db8:9::/64",
            "shared-network-name": null,
            "metadata": {"server-tags": ["all"]}
        }))
        .unwrap();
        assert_eq!(subnet.pool_range(), None);
        assert_eq!(subnet.ccap_core(), None);
        assert_eq!(subnet.lifetimes(), Lifetimes::default());
    }

    #[test]
    fn test_ccap_core_found_by_code_and_space() {
        let subnet: KeaSubnet = serde_json::from_value(json!({
            "id": 2,
            "subnet": "2001:db8:2::/64",
            "pools": [{"pool": "2001:db8:2::2-2001:db8:2::fffe"}],
            "option-data": [
                {"code": 23, "space": "dhcp6", "data": "2001:db8::53"},
                {"code": 61, "space": "vendor-4491", "data": "2001:db8:9::1, 2001:db8:9::2"}
            ],
            "valid-lifetime": 600
        }))
        .unwrap();
        assert_eq!(subnet.ccap_core(), Some("2001:db8:9::1, 2001:db8:9::2"));
        assert_eq!(subnet.pool_range().unwrap().end, "2001:db8:2::fffe".parse::<Ipv6Addr>().unwrap());
        assert_eq!(subnet.lifetimes().valid_lifetime, 600);
        assert_eq!(subnet.lifetimes().renew_timer, 1000);
    }
}
