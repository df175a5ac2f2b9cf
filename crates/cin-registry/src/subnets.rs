use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use cin_ipv6::{parse_prefix, pool_for_prefix, prefixes_overlap, PoolError, PoolRange};
use cin_kea::{commands, KeaClient, KeaError, KeaResponse};
use ipnet::Ipv6Net;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::RegistryError;
use crate::option_defs::has_vendor_option_defs;
use crate::store::MappingStore;
use crate::types::{
    bvi_display_name, BviInterface, ConfigSyncStatus, DeleteOutcome, EnrichedSubnet, KeaSubnet,
    OrphanReport, ServerSubnetState, SubnetMapping, SubnetRequest, UnmappedSubnet,
};

/// Lowest id not in `ids`, starting at 1: gaps are filled before `max + 1`.
pub fn next_free_id(ids: impl IntoIterator<Item = u32>) -> u32 {
    let ids: BTreeSet<u32> = ids.into_iter().filter(|id| *id > 0).collect();
    let mut candidate = 1;
    for id in ids {
        if id > candidate {
            break;
        }
        candidate = id + 1;
    }
    candidate
}

/// Orchestrates subnet changes across Kea and the mapping store.
///
/// Every mutation runs Kea first and the local table second, then asks Kea
/// to persist/reload its config. The two stores are not transactional.
pub struct SubnetRegistry {
    kea: KeaClient,
    store: MappingStore,
    config_file: Option<String>,
    /// Serialises id allocation within this process.
    allocation: Mutex<()>,
}

impl SubnetRegistry {
    pub fn new(kea: KeaClient, store: MappingStore, config_file: Option<String>) -> Self {
        Self {
            kea,
            store,
            config_file,
            allocation: Mutex::new(()),
        }
    }

    pub fn kea(&self) -> &KeaClient {
        &self.kea
    }

    pub fn store(&self) -> &MappingStore {
        &self.store
    }

    // ── Kea reads ───────────────────────────────────────────────

    /// `Dhcp6` section of the running config.
    async fn fetch_dhcp6(&self) -> Result<Value, RegistryError> {
        let args = self
            .kea
            .send(commands::CONFIG_GET, Value::Null)
            .await?
            .require(commands::CONFIG_GET)?
            .ok_or_else(|| RegistryError::UnexpectedKeaData("config-get returned no config".into()))?;

        args.get("Dhcp6")
            .cloned()
            .ok_or_else(|| RegistryError::UnexpectedKeaData("config-get without Dhcp6 section".into()))
    }

    pub async fn next_available_subnet_id(&self) -> Result<u32, RegistryError> {
        let dhcp6 = self.fetch_dhcp6().await?;
        let id = next_free_id(subnets_in(&dhcp6).iter().map(|s| s.id));
        debug!(subnet_id = id, "Next available subnet id");
        Ok(id)
    }

    /// All subnets from the config backend. An empty result is an empty list.
    pub async fn list_kea_subnets(&self) -> Result<Vec<KeaSubnet>, RegistryError> {
        let args = self.kea.with_remote(json!({}));
        let resp = self.kea.send(commands::REMOTE_SUBNET6_LIST, args).await?;

        match resp.require(commands::REMOTE_SUBNET6_LIST)? {
            None => Ok(Vec::new()),
            Some(args) => parse_subnet_list(&args),
        }
    }

    pub async fn get_subnet(&self, subnet_id: u32) -> Result<KeaSubnet, RegistryError> {
        self.find_subnet(subnet_id)
            .await?
            .ok_or(RegistryError::SubnetNotFound(subnet_id))
    }

    async fn find_subnet(&self, subnet_id: u32) -> Result<Option<KeaSubnet>, RegistryError> {
        let args = self
            .kea
            .with_remote(json!({ "subnets": [{ "id": subnet_id }] }));
        let resp = self.kea.send(commands::REMOTE_SUBNET6_GET_BY_ID, args).await?;

        match resp.require(commands::REMOTE_SUBNET6_GET_BY_ID)? {
            None => Ok(None),
            Some(args) => Ok(parse_subnet_list(&args)?.into_iter().next()),
        }
    }

    // ── Mutations ───────────────────────────────────────────────

    /// Allocate an id, write the subnet to Kea, then record the BVI mapping.
    pub async fn create_subnet(&self, req: &SubnetRequest) -> Result<SubnetMapping, RegistryError> {
        let prefix = parse_prefix(&req.subnet)?;
        let pool = resolve_pool(req, &prefix)?;
        let bvi = self.require_bvi(req.bvi_interface_id)?;

        let _allocation = self.allocation.lock().await;
        self.require_free_bvi(&bvi, None)?;

        let dhcp6 = self.fetch_dhcp6().await?;
        let existing = subnets_in(&dhcp6);
        check_overlap(&req.subnet, &prefix, &existing, None)?;
        if req.ccap_core.is_some() && !has_vendor_option_defs(&dhcp6) {
            return Err(RegistryError::VendorOptionsMissing);
        }

        self.backup_kea_config("subnet-create").await;
        let subnet_id = next_free_id(existing.iter().map(|s| s.id));
        self.create_with_id(subnet_id, req, &bvi, pool).await
    }

    /// Second half of create once an id is chosen. Refuses ids Kea already
    /// has instead of overwriting them.
    pub(crate) async fn create_with_id(
        &self,
        subnet_id: u32,
        req: &SubnetRequest,
        bvi: &BviInterface,
        pool: PoolRange,
    ) -> Result<SubnetMapping, RegistryError> {
        if self.find_subnet(subnet_id).await?.is_some() {
            warn!(subnet_id, subnet = %req.subnet, "Subnet id already taken in Kea");
            return Err(RegistryError::SubnetIdConflict(subnet_id));
        }

        let subnet = KeaSubnet::new(
            subnet_id,
            &req.subnet,
            pool,
            req.relay_address,
            req.ccap_core.as_deref(),
            req.lifetimes,
        );
        self.push_subnet(&subnet).await?;

        let mapping = SubnetMapping::for_bvi(bvi, subnet_id, Some(pool), req.ccap_core.clone());
        if let Err(e) = self.store.replace_mapping(&mapping) {
            error!(subnet_id, "Subnet written to Kea but mapping failed: {e}");
            if let Err(cleanup) = self.store.delete_mapping_by_kea_id(subnet_id) {
                warn!(subnet_id, "Mapping cleanup failed: {cleanup}");
            }
            return Err(e);
        }

        info!(
            subnet_id,
            subnet = %req.subnet,
            bvi = %bvi.display_name(),
            "Created subnet"
        );
        self.persist_and_reload().await;
        Ok(mapping)
    }

    pub async fn update_subnet(
        &self,
        subnet_id: u32,
        req: &SubnetRequest,
    ) -> Result<SubnetMapping, RegistryError> {
        let prefix = parse_prefix(&req.subnet)?;
        let pool = resolve_pool(req, &prefix)?;
        let bvi = self.require_bvi(req.bvi_interface_id)?;
        self.require_free_bvi(&bvi, Some(subnet_id))?;

        let dhcp6 = self.fetch_dhcp6().await?;
        let existing = subnets_in(&dhcp6);
        if !existing.iter().any(|s| s.id == subnet_id) {
            return Err(RegistryError::SubnetNotFound(subnet_id));
        }
        check_overlap(&req.subnet, &prefix, &existing, Some(subnet_id))?;
        if req.ccap_core.is_some() && !has_vendor_option_defs(&dhcp6) {
            return Err(RegistryError::VendorOptionsMissing);
        }

        let previous = self.store.get_mapping_by_kea_id(subnet_id)?;
        if req.ccap_core.is_none() {
            if let Some(old) = previous.as_ref().and_then(|m| m.ccap_core.as_deref()) {
                warn!(subnet_id, previous = old, "CCAP core removed from subnet");
            }
        }

        self.backup_kea_config("subnet-update").await;
        let subnet = KeaSubnet::new(
            subnet_id,
            &req.subnet,
            pool,
            req.relay_address,
            req.ccap_core.as_deref(),
            req.lifetimes,
        );
        self.push_subnet(&subnet).await?;

        let mut mapping = SubnetMapping::for_bvi(&bvi, subnet_id, Some(pool), req.ccap_core.clone());
        if let Some(previous) = previous {
            mapping.created_at = previous.created_at;
        }
        mapping.updated_at = Utc::now();
        self.store.upsert_mapping(&mapping)?;

        info!(subnet_id, subnet = %req.subnet, "Updated subnet");
        self.persist_and_reload().await;
        Ok(mapping)
    }

    /// Delete by Kea subnet id. A subnet Kea no longer has is not an error,
    /// and the mapping row is removed either way.
    pub async fn delete_subnet(&self, subnet_id: u32) -> Result<DeleteOutcome, RegistryError> {
        self.backup_kea_config("subnet-delete").await;
        let args = self
            .kea
            .with_remote(json!({ "subnets": [{ "id": subnet_id }] }));

        let kea_result = self
            .kea
            .send(commands::REMOTE_SUBNET6_DEL_BY_ID, args)
            .await
            .and_then(|resp| {
                let count = resp.count();
                resp.require(commands::REMOTE_SUBNET6_DEL_BY_ID)
                    .map(|_| count > 0)
            });

        let removed_from_kea = match kea_result {
            Ok(removed) => removed,
            Err(e) => {
                // Kea state unknown: drop the row anyway so the subnet shows
                // up as an orphan rather than a stale mapping.
                if let Err(db) = self.store.delete_mapping_by_kea_id(subnet_id) {
                    warn!(subnet_id, "Mapping cleanup after Kea failure failed: {db}");
                }
                return Err(e.into());
            }
        };

        if !removed_from_kea {
            info!(subnet_id, "Subnet not present in Kea, removing mapping only");
        }

        let mapping_removed = self.store.delete_mapping_by_kea_id(subnet_id)?;
        info!(subnet_id, removed_from_kea, mapping_removed, "Deleted subnet");

        if removed_from_kea {
            self.persist_and_reload().await;
        }

        Ok(DeleteOutcome {
            subnet_id,
            removed_from_kea,
            mapping_removed,
        })
    }

    /// Strict delete for unmapped subnets: Kea must actually remove it.
    pub async fn delete_orphaned_from_kea(&self, subnet_id: u32) -> Result<(), RegistryError> {
        let args = self
            .kea
            .with_remote(json!({ "subnets": [{ "id": subnet_id }] }));
        let resp = self.kea.send(commands::REMOTE_SUBNET6_DEL_BY_ID, args).await?;
        let count = resp.count();
        resp.require(commands::REMOTE_SUBNET6_DEL_BY_ID)?;

        if count == 0 {
            return Err(RegistryError::SubnetNotFound(subnet_id));
        }

        info!(subnet_id, "Deleted orphaned subnet from Kea");
        self.persist_and_reload().await;
        Ok(())
    }

    // ── Reconciliation ──────────────────────────────────────────

    /// Kea subnets left-joined with mapping rows and switch hostnames.
    pub async fn enriched_subnets(&self) -> Result<Vec<EnrichedSubnet>, RegistryError> {
        let subnets = self.list_kea_subnets().await?;
        let mut mappings: HashMap<u32, SubnetMapping> = self
            .store
            .list_mappings()?
            .into_iter()
            .map(|m| (m.kea_subnet_id, m))
            .collect();
        let hostnames: HashMap<i64, String> = self
            .store
            .list_switches()?
            .into_iter()
            .map(|s| (s.id, s.hostname))
            .collect();

        let enriched = subnets
            .into_iter()
            .map(|subnet| {
                let mapping = mappings.remove(&subnet.id);
                enrich(subnet, mapping, &hostnames)
            })
            .collect::<Vec<_>>();

        debug!(count = enriched.len(), "Enriched subnets");
        Ok(enriched)
    }

    pub async fn find_orphans(&self) -> Result<OrphanReport, RegistryError> {
        let subnets = self.list_kea_subnets().await?;
        let mappings = self.store.list_mappings()?;

        let kea_ids: BTreeSet<u32> = subnets.iter().map(|s| s.id).collect();
        let mapped_ids: BTreeSet<u32> = mappings.iter().map(|m| m.kea_subnet_id).collect();

        let report = OrphanReport {
            unmapped_subnets: subnets
                .into_iter()
                .filter(|s| !mapped_ids.contains(&s.id))
                .map(|s| UnmappedSubnet {
                    id: s.id,
                    subnet: s.subnet,
                })
                .collect(),
            stale_mappings: mappings
                .into_iter()
                .filter(|m| !kea_ids.contains(&m.kea_subnet_id))
                .collect(),
        };

        if !report.is_clean() {
            warn!(
                unmapped = report.unmapped_subnets.len(),
                stale = report.stale_mappings.len(),
                "Kea and mapping table disagree"
            );
        }
        Ok(report)
    }

    /// Repair: point BVI `bvi_interface_id` at an existing Kea subnet,
    /// copying pool and CCAP core from Kea.
    pub async fn link_orphaned(
        &self,
        subnet_id: u32,
        bvi_interface_id: i64,
    ) -> Result<SubnetMapping, RegistryError> {
        let bvi = self.require_bvi(bvi_interface_id)?;
        let subnet = self.get_subnet(subnet_id).await?;
        self.require_free_bvi(&bvi, Some(subnet_id))?;

        let pool = subnet.pool_range();
        if pool.is_none() && !subnet.pools.is_empty() {
            warn!(subnet_id, "Kea pool not in 'start - end' form, linking without pool");
        }

        let mapping = SubnetMapping::for_bvi(
            &bvi,
            subnet_id,
            pool,
            subnet.ccap_core().map(str::to_string),
        );
        self.store.replace_mapping(&mapping)?;

        info!(subnet_id, bvi = %bvi.display_name(), "Linked subnet to BVI interface");
        Ok(mapping)
    }

    /// Compare `Dhcp6.subnet6` across all active servers.
    pub async fn config_sync_status(&self) -> ConfigSyncStatus {
        let server_count = self.kea.servers().len();
        if server_count <= 1 {
            return ConfigSyncStatus {
                in_sync: true,
                server_count,
                message: "Single server configuration".into(),
                servers: Vec::new(),
                differences: Vec::new(),
            };
        }

        let mut servers = Vec::with_capacity(server_count);
        let mut configs: Vec<(String, Value)> = Vec::new();

        for outcome in self.kea.broadcast(commands::CONFIG_GET, Value::Null).await {
            let subnets = outcome
                .result
                .and_then(|resp| resp.require(commands::CONFIG_GET))
                .map(|args| {
                    args.and_then(|a| a.pointer("/Dhcp6/subnet6").cloned())
                        .unwrap_or_else(|| json!([]))
                });

            match subnets {
                Ok(subnets) => {
                    servers.push(ServerSubnetState {
                        server: outcome.server.clone(),
                        subnet_count: subnets.as_array().map(Vec::len),
                        error: None,
                    });
                    configs.push((outcome.server, subnets));
                }
                Err(e) => servers.push(ServerSubnetState {
                    server: outcome.server,
                    subnet_count: None,
                    error: Some(e.to_string()),
                }),
            }
        }

        let Some(((base_name, base), rest)) = configs.split_first() else {
            return ConfigSyncStatus {
                in_sync: false,
                server_count,
                message: "Failed to retrieve config from any server".into(),
                servers,
                differences: Vec::new(),
            };
        };

        let differences: Vec<String> = rest
            .iter()
            .filter(|(_, cfg)| cfg != base)
            .map(|(name, _)| format!("{name} differs from {base_name}"))
            .collect();
        let in_sync = differences.is_empty() && servers.iter().all(|s| s.error.is_none());

        ConfigSyncStatus {
            in_sync,
            server_count,
            message: if in_sync {
                "All servers in sync".into()
            } else if differences.is_empty() {
                "Some servers could not be checked".into()
            } else {
                "Configuration mismatch detected".into()
            },
            servers,
            differences,
        }
    }

    // ── Helpers ─────────────────────────────────────────────────

    fn require_bvi(&self, id: i64) -> Result<BviInterface, RegistryError> {
        self.store.get_bvi(id)?.ok_or(RegistryError::BviNotFound(id))
    }

    /// A BVI carries at most one subnet. `owner` is the subnet allowed to
    /// hold it already.
    fn require_free_bvi(
        &self,
        bvi: &BviInterface,
        owner: Option<u32>,
    ) -> Result<(), RegistryError> {
        match self.store.get_mapping_by_bvi(bvi.id)? {
            Some(m) if Some(m.kea_subnet_id) != owner => Err(RegistryError::BviInUse {
                bvi: bvi.display_name(),
                subnet_id: m.kea_subnet_id,
            }),
            _ => Ok(()),
        }
    }

    /// Snapshot every active server's config into the backup table.
    /// Failures are logged and never block the change that follows.
    async fn backup_kea_config(&self, operation: &str) {
        for outcome in self.kea.broadcast(commands::CONFIG_GET, Value::Null).await {
            let server = outcome.server;
            let config = match outcome.result.and_then(|resp| resp.require(commands::CONFIG_GET)) {
                Ok(Some(config)) => config,
                Ok(None) => {
                    warn!(server = %server, operation, "config-get returned no config, backup skipped");
                    continue;
                }
                Err(e) => {
                    warn!(server = %server, operation, "Config backup skipped: {e}");
                    continue;
                }
            };
            match self.store.record_config_backup(&server, operation, &config) {
                Ok(pruned) => debug!(server = %server, operation, pruned, "Backed up Kea config"),
                Err(e) => warn!(server = %server, operation, "Failed to store config backup: {e}"),
            }
        }
    }

    async fn push_subnet(&self, subnet: &KeaSubnet) -> Result<(), RegistryError> {
        let payload = serde_json::to_value(subnet)
            .map_err(|e| RegistryError::UnexpectedKeaData(e.to_string()))?;
        let args = self.kea.with_remote(json!({ "subnets": [payload] }));

        let resp = self.kea.send(commands::REMOTE_SUBNET6_SET, args.clone()).await?;
        match resp {
            KeaResponse::Success { .. } | KeaResponse::Empty { .. } => Ok(()),
            KeaResponse::Error { text } | KeaResponse::Unsupported { text } => {
                error!(
                    subnet_id = subnet.id,
                    command = commands::REMOTE_SUBNET6_SET,
                    arguments = %args,
                    "Kea rejected subnet: {text}"
                );
                Err(RegistryError::KeaSubnetWriteFailed {
                    subnet_id: subnet.id,
                    text,
                })
            }
        }
    }

    /// `config-write` (when a config file is configured) then `config-reload`.
    /// Both are best-effort.
    async fn persist_and_reload(&self) {
        if let Some(filename) = &self.config_file {
            let args = json!({ "filename": filename });
            if let Err(e) = self.best_effort(commands::CONFIG_WRITE, args).await {
                warn!(filename = %filename, "Kea config-write failed: {e}");
            }
        }
        if let Err(e) = self.best_effort(commands::CONFIG_RELOAD, Value::Null).await {
            warn!("Kea config-reload failed: {e}");
        }
    }

    async fn best_effort(&self, command: &str, args: Value) -> Result<(), KeaError> {
        self.kea.send(command, args).await?.require(command)?;
        Ok(())
    }
}

fn resolve_pool(req: &SubnetRequest, prefix: &Ipv6Net) -> Result<PoolRange, RegistryError> {
    match req.pool {
        None => Ok(pool_for_prefix(&req.subnet)?),
        Some(pool) => {
            if !prefix.contains(&pool.start) {
                return Err(PoolError::InvalidAddress(pool.start.to_string()).into());
            }
            if !prefix.contains(&pool.end) {
                return Err(PoolError::InvalidAddress(pool.end.to_string()).into());
            }
            if pool.start > pool.end {
                return Err(RegistryError::Validation(format!(
                    "pool start {} is after pool end {}",
                    pool.start, pool.end
                )));
            }
            Ok(pool)
        }
    }
}

fn subnets_in(dhcp6: &Value) -> Vec<KeaSubnet> {
    dhcp6
        .get("subnet6")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .filter_map(|s| match serde_json::from_value::<KeaSubnet>(s.clone()) {
                    Ok(subnet) => Some(subnet),
                    Err(e) => {
                        warn!("Skipping unreadable subnet6 entry: {e}");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_subnet_list(args: &Value) -> Result<Vec<KeaSubnet>, RegistryError> {
    match args.get("subnets") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| RegistryError::UnexpectedKeaData(format!("subnet list: {e}"))),
    }
}

fn check_overlap(
    subnet: &str,
    prefix: &Ipv6Net,
    existing: &[KeaSubnet],
    exclude: Option<u32>,
) -> Result<(), RegistryError> {
    for other in existing {
        if Some(other.id) == exclude {
            continue;
        }
        let Ok(other_prefix) = parse_prefix(&other.subnet) else {
            warn!(subnet_id = other.id, subnet = %other.subnet, "Unparsable subnet in Kea config");
            continue;
        };
        if prefixes_overlap(prefix, &other_prefix) {
            return Err(RegistryError::Overlap {
                subnet: subnet.trim().to_string(),
                existing: other.subnet.clone(),
                existing_id: other.id,
            });
        }
    }
    Ok(())
}

fn enrich(
    subnet: KeaSubnet,
    mapping: Option<SubnetMapping>,
    hostnames: &HashMap<i64, String>,
) -> EnrichedSubnet {
    let lifetimes = subnet.lifetimes();
    let kea_pool = subnet.pool_range();
    let kea_ccap = subnet.ccap_core().map(str::to_string);
    let relay_address = subnet.relay_address().map(str::to_string);

    match mapping {
        Some(m) => EnrichedSubnet {
            id: subnet.id,
            subnet: subnet.subnet,
            pool: m.pool.or(kea_pool),
            relay_address,
            ccap_core: m.ccap_core.or(kea_ccap),
            bvi_interface_id: Some(m.bvi_interface_id),
            interface_number: Some(m.interface_number),
            bvi_name: Some(bvi_display_name(m.interface_number)),
            ipv6_address: Some(m.ipv6_address),
            switch_id: Some(m.switch_id),
            switch_hostname: hostnames.get(&m.switch_id).cloned(),
            created_at: Some(m.created_at),
            updated_at: Some(m.updated_at),
            lifetimes,
        },
        None => EnrichedSubnet {
            id: subnet.id,
            subnet: subnet.subnet,
            pool: kea_pool,
            relay_address,
            ccap_core: kea_ccap,
            bvi_interface_id: None,
            interface_number: None,
            bvi_name: None,
            ipv6_address: None,
            switch_id: None,
            switch_hostname: None,
            created_at: None,
            updated_at: None,
            lifetimes,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::option_defs::sync_vendor_option_defs;
    use crate::types::Lifetimes;
    use cin_common::KeaConfig;
    use cin_kea::mock::MockKea;
    use std::net::Ipv6Addr;

    fn addr(s: &str) -> Ipv6Addr {
        s.parse().unwrap()
    }

    struct Fixture {
        kea: MockKea,
        registry: SubnetRegistry,
        bvi: BviInterface,
    }

    async fn fixture_with(config_file: Option<&str>) -> Fixture {
        let kea = MockKea::start().await.unwrap();
        let client = KeaClient::new(&kea.kea_config()).unwrap();
        sync_vendor_option_defs(&client).await;

        let store = MappingStore::open_in_memory().unwrap();
        let sw = store.create_switch("cin-sw-01").unwrap();
        let bvi = store.create_bvi(sw.id, 0, addr("2001:db8:1::1")).unwrap();

        let registry = SubnetRegistry::new(client, store, config_file.map(str::to_string));
        Fixture { kea, registry, bvi }
    }

    async fn fixture() -> Fixture {
        fixture_with(None).await
    }

    fn request(subnet: &str, bvi_id: i64) -> SubnetRequest {
        SubnetRequest {
            subnet: subnet.into(),
            bvi_interface_id: bvi_id,
            relay_address: addr("2001:db8:1::1"),
            pool: None,
            ccap_core: Some("2001:db8:9::1".into()),
            lifetimes: Lifetimes::default(),
        }
    }

    fn seed(kea: &MockKea, id: u32, subnet: &str) {
        kea.insert_subnet(json!({ "id": id, "subnet": subnet }));
    }

    #[test]
    fn test_next_free_id() {
        assert_eq!(next_free_id([]), 1);
        assert_eq!(next_free_id([1, 2, 4]), 3);
        assert_eq!(next_free_id([1, 2, 3]), 4);
        assert_eq!(next_free_id([4, 2, 1]), 3);
        assert_eq!(next_free_id([2, 3]), 1);
        assert_eq!(next_free_id([1, 1, 2]), 3);
    }

    #[tokio::test]
    async fn test_next_available_subnet_id_reads_config() {
        let f = fixture().await;
        assert_eq!(f.registry.next_available_subnet_id().await.unwrap(), 1);

        for (id, net) in [(1, "2001:db8:a::/64"), (2, "2001:db8:b::/64"), (4, "2001:db8:c::/64")] {
            seed(&f.kea, id, net);
        }
        assert_eq!(f.registry.next_available_subnet_id().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_create_end_to_end() {
        let f = fixture().await;
        let store = f.registry.store();
        let last = (1..42u32)
            .map(|n| {
                let ip = format!("2001:db8:100::{n:x}");
                store.create_bvi(f.bvi.switch_id, n, addr(&ip)).unwrap()
            })
            .last()
            .unwrap();
        assert_eq!(last.id, 42);

        let mapping = f
            .registry
            .create_subnet(&request("2001:db8:1::/64", 42))
            .await
            .unwrap();

        assert_eq!(mapping.kea_subnet_id, 1);
        assert_eq!(mapping.bvi_interface_id, 42);
        assert_eq!(mapping.interface_number, 41);

        let written = f.kea.last_arguments(commands::REMOTE_SUBNET6_SET).unwrap();
        let subnet = &written["subnets"][0];
        assert_eq!(subnet["pools"], json!([{"pool": "2001:db8:1::2 - 2001:db8:1::fffe"}]));
        assert_eq!(subnet["relay"]["ip-addresses"], json!(["2001:db8:1::1"]));
        assert_eq!(subnet["option-data"][0]["data"], "2001:db8:9::1");
        assert_eq!(subnet["option-data"][0]["code"], 61);
        assert_eq!(written["remote"], json!({"type": "mysql"}));

        let row = f.registry.store().get_mapping_by_kea_id(1).unwrap().unwrap();
        let pool = row.pool.unwrap();
        assert_eq!(pool.start.to_string(), "2001:db8:1::2");
        assert_eq!(pool.end.to_string(), "2001:db8:1::fffe");

        let cmds = f.kea.commands();
        let set_at = cmds.iter().position(|c| c == commands::REMOTE_SUBNET6_SET).unwrap();
        let reload_at = cmds.iter().rposition(|c| c == commands::CONFIG_RELOAD).unwrap();
        assert!(reload_at > set_at);
    }

    #[tokio::test]
    async fn test_create_then_enrich_round_trip() {
        let f = fixture().await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();

        let list = f.registry.enriched_subnets().await.unwrap();
        assert_eq!(list.len(), 1);
        let s = &list[0];
        assert_eq!(s.subnet, "2001:db8:1::/64");
        assert_eq!(s.pool.unwrap().to_kea_pool(), "2001:db8:1::2 - 2001:db8:1::fffe");
        assert_eq!(s.ccap_core.as_deref(), Some("2001:db8:9::1"));
        assert_eq!(s.bvi_interface_id, Some(f.bvi.id));
        assert_eq!(s.bvi_name.as_deref(), Some("BVI100"));
        assert_eq!(s.switch_hostname.as_deref(), Some("cin-sw-01"));
        assert_eq!(s.lifetimes, Lifetimes::default());
    }

    #[tokio::test]
    async fn test_unknown_bvi_rejected_before_kea_write() {
        let f = fixture().await;
        let err = f
            .registry
            .create_subnet(&request("2001:db8:1::/64", 999))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BviNotFound(999)));
        assert_eq!(f.kea.count(commands::REMOTE_SUBNET6_SET), 0);
    }

    #[tokio::test]
    async fn test_invalid_prefix_never_reaches_kea() {
        let f = fixture().await;
        let before = f.kea.commands().len();
        let err = f
            .registry
            .create_subnet(&request("2001:db8:1::/129", f.bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::InvalidInput(PoolError::InvalidPrefix(_))));
        assert_eq!(f.kea.commands().len(), before);
    }

    #[tokio::test]
    async fn test_kea_write_failure_leaves_no_mapping() {
        let f = fixture().await;
        f.kea.fail_command(commands::REMOTE_SUBNET6_SET, 1, "database unavailable");

        let err = f
            .registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap_err();
        assert!(
            matches!(err, RegistryError::KeaSubnetWriteFailed { subnet_id: 1, ref text } if text == "database unavailable")
        );
        assert!(f.registry.store().list_mappings().unwrap().is_empty());
        assert_eq!(f.kea.count(commands::CONFIG_RELOAD), 0);
    }

    #[tokio::test]
    async fn test_reload_failure_does_not_fail_create() {
        let f = fixture().await;
        f.kea.fail_command(commands::CONFIG_RELOAD, 1, "reload failed");

        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        assert_eq!(f.kea.count(commands::CONFIG_RELOAD), 1);
    }

    #[tokio::test]
    async fn test_config_write_precedes_reload() {
        let f = fixture_with(Some("/etc/kea/kea-dhcp6.conf")).await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();

        let cmds = f.kea.commands();
        let n = cmds.len();
        assert_eq!(&cmds[n - 2..], &["config-write".to_string(), "config-reload".to_string()]);
        assert_eq!(
            f.kea.last_arguments(commands::CONFIG_WRITE).unwrap()["filename"],
            "/etc/kea/kea-dhcp6.conf"
        );
    }

    #[tokio::test]
    async fn test_overlapping_prefix_rejected() {
        let f = fixture().await;
        seed(&f.kea, 1, "2001:db8::/48");

        let err = f
            .registry
            .create_subnet(&request("2001:db8:0:5::/64", f.bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Overlap { existing_id: 1, .. }));
        assert_eq!(f.kea.count(commands::REMOTE_SUBNET6_SET), 0);
        assert!(f.registry.store().list_config_backups(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ccap_requires_vendor_option_defs() {
        let kea = MockKea::start().await.unwrap();
        let store = MappingStore::open_in_memory().unwrap();
        let sw = store.create_switch("cin-sw-01").unwrap();
        let bvi = store.create_bvi(sw.id, 0, addr("2001:db8:1::1")).unwrap();
        let registry = SubnetRegistry::new(KeaClient::new(&kea.kea_config()).unwrap(), store, None);

        let err = registry
            .create_subnet(&request("2001:db8:1::/64", bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::VendorOptionsMissing));

        let mut plain = request("2001:db8:1::/64", bvi.id);
        plain.ccap_core = None;
        registry.create_subnet(&plain).await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_pool_must_fit_prefix() {
        let f = fixture().await;
        let mut req = request("2001:db8:1::/64", f.bvi.id);
        req.pool = Some(PoolRange {
            start: addr("2001:db8:1::100"),
            end: addr("2001:db8:2::ffff"),
        });
        assert!(matches!(
            f.registry.create_subnet(&req).await.unwrap_err(),
            RegistryError::InvalidInput(PoolError::InvalidAddress(_))
        ));

        req.pool = Some(PoolRange {
            start: addr("2001:db8:1::100"),
            end: addr("2001:db8:1::1ff"),
        });
        let mapping = f.registry.create_subnet(&req).await.unwrap();
        assert_eq!(mapping.pool, req.pool);
    }

    #[tokio::test]
    async fn test_concurrent_allocation_detected() {
        let f = fixture().await;
        seed(&f.kea, 1, "2001:db8:a::/64");

        let store = f.registry.store().clone();
        let second_bvi = store.create_bvi(f.bvi.switch_id, 1, addr("2001:db8:2::1")).unwrap();
        let other = SubnetRegistry::new(
            KeaClient::new(&KeaConfig::single(f.kea.url.clone())).unwrap(),
            store,
            None,
        );

        // Both see the same snapshot and pick the same id
        let a = f.registry.next_available_subnet_id().await.unwrap();
        let b = other.next_available_subnet_id().await.unwrap();
        assert_eq!(a, 2);
        assert_eq!(a, b);

        let req_a = request("2001:db8:1::/64", f.bvi.id);
        let req_b = request("2001:db8:2::/64", second_bvi.id);
        let pool_a = pool_for_prefix(&req_a.subnet).unwrap();
        let pool_b = pool_for_prefix(&req_b.subnet).unwrap();

        f.registry
            .create_with_id(a, &req_a, &f.bvi, pool_a)
            .await
            .unwrap();
        let err = other
            .create_with_id(b, &req_b, &second_bvi, pool_b)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::SubnetIdConflict(2)));

        // First writer's subnet is untouched
        assert_eq!(f.kea.subnet(2).unwrap()["subnet"], "2001:db8:1::/64");
        let row = f.registry.store().get_mapping_by_kea_id(2).unwrap().unwrap();
        assert_eq!(row.bvi_interface_id, f.bvi.id);
    }

    #[tokio::test]
    async fn test_parallel_creates_get_distinct_ids() {
        let f = fixture().await;
        let second_bvi = f
            .registry
            .store()
            .create_bvi(f.bvi.switch_id, 1, addr("2001:db8:2::1"))
            .unwrap();

        let req_a = request("2001:db8:1::/64", f.bvi.id);
        let req_b = request("2001:db8:2::/64", second_bvi.id);
        let (a, b) = tokio::join!(
            f.registry.create_subnet(&req_a),
            f.registry.create_subnet(&req_b)
        );
        let mut ids = vec![a.unwrap().kea_subnet_id, b.unwrap().kea_subnet_id];
        ids.sort();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_update_subnet() {
        let f = fixture().await;
        let created = f
            .registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();

        let mut req = request("2001:db8:1::/64", f.bvi.id);
        req.ccap_core = Some("2001:db8:9::1,2001:db8:9::2".into());
        req.lifetimes.valid_lifetime = 86400;
        let updated = f.registry.update_subnet(1, &req).await.unwrap();

        assert_eq!(updated.created_at, created.created_at);
        let kea_subnet = f.kea.subnet(1).unwrap();
        assert_eq!(kea_subnet["valid-lifetime"], 86400);
        assert_eq!(kea_subnet["option-data"][0]["data"], "2001:db8:9::1,2001:db8:9::2");
        let row = f.registry.store().get_mapping_by_kea_id(1).unwrap().unwrap();
        assert_eq!(row.ccap_core.as_deref(), Some("2001:db8:9::1,2001:db8:9::2"));
    }

    #[tokio::test]
    async fn test_update_unknown_subnet_is_not_found() {
        let f = fixture().await;
        let err = f
            .registry
            .update_subnet(42, &request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::SubnetNotFound(42)));
        assert_eq!(f.kea.count(commands::REMOTE_SUBNET6_SET), 0);
    }

    #[tokio::test]
    async fn test_update_may_keep_own_prefix() {
        let f = fixture().await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        seed(&f.kea, 2, "2001:db8:2::/64");

        // Own prefix is excluded from the overlap check
        f.registry
            .update_subnet(1, &request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        // Someone else's is not
        let err = f
            .registry
            .update_subnet(1, &request("2001:db8:2::/64", f.bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Overlap { existing_id: 2, .. }));
    }

    #[tokio::test]
    async fn test_update_onto_occupied_bvi_never_reaches_kea() {
        let f = fixture().await;
        let other_bvi = f
            .registry
            .store()
            .create_bvi(f.bvi.switch_id, 1, addr("2001:db8:2::1"))
            .unwrap();
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        let mut second = request("2001:db8:2::/64", other_bvi.id);
        second.relay_address = addr("2001:db8:2::1");
        f.registry.create_subnet(&second).await.unwrap();
        let writes = f.kea.count(commands::REMOTE_SUBNET6_SET);

        let mut moved = request("2001:db8:1::/64", other_bvi.id);
        moved.relay_address = addr("2001:db8:2::1");
        let err = f.registry.update_subnet(1, &moved).await.unwrap_err();
        assert!(matches!(
            err,
            RegistryError::BviInUse { ref bvi, subnet_id: 2 } if bvi == "BVI101"
        ));

        assert_eq!(f.kea.count(commands::REMOTE_SUBNET6_SET), writes);
        assert_eq!(f.kea.subnet(1).unwrap()["relay"]["ip-addresses"], json!(["2001:db8:1::1"]));
        let row = f.registry.store().get_mapping_by_kea_id(1).unwrap().unwrap();
        assert_eq!(row.bvi_interface_id, f.bvi.id);
    }

    #[tokio::test]
    async fn test_create_and_link_refuse_occupied_bvi() {
        let f = fixture().await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        let writes = f.kea.count(commands::REMOTE_SUBNET6_SET);

        let err = f
            .registry
            .create_subnet(&request("2001:db8:7::/64", f.bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::BviInUse { subnet_id: 1, .. }));
        assert_eq!(f.kea.count(commands::REMOTE_SUBNET6_SET), writes);

        seed(&f.kea, 5, "2001:db8:5::/64");
        let err = f.registry.link_orphaned(5, f.bvi.id).await.unwrap_err();
        assert!(matches!(err, RegistryError::BviInUse { subnet_id: 1, .. }));
        let row = f.registry.store().get_mapping_by_bvi(f.bvi.id).unwrap().unwrap();
        assert_eq!(row.kea_subnet_id, 1);
    }

    #[tokio::test]
    async fn test_mutations_back_up_kea_config() {
        let f = fixture().await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        f.registry
            .update_subnet(1, &request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        f.registry.delete_subnet(1).await.unwrap();

        let backups = f.registry.store().list_config_backups(None).unwrap();
        let ops: Vec<&str> = backups.iter().map(|b| b.operation.as_str()).collect();
        assert_eq!(ops, vec!["subnet-delete", "subnet-update", "subnet-create"]);
        assert!(backups.iter().all(|b| b.server == "primary"));
        // snapshots are taken before the change
        assert_eq!(backups[2].config["Dhcp6"]["subnet6"], json!([]));
        assert_eq!(backups[0].config["Dhcp6"]["subnet6"][0]["id"], 1);
    }

    #[tokio::test]
    async fn test_backup_failure_does_not_block_delete() {
        let f = fixture().await;
        seed(&f.kea, 3, "2001:db8:3::/64");
        f.kea.fail_command(commands::CONFIG_GET, 1, "config unavailable");

        let outcome = f.registry.delete_subnet(3).await.unwrap();
        assert!(outcome.removed_from_kea);
        assert!(f.registry.store().list_config_backups(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mapping_write_failure_after_kea_accepts() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cin.db");
        let kea = MockKea::start().await.unwrap();
        let client = KeaClient::new(&kea.kea_config()).unwrap();
        sync_vendor_option_defs(&client).await;

        let store = MappingStore::open(&path).unwrap();
        let sw = store.create_switch("cin-sw-01").unwrap();
        let bvi = store.create_bvi(sw.id, 0, addr("2001:db8:1::1")).unwrap();
        let registry = SubnetRegistry::new(client, store, None);

        // every mapping insert now aborts
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER reject_mapping BEFORE INSERT ON cin_bvi_dhcp_core
                 BEGIN SELECT RAISE(ABORT, 'mapping table is read-only'); END;",
            )
            .unwrap();

        let err = registry
            .create_subnet(&request("2001:db8:1::/64", bvi.id))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Persistence(_)));

        // Kea keeps the subnet, nothing is reloaded and it reports as unmapped
        assert_eq!(kea.subnet_ids(), vec![1]);
        assert_eq!(kea.count(commands::CONFIG_RELOAD), 0);
        assert!(registry.store().list_mappings().unwrap().is_empty());
        let report = registry.find_orphans().await.unwrap();
        assert_eq!(report.unmapped_subnets.len(), 1);
        assert_eq!(report.unmapped_subnets[0].id, 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let f = fixture().await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        let reloads = f.kea.count(commands::CONFIG_RELOAD);

        let first = f.registry.delete_subnet(1).await.unwrap();
        assert!(first.removed_from_kea);
        assert!(first.mapping_removed);
        assert_eq!(f.kea.count(commands::CONFIG_RELOAD), reloads + 1);

        let second = f.registry.delete_subnet(1).await.unwrap();
        assert!(!second.removed_from_kea);
        assert!(!second.mapping_removed);
        // no reload when Kea deleted nothing
        assert_eq!(f.kea.count(commands::CONFIG_RELOAD), reloads + 1);

        assert!(f.kea.subnet_ids().is_empty());
        assert!(f.registry.store().list_mappings().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_removes_stale_mapping() {
        let f = fixture().await;
        f.registry
            .store()
            .replace_mapping(&SubnetMapping::for_bvi(&f.bvi, 8, None, None))
            .unwrap();

        let outcome = f.registry.delete_subnet(8).await.unwrap();
        assert!(!outcome.removed_from_kea);
        assert!(outcome.mapping_removed);
    }

    #[tokio::test]
    async fn test_delete_kea_error_is_reported() {
        let f = fixture().await;
        f.registry
            .create_subnet(&request("2001:db8:1::/64", f.bvi.id))
            .await
            .unwrap();
        f.kea.fail_command(commands::REMOTE_SUBNET6_DEL_BY_ID, 1, "backend down");

        let err = f.registry.delete_subnet(1).await.unwrap_err();
        assert!(matches!(err, RegistryError::Kea(KeaError::Command { .. })));
        // Kea kept it, mapping is gone: it now reports as an orphan
        let orphans = f.registry.find_orphans().await.unwrap();
        assert_eq!(orphans.unmapped_subnets.len(), 1);
    }

    #[tokio::test]
    async fn test_list_empty_kea() {
        let f = fixture().await;
        assert!(f.registry.list_kea_subnets().await.unwrap().is_empty());
        assert!(f.registry.enriched_subnets().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_orphan_surfaces_in_enriched_list() {
        let f = fixture().await;
        seed(&f.kea, 5, "2001:db8:5::/64");

        let list = f.registry.enriched_subnets().await.unwrap();
        assert_eq!(list.len(), 1);
        assert!(list[0].is_orphan());
        assert_eq!(list[0].switch_hostname, None);
    }

    #[tokio::test]
    async fn test_find_orphans_both_directions() {
        let f = fixture().await;
        seed(&f.kea, 5, "2001:db8:5::/64");
        f.registry
            .store()
            .replace_mapping(&SubnetMapping::for_bvi(&f.bvi, 9, None, None))
            .unwrap();

        let report = f.registry.find_orphans().await.unwrap();
        assert_eq!(
            report.unmapped_subnets,
            vec![UnmappedSubnet {
                id: 5,
                subnet: "2001:db8:5::/64".into()
            }]
        );
        assert_eq!(report.stale_mappings.len(), 1);
        assert_eq!(report.stale_mappings[0].kea_subnet_id, 9);
    }

    #[tokio::test]
    async fn test_link_orphaned_copies_pool_and_ccap() {
        let f = fixture().await;
        f.kea.insert_subnet(json!({
            "id": 5,
            "subnet": "2001:db8:5::/64",
            "pools": [{"pool": "2001:db8:5::2 - 2001:db8:5::fffe"}],
            "option-data": [{"name": "ccap-core", "code": 61, "space": "vendor-4491", "data": "2001:db8:9::5"}]
        }));

        let mapping = f.registry.link_orphaned(5, f.bvi.id).await.unwrap();
        assert_eq!(mapping.pool.unwrap().start, addr("2001:db8:5::2"));
        assert_eq!(mapping.ccap_core.as_deref(), Some("2001:db8:9::5"));
        assert!(f.registry.find_orphans().await.unwrap().is_clean());

        assert!(matches!(
            f.registry.link_orphaned(77, f.bvi.id).await.unwrap_err(),
            RegistryError::SubnetNotFound(77)
        ));
        assert!(matches!(
            f.registry.link_orphaned(5, 999).await.unwrap_err(),
            RegistryError::BviNotFound(999)
        ));
    }

    #[tokio::test]
    async fn test_delete_orphaned_is_strict() {
        let f = fixture().await;
        seed(&f.kea, 5, "2001:db8:5::/64");

        f.registry.delete_orphaned_from_kea(5).await.unwrap();
        assert!(f.kea.subnet_ids().is_empty());
        assert!(matches!(
            f.registry.delete_orphaned_from_kea(5).await.unwrap_err(),
            RegistryError::SubnetNotFound(5)
        ));
    }

    #[tokio::test]
    async fn test_get_subnet() {
        let f = fixture().await;
        seed(&f.kea, 3, "2001:db8:3::/64");
        assert_eq!(f.registry.get_subnet(3).await.unwrap().subnet, "2001:db8:3::/64");
        assert!(matches!(
            f.registry.get_subnet(4).await.unwrap_err(),
            RegistryError::SubnetNotFound(4)
        ));
    }

    #[tokio::test]
    async fn test_config_sync_status() {
        let a = MockKea::start().await.unwrap();
        let b = MockKea::start().await.unwrap();
        let mut config = a.kea_config();
        config.servers.push(b.server_config("secondary", 1));
        let registry = SubnetRegistry::new(
            KeaClient::new(&config).unwrap(),
            MappingStore::open_in_memory().unwrap(),
            None,
        );

        seed(&a, 1, "2001:db8:1::/64");
        seed(&b, 1, "2001:db8:1::/64");
        let status = registry.config_sync_status().await;
        assert!(status.in_sync);
        assert_eq!(status.server_count, 2);

        seed(&b, 2, "2001:db8:2::/64");
        let status = registry.config_sync_status().await;
        assert!(!status.in_sync);
        assert_eq!(status.differences, vec!["secondary differs from primary".to_string()]);
        assert_eq!(status.servers[1].subnet_count, Some(2));
    }

    #[tokio::test]
    async fn test_single_server_is_in_sync() {
        let f = fixture().await;
        let status = f.registry.config_sync_status().await;
        assert!(status.in_sync);
        assert_eq!(status.server_count, 1);
    }
}
