use std::net::Ipv6Addr;
use std::time::Duration;

use cin_common::LeaseConfig;
use cin_kea::{commands, KeaClient};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::cache::TtlCache;
use crate::error::LeaseError;
use crate::types::{Lease6, LeasePage, Reservation, ReservationKey, IDENTIFIER_TYPES};

type PageKey = (u32, Option<Ipv6Addr>, u32);

pub struct LeaseService {
    kea: KeaClient,
    pages: TtlCache<PageKey, LeasePage>,
    max_page_size: u32,
}

impl LeaseService {
    pub fn new(kea: KeaClient, config: &LeaseConfig) -> Self {
        Self {
            kea,
            pages: TtlCache::new(Duration::from_secs(config.cache_ttl_secs)),
            max_page_size: config.max_page_size.max(1),
        }
    }

    // ── Leases ──────────────────────────────────────────────────

    /// One page of `subnet_id`'s leases, starting after `from`.
    ///
    /// Kea pages over all subnets in address order, so a page can hold fewer
    /// than `limit` leases (or none) and still have a `next` cursor.
    pub async fn leases_page(
        &self,
        subnet_id: u32,
        from: Option<Ipv6Addr>,
        limit: Option<u32>,
    ) -> Result<LeasePage, LeaseError> {
        if subnet_id == 0 {
            return Err(LeaseError::Validation("subnet id must be positive".into()));
        }
        let limit = limit
            .unwrap_or(self.max_page_size)
            .clamp(1, self.max_page_size);

        let key = (subnet_id, from, limit);
        if let Some(page) = self.pages.get(&key) {
            debug!(subnet_id, ?from, limit, "Lease page served from cache");
            return Ok(page);
        }

        let cursor = from.map_or_else(|| "start".to_string(), |ip| ip.to_string());
        let resp = self
            .kea
            .send(commands::LEASE6_GET_PAGE, json!({ "from": cursor, "limit": limit }))
            .await?;

        let page = match resp.require(commands::LEASE6_GET_PAGE)? {
            None => LeasePage {
                subnet_id,
                leases: Vec::new(),
                next: None,
            },
            Some(args) => {
                let raw: Vec<Lease6> = list_field(&args, "leases")?;
                let next = if raw.len() >= limit as usize {
                    raw.last().map(|l| l.ip_address)
                } else {
                    None
                };
                LeasePage {
                    subnet_id,
                    leases: raw.into_iter().filter(|l| l.subnet_id == subnet_id).collect(),
                    next,
                }
            }
        };

        debug!(subnet_id, count = page.leases.len(), next = ?page.next, "Fetched lease page");
        self.pages.insert(key, page.clone());
        Ok(page)
    }

    /// Returns `false` when Kea had no such lease.
    pub async fn delete_lease(&self, ip_address: Ipv6Addr) -> Result<bool, LeaseError> {
        let resp = self
            .kea
            .send(commands::LEASE6_DEL, json!({ "ip-address": ip_address.to_string() }))
            .await?;
        let deleted = !resp.is_empty();
        resp.require(commands::LEASE6_DEL)?;

        self.pages.invalidate_all();
        info!(ip = %ip_address, deleted, "Lease delete");
        Ok(deleted)
    }

    /// Drop expired cached pages; returns how many were removed.
    pub fn purge_cache(&self) -> usize {
        self.pages.purge_expired()
    }

    // ── Reservations ────────────────────────────────────────────

    pub async fn add_reservation(&self, host: &Reservation) -> Result<(), LeaseError> {
        validate_host(host)?;
        self.send_host(commands::RESERVATION_ADD, host).await?;
        info!(subnet_id = host.subnet_id, "Reservation added");
        Ok(())
    }

    pub async fn update_reservation(&self, host: &Reservation) -> Result<(), LeaseError> {
        validate_host(host)?;
        self.send_host(commands::RESERVATION_UPDATE, host).await?;
        info!(subnet_id = host.subnet_id, "Reservation updated");
        Ok(())
    }

    /// Returns `false` when no matching reservation existed.
    pub async fn delete_reservation(
        &self,
        subnet_id: u32,
        key: &ReservationKey,
    ) -> Result<bool, LeaseError> {
        let args = match key {
            ReservationKey::Address(ip) => {
                json!({ "subnet-id": subnet_id, "ip-address": ip.to_string() })
            }
            ReservationKey::Identifier { kind, value } => {
                if !IDENTIFIER_TYPES.contains(&kind.as_str()) {
                    return Err(LeaseError::Validation(format!(
                        "unknown identifier type '{kind}'"
                    )));
                }
                json!({ "subnet-id": subnet_id, "identifier-type": kind, "identifier": value })
            }
        };

        let resp = self.kea.send(commands::RESERVATION_DEL, args).await?;
        let deleted = !resp.is_empty();
        resp.require(commands::RESERVATION_DEL)?;
        info!(subnet_id, ?key, deleted, "Reservation delete");
        Ok(deleted)
    }

    pub async fn reservations(&self, subnet_id: u32) -> Result<Vec<Reservation>, LeaseError> {
        let resp = self
            .kea
            .send(commands::RESERVATION_GET_ALL, json!({ "subnet-id": subnet_id }))
            .await?;
        match resp.require(commands::RESERVATION_GET_ALL)? {
            None => Ok(Vec::new()),
            Some(args) => list_field(&args, "hosts"),
        }
    }

    async fn send_host(&self, command: &str, host: &Reservation) -> Result<(), LeaseError> {
        let payload = serde_json::to_value(host)
            .map_err(|e| LeaseError::UnexpectedKeaData(e.to_string()))?;
        self.kea
            .send(command, json!({ "reservation": payload }))
            .await?
            .require(command)?;
        Ok(())
    }
}

fn validate_host(host: &Reservation) -> Result<(), LeaseError> {
    if host.subnet_id == 0 {
        return Err(LeaseError::Validation("subnet-id must be positive".into()));
    }
    if !host.has_identifier() {
        return Err(LeaseError::Validation(
            "reservation needs a duid, hw-address or flex-id".into(),
        ));
    }
    Ok(())
}

fn list_field<T: DeserializeOwned>(args: &Value, field: &str) -> Result<Vec<T>, LeaseError> {
    match args.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(list) => serde_json::from_value(list.clone())
            .map_err(|e| LeaseError::UnexpectedKeaData(format!("{field}: {e}"))),
    }
}
