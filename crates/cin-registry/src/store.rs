use std::net::Ipv6Addr;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use cin_ipv6::PoolRange;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use tracing::info;

use crate::error::RegistryError;
use crate::types::{BviInterface, ConfigBackup, SubnetMapping, Switch};

const SCHEMA: &str = "
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS cin_switches (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    hostname    TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS cin_switch_bvi_interfaces (
    id                INTEGER PRIMARY KEY AUTOINCREMENT,
    switch_id         INTEGER NOT NULL REFERENCES cin_switches(id) ON DELETE CASCADE,
    interface_number  INTEGER NOT NULL,
    ipv6_address      TEXT NOT NULL UNIQUE,
    created_at        TEXT NOT NULL,
    UNIQUE (switch_id, interface_number)
);

-- id is the BVI interface id; kea_subnet_id points into Kea, not enforced here
CREATE TABLE IF NOT EXISTS cin_bvi_dhcp_core (
    id                INTEGER PRIMARY KEY,
    switch_id         INTEGER NOT NULL,
    kea_subnet_id     INTEGER NOT NULL UNIQUE,
    interface_number  INTEGER NOT NULL,
    ipv6_address      TEXT NOT NULL,
    start_address     TEXT,
    end_address       TEXT,
    ccap_core         TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);

-- server is the configured Kea server name
CREATE TABLE IF NOT EXISTS kea_config_backups (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    server       TEXT NOT NULL,
    operation    TEXT NOT NULL,
    config_json  TEXT NOT NULL,
    created_at   TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS kea_config_backups_server ON kea_config_backups (server, id);
";

/// Backups kept per server; older rows are pruned on every insert.
pub const CONFIG_BACKUPS_KEPT: u32 = 12;

const MAPPING_COLUMNS: &str = "id, switch_id, kea_subnet_id, interface_number, ipv6_address, \
     start_address, end_address, ccap_core, created_at, updated_at";

/// SQLite-backed store for switches, BVI interfaces and subnet mappings.
#[derive(Debug, Clone)]
pub struct MappingStore {
    conn: Arc<Mutex<Connection>>,
}

impl MappingStore {
    pub fn open(path: &Path) -> Result<Self, RegistryError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        info!(path = %path.display(), "Opened mapping database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, RegistryError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, RegistryError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ── Switches ────────────────────────────────────────────────

    pub fn create_switch(&self, hostname: &str) -> Result<Switch, RegistryError> {
        let hostname = hostname.trim();
        if hostname.is_empty() {
            return Err(RegistryError::Validation("hostname is required".into()));
        }
        let now = Utc::now();
        let conn = self.lock();
        conn.execute(
            "INSERT INTO cin_switches (hostname, created_at) VALUES (?1, ?2)",
            params![hostname, now.to_rfc3339()],
        )
        .map_err(|e| RegistryError::from_sql(e, || format!("Switch '{hostname}'")))?;

        Ok(Switch {
            id: conn.last_insert_rowid(),
            hostname: hostname.to_string(),
            created_at: now,
        })
    }

    pub fn get_switch(&self, id: i64) -> Result<Option<Switch>, RegistryError> {
        let switch = self
            .lock()
            .query_row(
                "SELECT id, hostname, created_at FROM cin_switches WHERE id = ?1",
                [id],
                switch_from_row,
            )
            .optional()?;
        Ok(switch)
    }

    pub fn list_switches(&self) -> Result<Vec<Switch>, RegistryError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT id, hostname, created_at FROM cin_switches ORDER BY hostname")?;
        let rows = stmt.query_map([], switch_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    pub fn switch_has_mappings(&self, id: i64) -> Result<bool, RegistryError> {
        Ok(count_mappings_for_switch(&self.lock(), id)? > 0)
    }

    /// Delete a switch and, by cascade, its BVI interfaces. Refused while any
    /// of its BVIs still carries a subnet: those live in Kea and must be
    /// deleted through the registry first.
    pub fn delete_switch(&self, id: i64) -> Result<(), RegistryError> {
        let conn = self.lock();
        let count = count_mappings_for_switch(&conn, id)?;
        if count > 0 {
            return Err(RegistryError::SwitchHasSubnets {
                switch_id: id,
                count,
            });
        }
        let deleted = conn.execute("DELETE FROM cin_switches WHERE id = ?1", [id])?;
        if deleted == 0 {
            return Err(RegistryError::SwitchNotFound(id));
        }
        info!(switch_id = id, "Deleted switch");
        Ok(())
    }

    // ── BVI interfaces ──────────────────────────────────────────

    pub fn create_bvi(
        &self,
        switch_id: i64,
        interface_number: u32,
        ipv6_address: Ipv6Addr,
    ) -> Result<BviInterface, RegistryError> {
        let now = Utc::now();
        let conn = self.lock();

        let exists: Option<i64> = conn
            .query_row("SELECT id FROM cin_switches WHERE id = ?1", [switch_id], |r| {
                r.get(0)
            })
            .optional()?;
        if exists.is_none() {
            return Err(RegistryError::SwitchNotFound(switch_id));
        }

        conn.execute(
            "INSERT INTO cin_switch_bvi_interfaces (switch_id, interface_number, ipv6_address, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![switch_id, interface_number, ipv6_address.to_string(), now.to_rfc3339()],
        )
        .map_err(|e| {
            RegistryError::from_sql(e, || {
                format!(
                    "BVI interface {} or address {ipv6_address}",
                    crate::types::bvi_display_name(interface_number)
                )
            })
        })?;

        Ok(BviInterface {
            id: conn.last_insert_rowid(),
            switch_id,
            interface_number,
            ipv6_address,
            created_at: now,
        })
    }

    pub fn get_bvi(&self, id: i64) -> Result<Option<BviInterface>, RegistryError> {
        let bvi = self
            .lock()
            .query_row(
                "SELECT id, switch_id, interface_number, ipv6_address, created_at
                 FROM cin_switch_bvi_interfaces WHERE id = ?1",
                [id],
                bvi_from_row,
            )
            .optional()?;
        Ok(bvi)
    }

    pub fn list_bvis(&self, switch_id: i64) -> Result<Vec<BviInterface>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, switch_id, interface_number, ipv6_address, created_at
             FROM cin_switch_bvi_interfaces WHERE switch_id = ?1 ORDER BY interface_number",
        )?;
        let rows = stmt.query_map([switch_id], bvi_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    // ── Subnet mappings ─────────────────────────────────────────

    /// Insert or overwrite the mapping of a BVI. Any other row holding the
    /// same `kea_subnet_id` is dropped with it.
    pub fn replace_mapping(&self, mapping: &SubnetMapping) -> Result<(), RegistryError> {
        let (start, end) = pool_columns(mapping.pool);
        self.lock().execute(
            "INSERT OR REPLACE INTO cin_bvi_dhcp_core (
                 id, switch_id, kea_subnet_id, interface_number, ipv6_address,
                 start_address, end_address, ccap_core, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                mapping.bvi_interface_id,
                mapping.switch_id,
                mapping.kea_subnet_id,
                mapping.interface_number,
                mapping.ipv6_address.to_string(),
                start,
                end,
                mapping.ccap_core,
                mapping.created_at.to_rfc3339(),
                mapping.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Insert, or update the row that already holds `kea_subnet_id`.
    /// `created_at` of an existing row is kept.
    pub fn upsert_mapping(&self, mapping: &SubnetMapping) -> Result<(), RegistryError> {
        let (start, end) = pool_columns(mapping.pool);
        self.lock()
            .execute(
                "INSERT INTO cin_bvi_dhcp_core (
                     id, switch_id, kea_subnet_id, interface_number, ipv6_address,
                     start_address, end_address, ccap_core, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(kea_subnet_id) DO UPDATE SET
                     id = excluded.id,
                     switch_id = excluded.switch_id,
                     interface_number = excluded.interface_number,
                     ipv6_address = excluded.ipv6_address,
                     start_address = excluded.start_address,
                     end_address = excluded.end_address,
                     ccap_core = excluded.ccap_core,
                     updated_at = excluded.updated_at",
                params![
                    mapping.bvi_interface_id,
                    mapping.switch_id,
                    mapping.kea_subnet_id,
                    mapping.interface_number,
                    mapping.ipv6_address.to_string(),
                    start,
                    end,
                    mapping.ccap_core,
                    mapping.created_at.to_rfc3339(),
                    mapping.updated_at.to_rfc3339(),
                ],
            )
            .map_err(|e| {
                RegistryError::from_sql(e, || {
                    format!("Mapping for BVI interface {}", mapping.bvi_interface_id)
                })
            })?;
        Ok(())
    }

    pub fn get_mapping_by_kea_id(
        &self,
        kea_subnet_id: u32,
    ) -> Result<Option<SubnetMapping>, RegistryError> {
        let mapping = self
            .lock()
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM cin_bvi_dhcp_core WHERE kea_subnet_id = ?1"),
                [kea_subnet_id],
                mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn get_mapping_by_bvi(
        &self,
        bvi_interface_id: i64,
    ) -> Result<Option<SubnetMapping>, RegistryError> {
        let mapping = self
            .lock()
            .query_row(
                &format!("SELECT {MAPPING_COLUMNS} FROM cin_bvi_dhcp_core WHERE id = ?1"),
                [bvi_interface_id],
                mapping_from_row,
            )
            .optional()?;
        Ok(mapping)
    }

    pub fn list_mappings(&self) -> Result<Vec<SubnetMapping>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MAPPING_COLUMNS} FROM cin_bvi_dhcp_core ORDER BY kea_subnet_id"
        ))?;
        let rows = stmt.query_map([], mapping_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Returns whether a row was removed.
    pub fn delete_mapping_by_kea_id(&self, kea_subnet_id: u32) -> Result<bool, RegistryError> {
        let deleted = self.lock().execute(
            "DELETE FROM cin_bvi_dhcp_core WHERE kea_subnet_id = ?1",
            [kea_subnet_id],
        )?;
        Ok(deleted > 0)
    }

    // ── Kea config backups ──────────────────────────────────────

    /// Store a snapshot for `server` and prune all but the newest
    /// [`CONFIG_BACKUPS_KEPT`] of its rows. Returns how many were pruned.
    pub fn record_config_backup(
        &self,
        server: &str,
        operation: &str,
        config: &Value,
    ) -> Result<usize, RegistryError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO kea_config_backups (server, operation, config_json, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![server, operation, config.to_string(), Utc::now().to_rfc3339()],
        )?;
        let pruned = conn.execute(
            "DELETE FROM kea_config_backups
             WHERE server = ?1 AND id NOT IN (
                 SELECT id FROM kea_config_backups WHERE server = ?1
                 ORDER BY id DESC LIMIT ?2)",
            params![server, CONFIG_BACKUPS_KEPT],
        )?;
        Ok(pruned)
    }

    /// Newest first, optionally for one server only.
    pub fn list_config_backups(
        &self,
        server: Option<&str>,
    ) -> Result<Vec<ConfigBackup>, RegistryError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, server, operation, config_json, created_at FROM kea_config_backups
             WHERE ?1 IS NULL OR server = ?1 ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([server], backup_from_row)?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn count_mappings_for_switch(conn: &Connection, switch_id: i64) -> rusqlite::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM cin_bvi_dhcp_core WHERE switch_id = ?1",
        [switch_id],
        |r| r.get(0),
    )
}

fn pool_columns(pool: Option<PoolRange>) -> (Option<String>, Option<String>) {
    match pool {
        Some(p) => (Some(p.start.to_string()), Some(p.end.to_string())),
        None => (None, None),
    }
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn addr_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Ipv6Addr> {
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn opt_addr_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Ipv6Addr>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn switch_from_row(row: &Row<'_>) -> rusqlite::Result<Switch> {
    Ok(Switch {
        id: row.get(0)?,
        hostname: row.get(1)?,
        created_at: time_at(row, 2)?,
    })
}

fn bvi_from_row(row: &Row<'_>) -> rusqlite::Result<BviInterface> {
    Ok(BviInterface {
        id: row.get(0)?,
        switch_id: row.get(1)?,
        interface_number: row.get(2)?,
        ipv6_address: addr_at(row, 3)?,
        created_at: time_at(row, 4)?,
    })
}

fn backup_from_row(row: &Row<'_>) -> rusqlite::Result<ConfigBackup> {
    let text: String = row.get(3)?;
    Ok(ConfigBackup {
        id: row.get(0)?,
        server: row.get(1)?,
        operation: row.get(2)?,
        config: serde_json::from_str(&text).map_err(|e| conversion_error(3, e))?,
        created_at: time_at(row, 4)?,
    })
}

fn mapping_from_row(row: &Row<'_>) -> rusqlite::Result<SubnetMapping> {
    let pool = match (opt_addr_at(row, 5)?, opt_addr_at(row, 6)?) {
        (Some(start), Some(end)) => Some(PoolRange { start, end }),
        _ => None,
    };
    Ok(SubnetMapping {
        bvi_interface_id: row.get(0)?,
        switch_id: row.get(1)?,
        kea_subnet_id: row.get(2)?,
        interface_number: row.get(3)?,
        ipv6_address: addr_at(row, 4)?,
        pool,
        ccap_core: row.get(7)?,
        created_at: time_at(row, 8)?,
        updated_at: time_at(row, 9)?,
    })
}
