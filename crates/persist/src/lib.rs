//! Longhall persistence: one server row per tenant plus its world details and
//! ordered modifiers. SQLite for real use, an in-memory map for tests.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use longhall_core::{Modifier, Server, TenantId, WorldDetails};
use metrics::{counter, histogram};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// A server together with the launch configuration it was provisioned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub server: Server,
    pub world: WorldDetails,
}

pub trait Store: Send + Sync {
    fn find_server(&self, tenant: &TenantId) -> Result<Option<ServerRecord>>;
    /// Insert a new record. Fails if the tenant already has one.
    fn save_server(&self, record: &ServerRecord) -> Result<()>;
    /// Overwrite the server row (state, address, grants).
    fn update_server(&self, server: &Server) -> Result<()>;
    /// Replace the world details whose tenant, world name and server name all
    /// match. Returns false when nothing matched.
    fn update_world_details(&self, tenant: &TenantId, world: &str, name: &str, details: &WorldDetails) -> Result<bool>;
    /// Remove the record and everything hanging off it. Returns false if absent.
    fn delete_server(&self, tenant: &TenantId) -> Result<bool>;
}

/// SQLite-backed store. Synchronous; callers hold it only for short lookups.
pub struct SqliteStore {
    db: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("LONGHALL_DB_PATH").unwrap_or_else(|_| default_db_path());
        Self::open(&path)
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        Self::init(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(rusqlite::Connection::open_in_memory().context("opening in-memory sqlite db")?)
    }

    fn init(db: rusqlite::Connection) -> Result<Self> {
        let started = std::time::Instant::now();
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute_batch(
            "CREATE TABLE IF NOT EXISTS servers (
                tenant          TEXT PRIMARY KEY,
                server_ip       TEXT NOT NULL,
                port            INTEGER NOT NULL,
                cpu_requests    INTEGER NOT NULL,
                memory_requests INTEGER NOT NULL,
                cpu_limit       INTEGER NOT NULL,
                memory_limit    INTEGER NOT NULL,
                pvc_name        TEXT NOT NULL,
                deployment_name TEXT NOT NULL,
                state           TEXT NOT NULL,
                created_at      INTEGER NOT NULL,
                updated_at      INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS world_details (
                tenant               TEXT PRIMARY KEY,
                name                 TEXT NOT NULL,
                world                TEXT NOT NULL,
                port                 INTEGER NOT NULL,
                password             TEXT NOT NULL,
                crossplay            INTEGER NOT NULL,
                public               INTEGER NOT NULL,
                save_interval_secs   INTEGER NOT NULL,
                backup_count         INTEGER NOT NULL,
                initial_backup_secs  INTEGER NOT NULL,
                backup_interval_secs INTEGER NOT NULL,
                cpu_requests         INTEGER NOT NULL,
                memory_requests      INTEGER NOT NULL,
                instance_id          TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS modifiers (
                tenant   TEXT NOT NULL,
                position INTEGER NOT NULL,
                key      TEXT NOT NULL,
                value    TEXT NOT NULL,
                PRIMARY KEY (tenant, position)
            );",
        )
        .context("creating tables")?;
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(took_ms = %started.elapsed().as_millis(), "sqlite store ready");
        Ok(Self { db: Mutex::new(db) })
    }

    fn conn(&self) -> Result<MutexGuard<'_, rusqlite::Connection>> {
        self.db.lock().map_err(|_| anyhow!("sqlite connection mutex poisoned"))
    }
}

fn write_modifiers(tx: &rusqlite::Transaction<'_>, tenant: &str, world: &WorldDetails) -> Result<()> {
    tx.execute("DELETE FROM modifiers WHERE tenant = ?1", [tenant])?;
    for (pos, m) in world.modifiers.iter().enumerate() {
        tx.execute(
            "INSERT INTO modifiers(tenant, position, key, value) VALUES (?1, ?2, ?3, ?4)",
            params![tenant, pos as i64, m.key.as_str(), m.value],
        )?;
    }
    Ok(())
}

fn write_world(tx: &rusqlite::Transaction<'_>, tenant: &str, w: &WorldDetails) -> Result<()> {
    tx.execute(
        "INSERT OR REPLACE INTO world_details(tenant, name, world, port, password, crossplay, public,
            save_interval_secs, backup_count, initial_backup_secs, backup_interval_secs, cpu_requests,
            memory_requests, instance_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            tenant,
            w.name,
            w.world,
            w.port,
            w.password,
            w.crossplay,
            w.public,
            w.save_interval_secs,
            w.backup_count,
            w.initial_backup_secs,
            w.backup_interval_secs,
            w.cpu_requests,
            w.memory_requests,
            w.instance_id,
        ],
    )?;
    write_modifiers(tx, tenant, w)
}

/// Server columns with the text fields still unchecked.
struct ServerRow {
    server_ip: String,
    port: u16,
    cpu_requests: u32,
    memory_requests: u32,
    cpu_limit: u32,
    memory_limit: u32,
    pvc_name: String,
    deployment_name: String,
    state: String,
    created_at: i64,
    updated_at: i64,
}

impl ServerRow {
    fn read(r: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            server_ip: r.get(0)?,
            port: r.get(1)?,
            cpu_requests: r.get(2)?,
            memory_requests: r.get(3)?,
            cpu_limit: r.get(4)?,
            memory_limit: r.get(5)?,
            pvc_name: r.get(6)?,
            deployment_name: r.get(7)?,
            state: r.get(8)?,
            created_at: r.get(9)?,
            updated_at: r.get(10)?,
        })
    }

    fn into_server(self, tenant: &TenantId) -> Result<Server> {
        Ok(Server {
            tenant: tenant.clone(),
            server_ip: self.server_ip,
            port: self.port,
            cpu_requests: self.cpu_requests,
            memory_requests: self.memory_requests,
            cpu_limit: self.cpu_limit,
            memory_limit: self.memory_limit,
            pvc_name: self.pvc_name,
            deployment_name: self.deployment_name,
            state: self.state.parse().with_context(|| format!("bad state for tenant {}", tenant))?,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

impl Store for SqliteStore {
    fn find_server(&self, tenant: &TenantId) -> Result<Option<ServerRecord>> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let row = db
            .query_row(
                "SELECT server_ip, port, cpu_requests, memory_requests, cpu_limit, memory_limit,
                        pvc_name, deployment_name, state, created_at, updated_at
                 FROM servers WHERE tenant = ?1",
                [tenant.as_str()],
                ServerRow::read,
            )
            .optional()
            .context("reading server row")?;
        let Some(row) = row else {
            histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
            return Ok(None);
        };
        let server = row.into_server(tenant)?;

        let mut world = db
            .query_row(
                "SELECT name, world, port, password, crossplay, public, save_interval_secs, backup_count,
                        initial_backup_secs, backup_interval_secs, cpu_requests, memory_requests, instance_id
                 FROM world_details WHERE tenant = ?1",
                [tenant.as_str()],
                |r| {
                    Ok(WorldDetails {
                        name: r.get(0)?,
                        world: r.get(1)?,
                        port: r.get(2)?,
                        password: r.get(3)?,
                        crossplay: r.get(4)?,
                        public: r.get(5)?,
                        save_interval_secs: r.get(6)?,
                        backup_count: r.get(7)?,
                        initial_backup_secs: r.get(8)?,
                        backup_interval_secs: r.get(9)?,
                        cpu_requests: r.get(10)?,
                        memory_requests: r.get(11)?,
                        instance_id: r.get(12)?,
                        modifiers: Default::default(),
                    })
                },
            )
            .with_context(|| format!("reading world details for tenant {}", tenant))?;

        let mut stmt = db.prepare("SELECT key, value FROM modifiers WHERE tenant = ?1 ORDER BY position")?;
        let mut rows = stmt.query([tenant.as_str()])?;
        while let Some(row) = rows.next()? {
            let key: String = row.get(0)?;
            let value: String = row.get(1)?;
            world.modifiers.push(Modifier::parse(&key, &value).with_context(|| format!("stored modifier {}={}", key, value))?);
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(Some(ServerRecord { server, world }))
    }

    fn save_server(&self, record: &ServerRecord) -> Result<()> {
        let started = std::time::Instant::now();
        let s = &record.server;
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO servers(tenant, server_ip, port, cpu_requests, memory_requests, cpu_limit, memory_limit,
                pvc_name, deployment_name, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                s.tenant.as_str(),
                s.server_ip,
                s.port,
                s.cpu_requests,
                s.memory_requests,
                s.cpu_limit,
                s.memory_limit,
                s.pvc_name,
                s.deployment_name,
                s.state.as_str(),
                s.created_at,
                s.updated_at,
            ],
        )
        .with_context(|| format!("inserting server for tenant {}", s.tenant))?;
        write_world(&tx, s.tenant.as_str(), &record.world)?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn update_server(&self, s: &Server) -> Result<()> {
        let started = std::time::Instant::now();
        let db = self.conn()?;
        let n = db.execute(
            "UPDATE servers SET server_ip = ?2, port = ?3, cpu_requests = ?4, memory_requests = ?5,
                cpu_limit = ?6, memory_limit = ?7, pvc_name = ?8, deployment_name = ?9, state = ?10,
                updated_at = ?11
             WHERE tenant = ?1",
            params![
                s.tenant.as_str(),
                s.server_ip,
                s.port,
                s.cpu_requests,
                s.memory_requests,
                s.cpu_limit,
                s.memory_limit,
                s.pvc_name,
                s.deployment_name,
                s.state.as_str(),
                s.updated_at,
            ],
        )?;
        if n == 0 {
            return Err(anyhow!("no server row for tenant {}", s.tenant));
        }
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn update_world_details(&self, tenant: &TenantId, world: &str, name: &str, details: &WorldDetails) -> Result<bool> {
        let started = std::time::Instant::now();
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        let matched: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM world_details WHERE tenant = ?1 AND world = ?2 AND name = ?3",
                params![tenant.as_str(), world, name],
                |r| r.get(0),
            )
            .optional()?;
        if matched.is_none() {
            return Ok(false);
        }
        write_world(&tx, tenant.as_str(), details)?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(true)
    }

    fn delete_server(&self, tenant: &TenantId) -> Result<bool> {
        let mut db = self.conn()?;
        let tx = db.transaction()?;
        tx.execute("DELETE FROM modifiers WHERE tenant = ?1", [tenant.as_str()])?;
        tx.execute("DELETE FROM world_details WHERE tenant = ?1", [tenant.as_str()])?;
        let n = tx.execute("DELETE FROM servers WHERE tenant = ?1", [tenant.as_str()])?;
        tx.commit()?;
        counter!("persist_delete_total", 1u64);
        Ok(n > 0)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".longhall");
        let _ = std::fs::create_dir_all(&p);
        p.push("longhall.db");
        return p.to_string_lossy().to_string();
    }
    "longhall.db".to_string()
}

/// Map-backed store with the same matching rules as [`SqliteStore`].
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<TenantId, ServerRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn rows(&self) -> Result<MutexGuard<'_, BTreeMap<TenantId, ServerRecord>>> {
        self.rows.lock().map_err(|_| anyhow!("memory store mutex poisoned"))
    }

    pub fn len(&self) -> usize { self.rows().map(|r| r.len()).unwrap_or_default() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

impl Store for MemoryStore {
    fn find_server(&self, tenant: &TenantId) -> Result<Option<ServerRecord>> { Ok(self.rows()?.get(tenant).cloned()) }

    fn save_server(&self, record: &ServerRecord) -> Result<()> {
        let mut rows = self.rows()?;
        if rows.contains_key(&record.server.tenant) {
            return Err(anyhow!("server for tenant {} already stored", record.server.tenant));
        }
        rows.insert(record.server.tenant.clone(), record.clone());
        Ok(())
    }

    fn update_server(&self, server: &Server) -> Result<()> {
        let mut rows = self.rows()?;
        let rec = rows.get_mut(&server.tenant).ok_or_else(|| anyhow!("no server row for tenant {}", server.tenant))?;
        rec.server = Server { created_at: rec.server.created_at, ..server.clone() };
        Ok(())
    }

    fn update_world_details(&self, tenant: &TenantId, world: &str, name: &str, details: &WorldDetails) -> Result<bool> {
        let mut rows = self.rows()?;
        match rows.get_mut(tenant) {
            Some(rec) if rec.world.world == world && rec.world.name == name => {
                rec.world = details.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn delete_server(&self, tenant: &TenantId) -> Result<bool> { Ok(self.rows()?.remove(tenant).is_some()) }
}
