//! World configuration: request validation, entitlement clamping and the
//! launch-argument string handed to the game server.
//!
//! The argument string is read by two processes: the game server itself and
//! the log sidecar, which tails the file named by `-logFile` to find the join
//! code. Its layout must stay byte-for-byte stable:
//!
//! ```text
//! -name "<name>" -port <port> -world "<world>" -password "<password>"
//! -instanceid <id> -backups <n> -backupshort <secs> -backuplong <secs>
//! [-crossplay] -public <1|0> [-modifier <key> <value>]... -logFile <path>
//! ```
//! (a single line, tokens separated by one space).

use std::fmt::Write as _;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::modifiers::{parse_modifiers, ModifierInput, Modifiers};
use crate::{clamp_to_ceiling, Entitlements, ValidationError};

/// Directory shared between the server and the log sidecar.
pub const LOG_DIR: &str = "/valheim/logs";
/// Log file written by the server and tailed by the sidecar.
pub const LOG_FILE: &str = "/valheim/logs/server.log";

pub const DEFAULT_PORT: u16 = 2456;
pub const DEFAULT_BACKUPS: u32 = 4;
pub const DEFAULT_INITIAL_BACKUP_SECS: u32 = 7200;
pub const DEFAULT_BACKUP_INTERVAL_SECS: u32 = 43200;
pub const DEFAULT_SAVE_INTERVAL_SECS: u32 = 1800;
const MIN_INTERVAL_SECS: u32 = 60;

static WORLD_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,64}$").expect("static regex"));

/// Desired server configuration as sent by a client for create and patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRequest {
    pub name: String,
    pub world: String,
    pub password: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub crossplay: bool,
    #[serde(default = "default_public")]
    pub public: bool,
    /// Stored with the world; not part of the launch string.
    #[serde(default)]
    pub save_interval_secs: Option<u32>,
    #[serde(default)]
    pub backup_count: Option<u32>,
    #[serde(default)]
    pub initial_backup_secs: Option<u32>,
    #[serde(default)]
    pub backup_interval_secs: Option<u32>,
    #[serde(default)]
    pub cpu_requests: Option<u32>,
    #[serde(default)]
    pub memory_requests: Option<u32>,
    #[serde(default)]
    pub modifiers: Vec<ModifierInput>,
}

fn default_public() -> bool { true }

impl ServerRequest {
    /// Check every field; returns the parsed modifier list on success.
    pub fn validate(&self) -> Result<Modifiers, ValidationError> {
        let name = self.name.trim();
        if name.is_empty() || name.chars().count() > 64 {
            return Err(ValidationError::field("name", "length must be 1..=64"));
        }
        if name.contains('"') || name.chars().any(char::is_control) {
            return Err(ValidationError::field("name", "must not contain quotes or control characters"));
        }
        if !WORLD_NAME.is_match(&self.world) {
            return Err(ValidationError::field("world", "1..=64 of [A-Za-z0-9_-]"));
        }
        if self.password.chars().count() < 5 {
            return Err(ValidationError::field("password", "at least 5 characters"));
        }
        if self.password.contains('"') || self.password.chars().any(char::is_whitespace) {
            return Err(ValidationError::field("password", "must not contain quotes or whitespace"));
        }
        // The server refuses to start when the password appears in its name.
        if name.contains(self.password.as_str()) {
            return Err(ValidationError::field("password", "must not be part of the server name"));
        }
        if let Some(port) = self.port {
            if !(1024..=65534).contains(&port) {
                return Err(ValidationError::field("port", "must be within 1024..=65534"));
            }
        }
        if self.save_interval_secs.is_some_and(|s| s < MIN_INTERVAL_SECS) {
            return Err(ValidationError::field("save_interval_secs", "at least 60 seconds"));
        }
        if self.initial_backup_secs.is_some_and(|s| s < MIN_INTERVAL_SECS) {
            return Err(ValidationError::field("initial_backup_secs", "at least 60 seconds"));
        }
        if self.backup_interval_secs.is_some_and(|s| s < MIN_INTERVAL_SECS) {
            return Err(ValidationError::field("backup_interval_secs", "at least 60 seconds"));
        }
        if self.cpu_requests == Some(0) {
            return Err(ValidationError::field("cpu_requests", "must be positive"));
        }
        if self.memory_requests == Some(0) {
            return Err(ValidationError::field("memory_requests", "must be positive"));
        }
        parse_modifiers(&self.modifiers)
    }
}

/// Launch configuration persisted next to a [`crate::Server`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldDetails {
    pub name: String,
    pub world: String,
    pub port: u16,
    pub password: String,
    pub crossplay: bool,
    pub public: bool,
    pub save_interval_secs: u32,
    pub backup_count: u32,
    pub initial_backup_secs: u32,
    pub backup_interval_secs: u32,
    pub cpu_requests: u32,
    pub memory_requests: u32,
    /// Internal uniqueness token; empty on anything handed back to callers.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default)]
    pub modifiers: Modifiers,
}

impl WorldDetails {
    /// Validate `req`, clamp it to `ent` and stamp it with `instance_id`.
    pub fn from_request(req: &ServerRequest, ent: &Entitlements, instance_id: String) -> Result<Self, ValidationError> {
        let modifiers = req.validate()?;
        Ok(Self {
            name: req.name.trim().to_string(),
            world: req.world.clone(),
            port: req.port.unwrap_or(DEFAULT_PORT),
            password: req.password.clone(),
            crossplay: req.crossplay,
            public: req.public,
            save_interval_secs: req.save_interval_secs.unwrap_or(DEFAULT_SAVE_INTERVAL_SECS),
            backup_count: clamp_to_ceiling(Some(req.backup_count.unwrap_or(DEFAULT_BACKUPS)), ent.max_backups),
            initial_backup_secs: req.initial_backup_secs.unwrap_or(DEFAULT_INITIAL_BACKUP_SECS),
            backup_interval_secs: req.backup_interval_secs.unwrap_or(DEFAULT_BACKUP_INTERVAL_SECS),
            cpu_requests: clamp_to_ceiling(req.cpu_requests, ent.cpu),
            memory_requests: clamp_to_ceiling(req.memory_requests, ent.memory_gi),
            instance_id,
            modifiers,
        })
    }

    pub fn new_instance_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }

    /// Copy safe to return to a caller.
    pub fn redacted(&self) -> Self {
        Self { instance_id: String::new(), ..self.clone() }
    }

    /// Render the launch-argument string. Pure: equal input, equal output.
    pub fn launch_args(&self) -> String {
        let mut s = String::with_capacity(256);
        let _ = write!(
            s,
            "-name \"{}\" -port {} -world \"{}\" -password \"{}\" -instanceid {} -backups {} -backupshort {} -backuplong {}",
            self.name,
            self.port,
            self.world,
            self.password,
            self.instance_id,
            self.backup_count,
            self.initial_backup_secs,
            self.backup_interval_secs,
        );
        if self.crossplay {
            s.push_str(" -crossplay");
        }
        s.push_str(if self.public { " -public 1" } else { " -public 0" });
        for m in &self.modifiers {
            let _ = write!(s, " -modifier {} {}", m.key, m.value);
        }
        let _ = write!(s, " -logFile {}", LOG_FILE);
        s
    }
}
