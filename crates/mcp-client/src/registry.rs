//! Persisted MCP server records — CRUD with slug-constrained unique names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use wf_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum McpTransportKind {
    Stdio,
    Http,
}

/// When to prompt before forwarding a tool call to this server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmationMode {
    Always,
    UnsafeOnly,
    Never,
}

impl Default for ConfirmationMode {
    fn default() -> Self {
        Self::UnsafeOnly
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerRecord {
    pub id: Uuid,
    /// Slug-constrained, unique across the registry.
    pub name: String,
    pub enabled: bool,
    pub transport_type: McpTransportKind,
    /// Stdio: command/package spec. Http: endpoint URL.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// When set, only these tool names are surfaced to the agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled_tools: Option<Vec<String>>,
    #[serde(default)]
    pub confirmation_mode: ConfirmationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_connected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl McpServerRecord {
    pub fn new(name: &str, transport_type: McpTransportKind, path: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_owned(),
            enabled: true,
            transport_type,
            path: path.to_owned(),
            api_key: None,
            env: HashMap::new(),
            enabled_tools: None,
            confirmation_mode: ConfirmationMode::default(),
            last_connected_at: None,
            last_error: None,
        }
    }

    /// Derived status: error when the last connect failed.
    pub fn status(&self) -> &'static str {
        if !self.enabled {
            "disabled"
        } else if self.last_error.is_some() {
            "error"
        } else if self.last_connected_at.is_some() {
            "connected"
        } else {
            "unconnected"
        }
    }
}

/// Server names must be stable slugs: they become tool-name prefixes.
pub fn is_valid_slug(name: &str) -> bool {
    static SLUG: OnceLock<regex::Regex> = OnceLock::new();
    let re = SLUG.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9][a-z0-9_-]{0,63}$").expect("slug pattern must compile")
    });
    re.is_match(name)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpServerRegistry {
    path: PathBuf,
    records: RwLock<Vec<McpServerRecord>>,
}

impl McpServerRegistry {
    pub fn new(state_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join("mcp_servers.json");
        let records = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    fn persist(&self, records: &[McpServerRecord]) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(records)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn create(&self, record: McpServerRecord) -> Result<McpServerRecord> {
        if !is_valid_slug(&record.name) {
            return Err(Error::Validation(format!(
                "server name '{}' is not a valid slug",
                record.name
            )));
        }
        let mut records = self.records.write();
        if records.iter().any(|r| r.name == record.name) {
            return Err(Error::Validation(format!(
                "server name '{}' already exists",
                record.name
            )));
        }
        records.push(record.clone());
        self.persist(&records)?;
        Ok(record)
    }

    pub fn update(&self, id: Uuid, f: impl FnOnce(&mut McpServerRecord)) -> Result<McpServerRecord> {
        let mut records = self.records.write();
        let index = records
            .iter()
            .position(|r| r.id == id)
            .ok_or_else(|| Error::Other(format!("MCP server {id} not found")))?;

        // Mutate a copy so validation failures leave the record untouched.
        let mut updated = records[index].clone();
        f(&mut updated);
        if !is_valid_slug(&updated.name) {
            return Err(Error::Validation(
                "updated server name is not a valid slug".into(),
            ));
        }
        let duplicate = records
            .iter()
            .enumerate()
            .any(|(i, r)| i != index && r.name == updated.name);
        if duplicate {
            return Err(Error::Validation(format!(
                "server name '{}' already exists",
                updated.name
            )));
        }

        records[index] = updated.clone();
        self.persist(&records)?;
        Ok(updated)
    }

    pub fn delete(&self, id: Uuid) -> Result<bool> {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.id != id);
        let removed = records.len() != before;
        if removed {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: Uuid) -> Option<McpServerRecord> {
        self.records.read().iter().find(|r| r.id == id).cloned()
    }

    pub fn get_by_name(&self, name: &str) -> Option<McpServerRecord> {
        self.records.read().iter().find(|r| r.name == name).cloned()
    }

    pub fn list(&self) -> Vec<McpServerRecord> {
        self.records.read().clone()
    }

    pub fn list_enabled(&self) -> Vec<McpServerRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.enabled)
            .cloned()
            .collect()
    }

    /// Record a successful connect.
    pub fn mark_connected(&self, id: Uuid) -> Result<()> {
        self.update(id, |r| {
            r.last_connected_at = Some(Utc::now());
            r.last_error = None;
        })
        .map(|_| ())
    }

    /// Record a failed connect; the server surfaces as status `error`.
    pub fn mark_error(&self, id: Uuid, message: &str) -> Result<()> {
        self.update(id, |r| {
            r.last_error = Some(message.to_owned());
        })
        .map(|_| ())
    }
}
