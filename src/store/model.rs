//! Persisted records: users, apps, configs, nodes and the data version

use crate::common::{Error, NodeType, Result};
use serde::{Deserialize, Serialize};

/// Table names, also the RocksDB column family names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Table {
    Users,
    Apps,
    Configs,
    Nodes,
    DataVersion,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Users,
        Table::Apps,
        Table::Configs,
        Table::Nodes,
        Table::DataVersion,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Table::Users => "users",
            Table::Apps => "apps",
            Table::Configs => "configs",
            Table::Nodes => "nodes",
            Table::DataVersion => "data_version",
        }
    }
}

/// Row key of the single data version row
pub const DATA_VERSION_KEY: &str = "ver";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub key: String,
    pub name: String,
    pub created_utc: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct App {
    pub key: String,
    pub user_key: String,
    pub name: String,
    pub created_utc: u64,
}

/// Type tag of a config value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Float,
    Int,
    String,
    Code,
    Template,
}

impl ValueType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueType::Float => "float",
            ValueType::Int => "int",
            ValueType::String => "string",
            ValueType::Code => "code",
            ValueType::Template => "template",
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValueType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "float" => Ok(ValueType::Float),
            "int" => Ok(ValueType::Int),
            "string" => Ok(ValueType::String),
            "code" => Ok(ValueType::Code),
            "template" => Ok(ValueType::Template),
            other => Err(Error::InvalidRequest(format!("unknown value type: {}", other))),
        }
    }
}

/// A single configuration entry of an app, as stored
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigEntry {
    pub key: String,
    pub app_key: String,
    /// Field name exposed to clients
    pub k: String,
    /// Raw value, interpreted according to `v_type`
    pub v: String,
    pub v_type: ValueType,
    /// Data version the entry was created at, fixes its position among the
    /// app's configs
    pub seq: u64,
    pub created_utc: u64,
    pub updated_utc: u64,
}

/// A deployed instance, keyed by its client address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub url: String,
    pub node_url: String,
    pub node_type: NodeType,
    pub data_version: u64,
    pub created_utc: u64,
    #[serde(default)]
    pub last_check_utc: u64,
}

/// Any persisted row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "table", content = "row", rename_all = "snake_case")]
pub enum Record {
    User(User),
    App(App),
    Config(ConfigEntry),
    Node(Node),
    DataVersion(u64),
}

impl Record {
    pub fn table(&self) -> Table {
        match self {
            Record::User(_) => Table::Users,
            Record::App(_) => Table::Apps,
            Record::Config(_) => Table::Configs,
            Record::Node(_) => Table::Nodes,
            Record::DataVersion(_) => Table::DataVersion,
        }
    }

    /// Unique key of the row within its table
    pub fn unique_key(&self) -> &str {
        match self {
            Record::User(u) => &u.key,
            Record::App(a) => &a.key,
            Record::Config(c) => &c.key,
            Record::Node(n) => &n.url,
            Record::DataVersion(_) => DATA_VERSION_KEY,
        }
    }
}

/// The complete configuration state at one data version
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub users: Vec<User>,
    pub apps: Vec<App>,
    pub configs: Vec<ConfigEntry>,
    pub nodes: Vec<Node>,
    pub data_version: u64,
}

impl Dataset {
    /// Digest of users, apps and configs; equal digests mean equal content
    pub fn digest(&self) -> Result<String> {
        let bytes = bincode::serialize(&(&self.users, &self.apps, &self.configs))?;
        Ok(crate::common::blake3_hash(&bytes))
    }
}

/// Stored order of configs: creation sequence, then key
pub(crate) fn sort_configs(configs: &mut [ConfigEntry]) {
    configs.sort_by(|a, b| a.seq.cmp(&b.seq).then_with(|| a.key.cmp(&b.key)));
}

/// Stored order of other rows: creation time, then key

pub(crate) fn sort_apps(apps: &mut [App]) {
    apps.sort_by(|a, b| {
        a.created_utc
            .cmp(&b.created_utc)
            .then_with(|| a.key.cmp(&b.key))
    });
}

pub(crate) fn sort_users(users: &mut [User]) {
    users.sort_by(|a, b| {
        a.created_utc
            .cmp(&b.created_utc)
            .then_with(|| a.key.cmp(&b.key))
    });
}

pub(crate) fn sort_nodes(nodes: &mut [Node]) {
    nodes.sort_by(|a, b| a.url.cmp(&b.url));
}
