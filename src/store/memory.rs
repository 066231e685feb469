//! In-memory durable store backend

use crate::common::{Error, Result};
use crate::store::model::{self, App, ConfigEntry, Dataset, Node, Record, User};
use crate::store::{DurableStore, Mutation, Txn};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Row maps of every table
#[derive(Debug, Clone, Default)]
pub(crate) struct Tables {
    users: HashMap<String, User>,
    apps: HashMap<String, App>,
    configs: HashMap<String, ConfigEntry>,
    nodes: HashMap<String, Node>,
    data_version: Option<u64>,
}

impl Tables {
    pub(crate) fn from_dataset(dataset: &Dataset) -> Self {
        Self {
            users: dataset
                .users
                .iter()
                .map(|u| (u.key.clone(), u.clone()))
                .collect(),
            apps: dataset
                .apps
                .iter()
                .map(|a| (a.key.clone(), a.clone()))
                .collect(),
            configs: dataset
                .configs
                .iter()
                .map(|c| (c.key.clone(), c.clone()))
                .collect(),
            nodes: dataset
                .nodes
                .iter()
                .map(|n| (n.url.clone(), n.clone()))
                .collect(),
            data_version: Some(dataset.data_version),
        }
    }

    fn contains(&self, record: &Record) -> bool {
        let key = record.unique_key();
        match record {
            Record::User(_) => self.users.contains_key(key),
            Record::App(_) => self.apps.contains_key(key),
            Record::Config(_) => self.configs.contains_key(key),
            Record::Node(_) => self.nodes.contains_key(key),
            Record::DataVersion(_) => self.data_version.is_some(),
        }
    }

    fn put(&mut self, record: Record) {
        match record {
            Record::User(u) => {
                self.users.insert(u.key.clone(), u);
            }
            Record::App(a) => {
                self.apps.insert(a.key.clone(), a);
            }
            Record::Config(c) => {
                self.configs.insert(c.key.clone(), c);
            }
            Record::Node(n) => {
                self.nodes.insert(n.url.clone(), n);
            }
            Record::DataVersion(v) => self.data_version = Some(v),
        }
    }

    fn remove(&mut self, record: &Record) {
        let key = record.unique_key();
        match record {
            Record::User(_) => {
                self.users.remove(key);
            }
            Record::App(_) => {
                self.apps.remove(key);
            }
            Record::Config(_) => {
                self.configs.remove(key);
            }
            Record::Node(_) => {
                self.nodes.remove(key);
            }
            Record::DataVersion(_) => self.data_version = None,
        }
    }

    /// Apply one mutation, enforcing unique keys and unique user names
    pub(crate) fn apply(&mut self, mutation: Mutation) -> Result<()> {
        match mutation {
            Mutation::Insert(record) => {
                if self.contains(&record) {
                    return Err(Error::AlreadyExists(format!(
                        "{} {}",
                        record.table().name(),
                        record.unique_key()
                    )));
                }
                if let Record::User(user) = &record {
                    if self.users.values().any(|u| u.name == user.name) {
                        return Err(Error::AlreadyExists(format!("user name {}", user.name)));
                    }
                }
                self.put(record);
            }
            Mutation::Update(record) => {
                if !self.contains(&record) {
                    return Err(match record {
                        Record::DataVersion(_) => Error::NoDataVersion,
                        _ => Error::NotFound(format!(
                            "{} {}",
                            record.table().name(),
                            record.unique_key()
                        )),
                    });
                }
                if let Record::User(user) = &record {
                    if self
                        .users
                        .values()
                        .any(|u| u.name == user.name && u.key != user.key)
                    {
                        return Err(Error::AlreadyExists(format!("user name {}", user.name)));
                    }
                }
                self.put(record);
            }
            Mutation::Delete(record) => self.remove(&record),
        }
        Ok(())
    }

    pub(crate) fn users(&self) -> Vec<User> {
        let mut users: Vec<User> = self.users.values().cloned().collect();
        model::sort_users(&mut users);
        users
    }

    pub(crate) fn apps(&self) -> Vec<App> {
        let mut apps: Vec<App> = self.apps.values().cloned().collect();
        model::sort_apps(&mut apps);
        apps
    }

    pub(crate) fn configs(&self) -> Vec<ConfigEntry> {
        let mut configs: Vec<ConfigEntry> = self.configs.values().cloned().collect();
        model::sort_configs(&mut configs);
        configs
    }

    pub(crate) fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self.nodes.values().cloned().collect();
        model::sort_nodes(&mut nodes);
        nodes
    }

    pub(crate) fn data_version(&self) -> Result<u64> {
        self.data_version.ok_or(Error::NoDataVersion)
    }
}

/// In-memory store (default when no database path is configured)
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a dataset
    pub fn with_dataset(dataset: &Dataset) -> Self {
        Self {
            tables: Mutex::new(Tables::from_dataset(dataset)),
        }
    }
}

impl DurableStore for MemoryStore {
    fn get_all_users(&self) -> Result<Vec<User>> {
        Ok(self.tables.lock().users())
    }

    fn get_all_apps(&self) -> Result<Vec<App>> {
        Ok(self.tables.lock().apps())
    }

    fn get_all_configs(&self) -> Result<Vec<ConfigEntry>> {
        Ok(self.tables.lock().configs())
    }

    fn get_all_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.tables.lock().nodes())
    }

    fn get_data_version(&self) -> Result<u64> {
        self.tables.lock().data_version()
    }

    fn commit(&self, txn: Txn) -> Result<()> {
        let mut tables = self.tables.lock();
        // Stage on a copy so a failing mutation leaves nothing behind
        let mut staged = tables.clone();
        for mutation in txn.into_mutations() {
            staged.apply(mutation)?;
        }
        *tables = staged;
        Ok(())
    }

    fn replace_all(&self, dataset: &Dataset) -> Result<()> {
        *self.tables.lock() = Tables::from_dataset(dataset);
        Ok(())
    }
}
