//! Durable store
//!
//! The single source of truth for restart and recovery. The rest of the crate
//! only needs "read all" and "write one" semantics from it, optionally grouped
//! into a caller-supplied [`Txn`] that commits atomically.
//!
//! Two backends:
//! - [`MemoryStore`]: process-local, for tests and throwaway nodes
//! - [`RocksStore`]: RocksDB, one column family per table

pub mod memory;
pub mod model;
pub mod rocks;

pub use memory::MemoryStore;
pub use model::{App, ConfigEntry, Dataset, Node, Record, Table, User, ValueType};
pub use rocks::RocksStore;

use crate::common::{Error, Result};

/// One pending change
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Fails with `AlreadyExists` when the unique key (or a user's name) is taken
    Insert(Record),
    /// Fails with `NotFound` when the row is absent
    Update(Record),
    /// Removing an absent row is a no-op
    Delete(Record),
}

/// Transactional scope: mutations staged here commit all together or not at all
#[derive(Debug, Default)]
pub struct Txn {
    mutations: Vec<Mutation>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: Record) {
        self.mutations.push(Mutation::Insert(record));
    }

    pub fn update(&mut self, record: Record) {
        self.mutations.push(Mutation::Update(record));
    }

    pub fn delete(&mut self, record: Record) {
        self.mutations.push(Mutation::Delete(record));
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn into_mutations(self) -> Vec<Mutation> {
        self.mutations
    }
}

/// Persistence contract consumed by the snapshot store, the admin service and
/// the replication coordinator.
pub trait DurableStore: Send + Sync {
    /// All users, in stored order
    fn get_all_users(&self) -> Result<Vec<User>>;

    /// All apps, in stored order
    fn get_all_apps(&self) -> Result<Vec<App>>;

    /// All configs, in stored order (creation time, then key)
    fn get_all_configs(&self) -> Result<Vec<ConfigEntry>>;

    /// All nodes, ordered by URL
    fn get_all_nodes(&self) -> Result<Vec<Node>>;

    /// Current data version, `Error::NoDataVersion` when never initialized
    fn get_data_version(&self) -> Result<u64>;

    /// Apply every staged mutation atomically
    fn commit(&self, txn: Txn) -> Result<()>;

    /// Replace users, apps, configs, nodes and the data version wholesale
    fn replace_all(&self, dataset: &Dataset) -> Result<()>;

    fn insert_record(&self, txn: Option<&mut Txn>, record: Record) -> Result<()> {
        match txn {
            Some(txn) => {
                txn.insert(record);
                Ok(())
            }
            None => {
                let mut txn = Txn::new();
                txn.insert(record);
                self.commit(txn)
            }
        }
    }

    fn update_record(&self, txn: Option<&mut Txn>, record: Record) -> Result<()> {
        match txn {
            Some(txn) => {
                txn.update(record);
                Ok(())
            }
            None => {
                let mut txn = Txn::new();
                txn.update(record);
                self.commit(txn)
            }
        }
    }

    fn delete_record(&self, txn: Option<&mut Txn>, record: Record) -> Result<()> {
        match txn {
            Some(txn) => {
                txn.delete(record);
                Ok(())
            }
            None => {
                let mut txn = Txn::new();
                txn.delete(record);
                self.commit(txn)
            }
        }
    }

    /// Initialize the data version to 1 on a fresh store; returns the current version
    fn init_data_version(&self) -> Result<u64> {
        match self.get_data_version() {
            Ok(version) => Ok(version),
            Err(Error::NoDataVersion) => {
                self.insert_record(None, Record::DataVersion(1))?;
                tracing::info!("Initialized data version to 1");
                Ok(1)
            }
            Err(e) => Err(e),
        }
    }

    /// Read the whole store as one dataset
    fn load_dataset(&self) -> Result<Dataset> {
        Ok(Dataset {
            users: self.get_all_users()?,
            apps: self.get_all_apps()?,
            configs: self.get_all_configs()?,
            nodes: self.get_all_nodes()?,
            data_version: self.get_data_version()?,
        })
    }
}
