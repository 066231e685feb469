//! RocksDB durable store backend
//!
//! One column family per table:
//! - `users`, `apps`, `configs`: keyed by record key
//! - `nodes`: keyed by client URL
//! - `data_version`: a single `ver` row
//!
//! Rows are bincode-encoded. A transaction becomes one `WriteBatch`.

use crate::common::{Error, Result};
use crate::store::model::{self, App, ConfigEntry, Dataset, Node, Record, Table, User};
use crate::store::model::DATA_VERSION_KEY;
use crate::store::{DurableStore, Mutation, Txn};
use parking_lot::Mutex;
use rocksdb::{ColumnFamily, IteratorMode, Options, WriteBatch, DB};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;

/// Pending state of rows touched earlier in the same transaction
type Overlay = HashMap<(Table, String), Option<Record>>;

pub struct RocksStore {
    db: DB,
    /// Serializes commits so validation and the batch write see the same state
    write_lock: Mutex<()>,
}

impl RocksStore {
    /// Open or create the store
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let names: Vec<&str> = Table::ALL.iter().map(|t| t.name()).collect();
        let db = DB::open_cf(&opts, path, names)?;

        Ok(Self {
            db,
            write_lock: Mutex::new(()),
        })
    }

    fn cf(&self, table: Table) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(table.name())
            .ok_or_else(|| Error::Corrupted(format!("missing column family {}", table.name())))
    }

    fn scan<T: DeserializeOwned>(&self, table: Table) -> Result<Vec<T>> {
        let cf = self.cf(table)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            rows.push(bincode::deserialize(&value)?);
        }
        Ok(rows)
    }

    fn encode(record: &Record) -> Result<Vec<u8>> {
        let bytes = match record {
            Record::User(u) => bincode::serialize(u)?,
            Record::App(a) => bincode::serialize(a)?,
            Record::Config(c) => bincode::serialize(c)?,
            Record::Node(n) => bincode::serialize(n)?,
            Record::DataVersion(v) => bincode::serialize(v)?,
        };
        Ok(bytes)
    }

    fn exists(&self, overlay: &Overlay, record: &Record) -> Result<bool> {
        let key = (record.table(), record.unique_key().to_string());
        if let Some(pending) = overlay.get(&key) {
            return Ok(pending.is_some());
        }
        let cf = self.cf(record.table())?;
        Ok(self.db.get_cf(cf, record.unique_key().as_bytes())?.is_some())
    }

    fn user_name_taken(&self, overlay: &Overlay, user: &User) -> Result<bool> {
        let clash = |u: &User| u.name == user.name && u.key != user.key;
        for stored in self.scan::<User>(Table::Users)? {
            if overlay.contains_key(&(Table::Users, stored.key.clone())) {
                continue;
            }
            if clash(&stored) {
                return Ok(true);
            }
        }
        Ok(overlay.values().any(|pending| match pending {
            Some(Record::User(u)) => clash(u),
            _ => false,
        }))
    }

    fn stage_put(&self, batch: &mut WriteBatch, overlay: &mut Overlay, record: Record) -> Result<()> {
        let cf = self.cf(record.table())?;
        batch.put_cf(cf, record.unique_key().as_bytes(), Self::encode(&record)?);
        overlay.insert((record.table(), record.unique_key().to_string()), Some(record));
        Ok(())
    }

    /// Flush to disk
    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl DurableStore for RocksStore {
    fn get_all_users(&self) -> Result<Vec<User>> {
        let mut users = self.scan::<User>(Table::Users)?;
        model::sort_users(&mut users);
        Ok(users)
    }

    fn get_all_apps(&self) -> Result<Vec<App>> {
        let mut apps = self.scan::<App>(Table::Apps)?;
        model::sort_apps(&mut apps);
        Ok(apps)
    }

    fn get_all_configs(&self) -> Result<Vec<ConfigEntry>> {
        let mut configs = self.scan::<ConfigEntry>(Table::Configs)?;
        model::sort_configs(&mut configs);
        Ok(configs)
    }

    fn get_all_nodes(&self) -> Result<Vec<Node>> {
        let mut nodes = self.scan::<Node>(Table::Nodes)?;
        model::sort_nodes(&mut nodes);
        Ok(nodes)
    }

    fn get_data_version(&self) -> Result<u64> {
        let cf = self.cf(Table::DataVersion)?;
        match self.db.get_cf(cf, DATA_VERSION_KEY.as_bytes())? {
            Some(bytes) => Ok(bincode::deserialize(&bytes)?),
            None => Err(Error::NoDataVersion),
        }
    }

    fn commit(&self, txn: Txn) -> Result<()> {
        if txn.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        let mut overlay = Overlay::new();
        let mut batch = WriteBatch::default();

        for mutation in txn.into_mutations() {
            match mutation {
                Mutation::Insert(record) => {
                    if self.exists(&overlay, &record)? {
                        return Err(Error::AlreadyExists(format!(
                            "{} {}",
                            record.table().name(),
                            record.unique_key()
                        )));
                    }
                    if let Record::User(user) = &record {
                        if self.user_name_taken(&overlay, user)? {
                            return Err(Error::AlreadyExists(format!("user name {}", user.name)));
                        }
                    }
                    self.stage_put(&mut batch, &mut overlay, record)?;
                }
                Mutation::Update(record) => {
                    if !self.exists(&overlay, &record)? {
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
                        if self.user_name_taken(&overlay, user)? {
                            return Err(Error::AlreadyExists(format!("user name {}", user.name)));
                        }
                    }
                    self.stage_put(&mut batch, &mut overlay, record)?;
                }
                Mutation::Delete(record) => {
                    let cf = self.cf(record.table())?;
                    batch.delete_cf(cf, record.unique_key().as_bytes());
                    overlay.insert((record.table(), record.unique_key().to_string()), None);
                }
            }
        }

        self.db.write(batch)?;
        Ok(())
    }

    fn replace_all(&self, dataset: &Dataset) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut batch = WriteBatch::default();

        for table in Table::ALL {
            let cf = self.cf(table)?;
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, _) = item?;
                batch.delete_cf(cf, key);
            }
        }

        let records = dataset
            .users
            .iter()
            .cloned()
            .map(Record::User)
            .chain(dataset.apps.iter().cloned().map(Record::App))
            .chain(dataset.configs.iter().cloned().map(Record::Config))
            .chain(dataset.nodes.iter().cloned().map(Record::Node))
            .chain(std::iter::once(Record::DataVersion(dataset.data_version)));
        for record in records {
            let cf = self.cf(record.table())?;
            batch.put_cf(cf, record.unique_key().as_bytes(), Self::encode(&record)?);
        }

        self.db.write(batch)?;
        Ok(())
    }
}
