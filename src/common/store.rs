//! Coordination store abstraction for fleetsync
//!
//! A shared key-value space with two scopes: per-unit data (each unit writes
//! only its own bag) and application data (only the leader writes). Values
//! are strings. Implementations may be eventually consistent; callers poll
//! and tolerate stale reads.
//!
//! Supports an in-process backend (tests, single-host simulation) and a
//! backend that keeps JSON documents on the shared volume.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::common::identity::RoleProvider;
use crate::common::utils::{read_optional, sanitize_unit_name, write_atomic};
use crate::common::{Error, Result};

pub type DataBag = BTreeMap<String, String>;

/// Trait for coordination store backends
pub trait CoordinationStore: Send + Sync {
    /// Unit this handle writes as
    fn local_unit(&self) -> &str;

    /// Set a key in the local unit's data
    fn set_unit_data(&self, key: &str, value: &str) -> Result<()>;

    /// Read a key from any unit's data
    fn get_unit_data(&self, unit_name: &str, key: &str) -> Result<Option<String>>;

    /// All units currently participating
    fn get_all_units(&self) -> Result<Vec<String>>;

    /// Set an application-scoped key (leader only)
    fn set_application_data(&self, key: &str, value: &str) -> Result<()>;

    /// Read an application-scoped key
    fn get_application_data(&self, key: &str) -> Result<Option<String>>;

    /// Write several local unit keys; backends override this to make it atomic
    fn set_unit_bag(&self, bag: &DataBag) -> Result<()> {
        for (key, value) in bag {
            self.set_unit_data(key, value)?;
        }
        Ok(())
    }

    /// Write several application keys; backends override this to make it atomic
    fn set_application_bag(&self, bag: &DataBag) -> Result<()> {
        for (key, value) in bag {
            self.set_application_data(key, value)?;
        }
        Ok(())
    }

    /// Read the given application keys, missing ones omitted
    fn get_application_bag(&self, keys: &[&str]) -> Result<DataBag> {
        let mut bag = DataBag::new();
        for key in keys {
            if let Some(value) = self.get_application_data(key)? {
                bag.insert((*key).to_string(), value);
            }
        }
        Ok(bag)
    }

    /// Read the given keys of one unit, missing ones omitted
    fn get_unit_bag(&self, unit_name: &str, keys: &[&str]) -> Result<DataBag> {
        let mut bag = DataBag::new();
        for key in keys {
            if let Some(value) = self.get_unit_data(unit_name, key)? {
                bag.insert((*key).to_string(), value);
            }
        }
        Ok(bag)
    }
}

#[derive(Debug, Default)]
struct RelationData {
    units: BTreeMap<String, DataBag>,
    app: DataBag,
}

/// In-memory relation shared by several [`MemoryStore`] handles
#[derive(Debug, Default)]
pub struct MemoryRelation {
    data: Mutex<RelationData>,
}

impl MemoryRelation {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Join the relation as `unit_name`, returning that unit's handle
    pub fn join(
        self: &Arc<Self>,
        unit_name: impl Into<String>,
        role: Arc<dyn RoleProvider>,
    ) -> MemoryStore {
        let unit = unit_name.into();
        self.lock().units.entry(unit.clone()).or_default();
        MemoryStore {
            relation: Arc::clone(self),
            unit,
            role,
        }
    }

    /// Drop a unit from the relation (unit departed)
    pub fn depart(&self, unit_name: &str) {
        self.lock().units.remove(unit_name);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RelationData> {
        self.data.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Handle onto a [`MemoryRelation`] for one unit
#[derive(Debug, Clone)]
pub struct MemoryStore {
    relation: Arc<MemoryRelation>,
    unit: String,
    role: Arc<dyn RoleProvider>,
}

impl MemoryStore {
    fn ensure_leader(&self) -> Result<()> {
        if self.role.is_leader() {
            Ok(())
        } else {
            Err(Error::leader_only("set_application_data"))
        }
    }
}

impl CoordinationStore for MemoryStore {
    fn local_unit(&self) -> &str {
        &self.unit
    }

    fn set_unit_data(&self, key: &str, value: &str) -> Result<()> {
        self.relation
            .lock()
            .units
            .entry(self.unit.clone())
            .or_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_unit_data(&self, unit_name: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .relation
            .lock()
            .units
            .get(unit_name)
            .and_then(|bag| bag.get(key).cloned()))
    }

    fn get_all_units(&self) -> Result<Vec<String>> {
        Ok(self.relation.lock().units.keys().cloned().collect())
    }

    fn set_application_data(&self, key: &str, value: &str) -> Result<()> {
        self.ensure_leader()?;
        self.relation
            .lock()
            .app
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get_application_data(&self, key: &str) -> Result<Option<String>> {
        Ok(self.relation.lock().app.get(key).cloned())
    }

    fn set_unit_bag(&self, bag: &DataBag) -> Result<()> {
        let mut data = self.relation.lock();
        let unit = data.units.entry(self.unit.clone()).or_default();
        unit.extend(bag.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn set_application_bag(&self, bag: &DataBag) -> Result<()> {
        self.ensure_leader()?;
        let mut data = self.relation.lock();
        data.app
            .extend(bag.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }
}

const APP_DOC: &str = "app.json";
const UNITS_DIR: &str = "units";

#[derive(Debug, Default, Serialize, Deserialize)]
struct UnitDocument {
    unit: String,
    #[serde(default)]
    data: DataBag,
}

/// Store kept as JSON documents in a directory on the shared volume
///
/// Each unit owns `units/<unit>.json`; the leader owns `app.json`. Every
/// document has exactly one writer and is replaced by rename, so readers
/// never see a partial write.
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
    unit: String,
    role: Arc<dyn RoleProvider>,
}

impl FileStore {
    /// Open the store under `root` and register `unit_name` in it
    pub fn open(
        root: impl AsRef<Path>,
        unit_name: impl Into<String>,
        role: Arc<dyn RoleProvider>,
    ) -> Result<Self> {
        let store = Self::attach(root, unit_name, role);
        if read_optional(&store.unit_path(&store.unit))?.is_none() {
            store.write_unit(&UnitDocument {
                unit: store.unit.clone(),
                data: DataBag::new(),
            })?;
        }
        Ok(store)
    }

    /// Handle on the store under `root` that does not register `unit_name`.
    ///
    /// For read-only callers: a unit that is only looking must not show up
    /// in [`CoordinationStore::get_all_units`].
    pub fn attach(
        root: impl AsRef<Path>,
        unit_name: impl Into<String>,
        role: Arc<dyn RoleProvider>,
    ) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            unit: unit_name.into(),
            role,
        }
    }

    /// Remove the local unit's document (unit departed)
    pub fn depart(&self) -> Result<()> {
        crate::common::utils::remove_if_exists(&self.unit_path(&self.unit))?;
        Ok(())
    }

    fn unit_path(&self, unit_name: &str) -> PathBuf {
        self.root
            .join(UNITS_DIR)
            .join(format!("{}.json", sanitize_unit_name(unit_name)))
    }

    fn read_unit(&self, unit_name: &str) -> Result<Option<UnitDocument>> {
        match read_optional(&self.unit_path(unit_name))? {
            Some(body) => Ok(Some(serde_json::from_str(&body).map_err(|e| {
                Error::Store(format!("unit document for {} is corrupt: {}", unit_name, e))
            })?)),
            None => Ok(None),
        }
    }

    fn write_unit(&self, doc: &UnitDocument) -> Result<()> {
        fs::create_dir_all(self.root.join(UNITS_DIR))?;
        write_atomic(&self.unit_path(&doc.unit), &serde_json::to_vec_pretty(doc)?)
    }

    fn read_app(&self) -> Result<DataBag> {
        match read_optional(&self.root.join(APP_DOC))? {
            Some(body) => serde_json::from_str(&body)
                .map_err(|e| Error::Store(format!("application document is corrupt: {}", e))),
            None => Ok(DataBag::new()),
        }
    }

    fn write_app(&self, bag: &DataBag) -> Result<()> {
        write_atomic(&self.root.join(APP_DOC), &serde_json::to_vec_pretty(bag)?)
    }

    fn ensure_leader(&self) -> Result<()> {
        if self.role.is_leader() {
            Ok(())
        } else {
            Err(Error::leader_only("set_application_data"))
        }
    }
}

impl CoordinationStore for FileStore {
    fn local_unit(&self) -> &str {
        &self.unit
    }

    fn set_unit_data(&self, key: &str, value: &str) -> Result<()> {
        let mut bag = DataBag::new();
        bag.insert(key.to_string(), value.to_string());
        self.set_unit_bag(&bag)
    }

    fn get_unit_data(&self, unit_name: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .read_unit(unit_name)?
            .and_then(|doc| doc.data.get(key).cloned()))
    }

    fn get_all_units(&self) -> Result<Vec<String>> {
        let mut units = Vec::new();
        let dir = self.root.join(UNITS_DIR);
        if !dir.is_dir() {
            return Ok(units);
        }
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(body) = read_optional(&path)? else {
                continue;
            };
            match serde_json::from_str::<UnitDocument>(&body) {
                Ok(doc) => units.push(doc.unit),
                Err(e) => tracing::warn!("Skipping unreadable unit document {:?}: {}", path, e),
            }
        }
        units.sort();
        Ok(units)
    }

    fn set_application_data(&self, key: &str, value: &str) -> Result<()> {
        let mut bag = DataBag::new();
        bag.insert(key.to_string(), value.to_string());
        self.set_application_bag(&bag)
    }

    fn get_application_data(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_app()?.get(key).cloned())
    }

    fn set_unit_bag(&self, bag: &DataBag) -> Result<()> {
        let mut doc = self.read_unit(&self.unit)?.unwrap_or_else(|| UnitDocument {
            unit: self.unit.clone(),
            data: DataBag::new(),
        });
        doc.data
            .extend(bag.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_unit(&doc)
    }

    fn set_application_bag(&self, bag: &DataBag) -> Result<()> {
        self.ensure_leader()?;
        let mut app = self.read_app()?;
        app.extend(bag.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_app(&app)
    }

    fn get_application_bag(&self, keys: &[&str]) -> Result<DataBag> {
        let app = self.read_app()?;
        Ok(keys
            .iter()
            .filter_map(|k| app.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect())
    }

    fn get_unit_bag(&self, unit_name: &str, keys: &[&str]) -> Result<DataBag> {
        let data = self
            .read_unit(unit_name)?
            .map(|doc| doc.data)
            .unwrap_or_default();
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| ((*k).to_string(), v.clone())))
            .collect())
    }
}
