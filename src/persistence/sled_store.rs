use serde::Serialize;
use serde::de::DeserializeOwned;
use sled::{Db, Tree};

use crate::presence::model::{Location, User};
use crate::protocol::payload::Waypoint;
use crate::utils::error::StoreError;

const USERS: &str = "users";
const LOCATIONS: &str = "locations";
const REGIONS: &str = "regions";
const REGIONS_KEY: &[u8] = b"all";

/// JSON snapshots of users, locations and the region list, one sled tree
/// each, keyed by the record's normalized key.
#[derive(Clone)]
pub struct Persistence {
    db: Db,
}

impl Persistence {
    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::open(path)?,
        })
    }

    /// A store that lives only as long as this handle.
    pub fn temporary() -> Result<Self, StoreError> {
        Ok(Self {
            db: sled::Config::new().temporary(true).open()?,
        })
    }

    fn put<T: Serialize>(&self, tree: &str, key: &[u8], value: &T) -> Result<(), StoreError> {
        let tree: Tree = self.db.open_tree(tree)?;
        tree.insert(key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, tree: &str, key: &[u8]) -> Result<Option<T>, StoreError> {
        let tree: Tree = self.db.open_tree(tree)?;
        match tree.get(key)? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn save_user(&self, user: &User) -> Result<(), StoreError> {
        self.put(USERS, user.key.as_bytes(), user)
    }

    pub fn load_user(&self, key: &str) -> Result<Option<User>, StoreError> {
        self.get(USERS, key.as_bytes())
    }

    pub fn save_location(&self, location: &Location) -> Result<(), StoreError> {
        self.put(LOCATIONS, location.key.as_bytes(), location)
    }

    pub fn load_location(&self, key: &str) -> Result<Option<Location>, StoreError> {
        self.get(LOCATIONS, key.as_bytes())
    }

    pub fn save_regions(&self, regions: &[Waypoint]) -> Result<(), StoreError> {
        self.put(REGIONS, REGIONS_KEY, &regions)
    }

    pub fn load_regions(&self) -> Result<Option<Vec<Waypoint>>, StoreError> {
        self.get(REGIONS, REGIONS_KEY)
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for Persistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Persistence")
            .field("db", &"sled::Db")
            .finish()
    }
}
