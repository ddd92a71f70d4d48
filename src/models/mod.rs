//! Entities the engine reads and writes, and the in-memory metadata store that stands in
//! for the relational schema.

pub mod policy;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use policy::{Policy, PolicyKind};
pub use store::MetaStore;

/// Group capability flags and the policies its members may use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: u64,
    pub name: String,
    /// First entry is the default policy for new uploads.
    pub policy_ids: Vec<u64>,
    /// Bytes.
    pub max_storage: u64,
    #[serde(default)]
    pub archive_download: bool,
    #[serde(default)]
    pub archive_task: bool,
    /// Archive handles are consumed on first download.
    #[serde(default)]
    pub one_time_download: bool,
    #[serde(default = "Group::default_source_batch")]
    pub source_batch: usize,
}

impl Group {
    fn default_source_batch() -> usize { 10 }

    pub fn new(id: u64, name: &str, policy_id: u64, max_storage: u64) -> Self {
        Self {
            id,
            name: name.to_string(),
            policy_ids: vec![policy_id],
            max_storage,
            archive_download: true,
            archive_task: true,
            one_time_download: false,
            source_batch: Self::default_source_batch(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub email: String,
    pub nick: String,
    pub group: Group,
}

impl User {
    pub fn policy_id(&self) -> Option<u64> { self.group.policy_ids.first().copied() }

    /// Nodes acting as a slave run sessions on behalf of no real user.
    pub fn anonymous() -> Self {
        Self { id: 0, email: String::new(), nick: "anonymous".into(), group: Group::new(0, "anonymous", 0, 0) }
    }

    pub fn is_anonymous(&self) -> bool { self.id == 0 }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: u64,
    pub name: String,
    pub parent_id: Option<u64>,
    pub owner_id: u64,
    /// Pins a storage policy for uploads into this subtree.
    pub policy_id: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File {
    pub id: u64,
    pub name: String,
    /// Physical path within the policy's backend.
    pub source_name: String,
    pub user_id: u64,
    pub size: u64,
    pub pic_info: String,
    pub folder_id: u64,
    pub policy_id: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind { File, Dir }

/// Listing entry returned to callers; never carries the physical path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Object {
    pub id: u64,
    pub name: String,
    pub path: String,
    pub pic: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub kind: ObjectKind,
    pub date: DateTime<Utc>,
}

impl Object {
    pub fn from_folder(f: &Folder, path: &str) -> Self {
        Self { id: f.id, name: f.name.clone(), path: path.to_string(), pic: String::new(), size: 0, kind: ObjectKind::Dir, date: f.created_at }
    }

    pub fn from_file(f: &File, path: &str) -> Self {
        Self { id: f.id, name: f.name.clone(), path: path.to_string(), pic: f.pic_info.clone(), size: f.size, kind: ObjectKind::File, date: f.created_at }
    }
}
