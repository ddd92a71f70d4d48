//! In-memory metadata store: users, groups, policies, folders and files.
//!
//! Every method takes the table lock for its whole duration, so each call is atomic with
//! respect to other sessions. Name uniqueness is enforced per parent folder.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::RwLock;

use super::{File, Folder, Group, Policy, User};
use crate::error::{AppError, AppResult};

#[derive(Default)]
struct Tables {
    groups: BTreeMap<u64, Group>,
    users: BTreeMap<u64, User>,
    policies: BTreeMap<u64, Policy>,
    folders: BTreeMap<u64, Folder>,
    files: BTreeMap<u64, File>,
}

impl Tables {
    fn name_taken(&self, parent: u64, name: &str) -> bool {
        self.folders.values().any(|f| f.parent_id == Some(parent) && f.name == name)
            || self.files.values().any(|f| f.folder_id == parent && f.name == name)
    }

    fn descendants(&self, roots: &[u64], uid: u64, include_self: bool) -> Vec<Folder> {
        let mut out = Vec::new();
        let mut queue: Vec<u64> = roots.to_vec();
        let mut seen = HashSet::new();
        if include_self {
            out.extend(roots.iter().filter_map(|id| self.folders.get(id)).filter(|f| f.owner_id == uid).cloned());
        }
        while let Some(id) = queue.pop() {
            if !seen.insert(id) { continue; }
            for f in self.folders.values().filter(|f| f.parent_id == Some(id) && f.owner_id == uid) {
                out.push(f.clone());
                queue.push(f.id);
            }
        }
        out
    }
}

pub struct MetaStore {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
}

fn not_found(what: &str) -> AppError { AppError::not_found("object_not_found", format!("{} not found", what)) }
fn exists(name: &str) -> AppError { AppError::object_exist("object_exist", format!("an object named '{}' already exists", name)) }

impl Default for MetaStore {
    fn default() -> Self { Self::new() }
}

impl MetaStore {
    pub fn new() -> Self { Self { tables: RwLock::new(Tables::default()), next_id: AtomicU64::new(1) } }

    fn id(&self) -> u64 { self.next_id.fetch_add(1, Ordering::Relaxed) }

    // --- groups, users, policies ---

    pub fn insert_group(&self, g: Group) { self.tables.write().groups.insert(g.id, g); }

    pub fn insert_policy(&self, p: Policy) { self.tables.write().policies.insert(p.id, p); }

    pub fn get_policy(&self, id: u64) -> AppResult<Policy> {
        self.tables.read().policies.get(&id).cloned().ok_or_else(|| not_found("storage policy"))
    }

    /// Insert a user and create its root folder.
    pub fn insert_user(&self, u: User) -> AppResult<Folder> {
        let root_id = self.id();
        let mut t = self.tables.write();
        if t.users.contains_key(&u.id) { return Err(exists(&u.email)); }
        let now = Utc::now();
        let root = Folder { id: root_id, name: "/".into(), parent_id: None, owner_id: u.id, policy_id: None, created_at: now, updated_at: now };
        t.groups.entry(u.group.id).or_insert_with(|| u.group.clone());
        t.users.insert(u.id, u);
        t.folders.insert(root.id, root.clone());
        Ok(root)
    }

    pub fn get_user(&self, id: u64) -> AppResult<User> {
        self.tables.read().users.get(&id).cloned().ok_or_else(|| not_found("user"))
    }

    // --- folders ---

    pub fn root_folder(&self, uid: u64) -> AppResult<Folder> {
        self.tables.read().folders.values().find(|f| f.parent_id.is_none() && f.owner_id == uid).cloned().ok_or_else(|| not_found("root folder"))
    }

    pub fn get_folder(&self, id: u64, uid: u64) -> AppResult<Folder> {
        self.tables.read().folders.get(&id).filter(|f| f.owner_id == uid).cloned().ok_or_else(|| not_found("folder"))
    }

    pub fn child_folder(&self, parent: u64, name: &str) -> Option<Folder> {
        self.tables.read().folders.values().find(|f| f.parent_id == Some(parent) && f.name == name).cloned()
    }

    pub fn child_folders(&self, parent: u64) -> Vec<Folder> {
        self.tables.read().folders.values().filter(|f| f.parent_id == Some(parent)).cloned().collect()
    }

    pub fn create_folder(&self, name: &str, parent: u64, owner: u64, policy_id: Option<u64>) -> AppResult<Folder> {
        let id = self.id();
        let mut t = self.tables.write();
        if !t.folders.contains_key(&parent) { return Err(not_found("parent folder")); }
        if t.name_taken(parent, name) { return Err(exists(name)); }
        let now = Utc::now();
        let f = Folder { id, name: name.to_string(), parent_id: Some(parent), owner_id: owner, policy_id, created_at: now, updated_at: now };
        t.folders.insert(id, f.clone());
        Ok(f)
    }

    pub fn set_folder_policy(&self, id: u64, policy_id: Option<u64>) -> AppResult<()> {
        let mut t = self.tables.write();
        let f = t.folders.get_mut(&id).ok_or_else(|| not_found("folder"))?;
        f.policy_id = policy_id;
        Ok(())
    }

    pub fn folders_by_ids(&self, ids: &[u64], uid: u64) -> Vec<Folder> {
        let t = self.tables.read();
        ids.iter().filter_map(|id| t.folders.get(id)).filter(|f| f.owner_id == uid).cloned().collect()
    }

    /// All folders under `roots` (optionally including the roots themselves).
    pub fn recursive_child_folders(&self, roots: &[u64], uid: u64, include_self: bool) -> Vec<Folder> {
        self.tables.read().descendants(roots, uid, include_self)
    }

    /// Virtual path of a folder, e.g. `/docs/work`.
    pub fn folder_path(&self, id: u64) -> AppResult<String> {
        let t = self.tables.read();
        let mut parts = Vec::new();
        let mut cur = t.folders.get(&id).ok_or_else(|| not_found("folder"))?;
        while let Some(pid) = cur.parent_id {
            parts.push(cur.name.clone());
            cur = t.folders.get(&pid).ok_or_else(|| not_found("folder"))?;
        }
        parts.reverse();
        Ok(format!("/{}", parts.join("/")))
    }

    /// Nearest pinned policy walking up from `id`.
    pub fn effective_policy(&self, id: u64) -> Option<u64> {
        let t = self.tables.read();
        let mut cur = t.folders.get(&id);
        while let Some(f) = cur {
            if f.policy_id.is_some() { return f.policy_id; }
            cur = f.parent_id.and_then(|p| t.folders.get(&p));
        }
        None
    }

    pub fn rename_folder(&self, id: u64, uid: u64, new_name: &str) -> AppResult<()> {
        let mut t = self.tables.write();
        let parent = t.folders.get(&id).filter(|f| f.owner_id == uid).ok_or_else(|| not_found("folder"))?.parent_id;
        let parent = parent.ok_or_else(|| AppError::policy_not_allowed("root_immutable", "the root folder cannot be renamed"))?;
        if t.name_taken(parent, new_name) { return Err(exists(new_name)); }
        if let Some(f) = t.folders.get_mut(&id) {
            f.name = new_name.to_string();
            f.updated_at = Utc::now();
        }
        Ok(())
    }

    /// Re-parent folders. A folder cannot be moved into its own subtree.
    pub fn move_folders(&self, ids: &[u64], dst: u64, uid: u64) -> AppResult<()> {
        let mut t = self.tables.write();
        let subtree: HashSet<u64> = t.descendants(ids, uid, true).into_iter().map(|f| f.id).collect();
        if subtree.contains(&dst) {
            return Err(AppError::policy_not_allowed("move_into_self", "cannot move a folder into itself"));
        }
        for id in ids {
            let name = t.folders.get(id).filter(|f| f.owner_id == uid).map(|f| f.name.clone()).ok_or_else(|| not_found("folder"))?;
            if t.name_taken(dst, &name) { return Err(exists(&name)); }
            if let Some(f) = t.folders.get_mut(id) { f.parent_id = Some(dst); f.updated_at = Utc::now(); }
        }
        Ok(())
    }

    pub fn delete_folders(&self, ids: &[u64]) {
        let mut t = self.tables.write();
        for id in ids { t.folders.remove(id); }
    }

    // --- files ---

    pub fn get_file(&self, id: u64) -> AppResult<File> {
        self.tables.read().files.get(&id).cloned().ok_or_else(|| not_found("file"))
    }

    pub fn child_file(&self, folder: u64, name: &str) -> Option<File> {
        self.tables.read().files.values().find(|f| f.folder_id == folder && f.name == name).cloned()
    }

    pub fn child_files(&self, folder: u64) -> Vec<File> {
        self.tables.read().files.values().filter(|f| f.folder_id == folder).cloned().collect()
    }

    pub fn files_by_ids(&self, ids: &[u64], uid: u64) -> Vec<File> {
        let t = self.tables.read();
        ids.iter().filter_map(|id| t.files.get(id)).filter(|f| f.user_id == uid).cloned().collect()
    }

    pub fn files_in_folders(&self, folder_ids: &[u64]) -> Vec<File> {
        let set: HashSet<u64> = folder_ids.iter().copied().collect();
        self.tables.read().files.values().filter(|f| set.contains(&f.folder_id)).cloned().collect()
    }

    /// Insert a file record; the id and timestamps are assigned here.
    pub fn create_file(&self, mut f: File) -> AppResult<File> {
        let id = self.id();
        let mut t = self.tables.write();
        if !t.folders.contains_key(&f.folder_id) { return Err(not_found("parent folder")); }
        if t.name_taken(f.folder_id, &f.name) { return Err(exists(&f.name)); }
        let now = Utc::now();
        f.id = id;
        f.created_at = now;
        f.updated_at = now;
        t.files.insert(id, f.clone());
        Ok(f)
    }

    pub fn update_file<F: FnOnce(&mut File)>(&self, id: u64, apply: F) -> AppResult<File> {
        let mut t = self.tables.write();
        let f = t.files.get_mut(&id).ok_or_else(|| not_found("file"))?;
        apply(f);
        f.updated_at = Utc::now();
        Ok(f.clone())
    }

    pub fn rename_file(&self, id: u64, uid: u64, new_name: &str) -> AppResult<()> {
        let mut t = self.tables.write();
        let folder = t.files.get(&id).filter(|f| f.user_id == uid).map(|f| f.folder_id).ok_or_else(|| not_found("file"))?;
        if t.name_taken(folder, new_name) { return Err(exists(new_name)); }
        if let Some(f) = t.files.get_mut(&id) { f.name = new_name.to_string(); f.updated_at = Utc::now(); }
        Ok(())
    }

    pub fn move_files(&self, ids: &[u64], dst: u64, uid: u64) -> AppResult<()> {
        let mut t = self.tables.write();
        if !t.folders.contains_key(&dst) { return Err(not_found("destination folder")); }
        for id in ids {
            let name = t.files.get(id).filter(|f| f.user_id == uid).map(|f| f.name.clone()).ok_or_else(|| not_found("file"))?;
            if t.name_taken(dst, &name) { return Err(exists(&name)); }
            if let Some(f) = t.files.get_mut(id) { f.folder_id = dst; f.updated_at = Utc::now(); }
        }
        Ok(())
    }

    /// Copy file records into `dst`. Copies share the physical object (soft links).
    /// Returns the total size copied.
    pub fn copy_files(&self, ids: &[u64], dst: u64, uid: u64) -> AppResult<u64> {
        let sources = self.files_by_ids(ids, uid);
        let mut total = 0;
        for src in sources {
            let mut f = src.clone();
            f.folder_id = dst;
            total += f.size;
            self.create_file(f)?;
        }
        Ok(total)
    }

    /// Recursively copy a folder into `dst`. Returns the total size copied.
    pub fn copy_folder(&self, id: u64, dst: u64, uid: u64) -> AppResult<u64> {
        let src = self.get_folder(id, uid)?;
        let created = self.create_folder(&src.name, dst, uid, src.policy_id)?;
        let file_ids: Vec<u64> = self.child_files(id).into_iter().map(|f| f.id).collect();
        let mut total = self.copy_files(&file_ids, created.id, uid)?;
        for child in self.child_folders(id) {
            total += self.copy_folder(child.id, created.id, uid)?;
        }
        Ok(total)
    }

    pub fn delete_files(&self, ids: &[u64]) {
        let mut t = self.tables.write();
        for id in ids { t.files.remove(id); }
    }

    /// Of `files`, those whose physical object is referenced by no record outside `files`.
    pub fn without_soft_links(&self, files: &[File]) -> Vec<File> {
        let t = self.tables.read();
        let ids: HashSet<u64> = files.iter().map(|f| f.id).collect();
        files
            .iter()
            .filter(|f| !t.files.values().any(|o| !ids.contains(&o.id) && o.policy_id == f.policy_id && o.source_name == f.source_name))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod store_tests;
