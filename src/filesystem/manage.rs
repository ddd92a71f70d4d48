//! Metadata operations: listing, folders, rename, move, copy and batch delete.
//!
//! Within one policy these only touch records. When a file has to land on a different
//! policy its bytes are streamed from the source driver into the destination driver.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::validator::{check_name, is_extension_allowed, normalize_name};
use super::FileSystem;
use crate::driver::PutOptions;
use crate::error::{AppError, AppResult};
use crate::models::{File, Folder, Object};
use crate::util::{join, split_dir, split_path};

/// Result of a batch delete. A non-empty `failed` is a partial success, not an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeleteOutcome {
    /// File record ids removed.
    pub succeeded: Vec<u64>,
    /// File record ids kept because their object could not be removed.
    pub failed: Vec<u64>,
    /// Last backend error seen, if any.
    pub error: Option<AppError>,
}

impl DeleteOutcome {
    pub fn is_fully_successful(&self) -> bool { self.failed.is_empty() }
}

impl FileSystem {
    /// Children of a virtual folder: folders first, then files, each sorted by name.
    pub fn list(&self, path: &str) -> AppResult<Vec<Object>> {
        let folder = self.folder_by_path(path)?;
        let mut dirs = self.services.db.child_folders(folder.id);
        let mut files = self.services.db.child_files(folder.id);
        dirs.sort_by(|a, b| a.name.cmp(&b.name));
        files.sort_by(|a, b| a.name.cmp(&b.name));
        let mut out: Vec<Object> = dirs.iter().map(|d| Object::from_folder(d, path)).collect();
        out.extend(files.iter().map(|f| Object::from_file(f, path)));
        Ok(out)
    }

    /// Create the folder at `path`, creating missing parents. The last segment must be new.
    pub fn create_directory(&self, path: &str) -> AppResult<Folder> {
        if split_path(path).len() <= 1 {
            return Err(AppError::object_exist("object_exist", "the root folder always exists"));
        }
        let (dir, name) = split_dir(path);
        let name = normalize_name(&name);
        check_name(&name)?;
        let parent = self.ensure_directory(&dir)?;
        self.services.db.create_folder(&name, parent.id, self.user.id, None)
    }

    /// Folder at `path`, created along with any missing parents.
    pub fn ensure_directory(&self, path: &str) -> AppResult<Folder> {
        let mut cur = self.root_folder()?;
        for name in split_path(path).into_iter().skip(1) {
            if let Some(f) = self.services.db.child_folder(cur.id, &name) {
                cur = f;
                continue;
            }
            check_name(&name)?;
            cur = match self.services.db.create_folder(&name, cur.id, self.user.id, None) {
                Ok(f) => f,
                // Lost a race with a concurrent session creating the same folder.
                Err(AppError::ObjectExist { .. }) => self
                    .services
                    .db
                    .child_folder(cur.id, &name)
                    .ok_or_else(|| AppError::create_folder_failed("create_folder_failed", format!("a file named '{}' is in the way", name)))?,
                Err(e) => return Err(e),
            };
        }
        Ok(cur)
    }

    /// Rename exactly one folder or file.
    pub fn rename(&self, dir_ids: &[u64], file_ids: &[u64], new_name: &str) -> AppResult<()> {
        let new_name = normalize_name(new_name);
        check_name(&new_name)?;
        match (dir_ids, file_ids) {
            ([id], []) => self.services.db.rename_folder(*id, self.user.id, &new_name),
            ([], [id]) => {
                let file = self.owned_file(*id)?;
                let policy = self.services.db.get_policy(file.policy_id)?;
                if !is_extension_allowed(&new_name, &policy.allowed_extensions) {
                    return Err(AppError::policy_not_allowed("file_type_not_allowed", format!("'{}' has a disallowed extension", new_name)));
                }
                self.services.db.rename_file(file.id, self.user.id, &new_name)
            }
            _ => Err(AppError::policy_not_allowed("rename_one_object", "exactly one object can be renamed at a time")),
        }
    }

    /// Stream a file's bytes onto `dst_policy` under `virtual_dir`. Returns the new physical path.
    async fn relocate_bytes(&self, file: &File, dst_policy: u64, virtual_dir: &str) -> AppResult<String> {
        let (_, src_driver) = self.driver_for(file.policy_id)?;
        let (policy, dst_driver) = self.driver_for(dst_policy)?;
        let save_path = join(&policy.generate_path(self.user.id, virtual_dir), &policy.generate_file_name(self.user.id, &file.name))
            .trim_start_matches('/')
            .to_string();
        let stream = src_driver.get(&file.source_name).await?;
        dst_driver.put(stream, &save_path, file.size, &PutOptions { disable_overwrite: true, mime_type: None }).await?;
        tracing::debug!(file = file.id, from = file.policy_id, to = dst_policy, path = %save_path, "bytes_relocated");
        Ok(save_path)
    }

    fn ensure_free_name(&self, folder: u64, name: &str) -> AppResult<()> {
        if self.services.db.child_file(folder, name).is_some() || self.services.db.child_folder(folder, name).is_some() {
            return Err(AppError::object_exist("object_exist", format!("an object named '{}' already exists", name)));
        }
        Ok(())
    }

    /// Move folders and files under `dst_path`.
    pub async fn move_objects(&mut self, dir_ids: &[u64], file_ids: &[u64], dst_path: &str) -> AppResult<()> {
        let dst = self.folder_by_path(dst_path)?;
        self.set_targets(dir_ids, file_ids);
        let db = self.services.db.clone();

        let dirs: Vec<u64> = self.dir_target.iter().map(|d| d.id).collect();
        if !dirs.is_empty() {
            db.move_folders(&dirs, dst.id, self.user.id)?;
        }

        let dst_policy = self.policy_for_folder(dst.id)?;
        let (same, cross): (Vec<File>, Vec<File>) = self.file_target.iter().cloned().partition(|f| f.policy_id == dst_policy);
        let same_ids: Vec<u64> = same.iter().map(|f| f.id).collect();
        if !same_ids.is_empty() {
            db.move_files(&same_ids, dst.id, self.user.id)?;
        }

        for file in cross {
            self.ensure_free_name(dst.id, &file.name)?;
            let save_path = self.relocate_bytes(&file, dst_policy, dst_path).await?;
            let shared = db.without_soft_links(std::slice::from_ref(&file)).is_empty();
            db.update_file(file.id, |f| {
                f.folder_id = dst.id;
                f.policy_id = dst_policy;
                f.source_name = save_path;
            })?;
            if shared { continue; }
            let (_, src_driver) = self.driver_for(file.policy_id)?;
            let report = src_driver.delete(std::slice::from_ref(&file.source_name)).await;
            if let Some(e) = report.error {
                tracing::warn!(file = file.id, path = %file.source_name, error = %e, "move_orphaned_source");
            }
        }
        Ok(())
    }

    /// Copy folders and files under `dst_path`. Copies within a policy share their bytes;
    /// the copied size is charged to the user without a limit check.
    pub async fn copy(&mut self, dir_ids: &[u64], file_ids: &[u64], dst_path: &str) -> AppResult<()> {
        let dst = self.folder_by_path(dst_path)?;
        self.set_targets(dir_ids, file_ids);
        let db = self.services.db.clone();
        let uid = self.user.id;

        for d in &self.dir_target {
            if db.recursive_child_folders(&[d.id], uid, true).iter().any(|f| f.id == dst.id) {
                return Err(AppError::policy_not_allowed("copy_into_self", "cannot copy a folder into itself"));
            }
        }

        let dst_policy = self.policy_for_folder(dst.id)?;
        let (same, cross): (Vec<File>, Vec<File>) = self.file_target.iter().cloned().partition(|f| f.policy_id == dst_policy);
        let mut total = 0;
        let same_ids: Vec<u64> = same.iter().map(|f| f.id).collect();
        if !same_ids.is_empty() {
            total += db.copy_files(&same_ids, dst.id, uid)?;
        }
        for file in cross {
            self.ensure_free_name(dst.id, &file.name)?;
            let save_path = self.relocate_bytes(&file, dst_policy, dst_path).await?;
            db.create_file(File { folder_id: dst.id, policy_id: dst_policy, source_name: save_path, ..file.clone() })?;
            total += file.size;
        }
        let dir_ids: Vec<u64> = self.dir_target.iter().map(|d| d.id).collect();
        for id in dir_ids {
            total += db.copy_folder(id, dst.id, uid)?;
        }

        self.services.ledger.increase_unchecked(uid, total)
    }

    /// Delete folders (recursively) and files. Records whose object could not be removed
    /// are kept and reported in `failed`, unless `force` drops them anyway.
    pub async fn delete(&mut self, dir_ids: &[u64], file_ids: &[u64], force: bool) -> AppResult<DeleteOutcome> {
        self.set_targets(dir_ids, file_ids);
        if self.dir_target.iter().any(|d| d.parent_id.is_none()) {
            return Err(AppError::policy_not_allowed("root_immutable", "the root folder cannot be deleted"));
        }
        let db = self.services.db.clone();
        let uid = self.user.id;

        let roots: Vec<u64> = self.dir_target.iter().map(|d| d.id).collect();
        let folder_ids: Vec<u64> = db.recursive_child_folders(&roots, uid, true).into_iter().map(|f| f.id).collect();
        let mut files = db.files_in_folders(&folder_ids);
        let mut seen: HashSet<u64> = files.iter().map(|f| f.id).collect();
        files.extend(self.file_target.iter().filter(|f| seen.insert(f.id)).cloned());

        let mut by_policy: BTreeMap<u64, BTreeSet<String>> = BTreeMap::new();
        for f in db.without_soft_links(&files) {
            by_policy.entry(f.policy_id).or_default().insert(f.source_name);
        }

        let mut failed_sources: HashSet<(u64, String)> = HashSet::new();
        let mut last_error = None;
        for (policy_id, sources) in by_policy {
            let paths: Vec<String> = sources.into_iter().collect();
            match self.driver_for(policy_id) {
                Ok((_, driver)) => {
                    let report = driver.delete(&paths).await;
                    failed_sources.extend(report.failed.into_iter().map(|p| (policy_id, p)));
                    if report.error.is_some() { last_error = report.error; }
                }
                Err(e) => {
                    failed_sources.extend(paths.into_iter().map(|p| (policy_id, p)));
                    last_error = Some(e);
                }
            }
        }

        let (ok, bad): (Vec<File>, Vec<File>) = files.into_iter().partition(|f| force || !failed_sources.contains(&(f.policy_id, f.source_name.clone())));
        let ok_ids: Vec<u64> = ok.iter().map(|f| f.id).collect();
        db.delete_files(&ok_ids);
        self.services.ledger.deduct(uid, ok.iter().map(|f| f.size).sum())?;
        if bad.is_empty() {
            db.delete_folders(&folder_ids);
        }

        let outcome = DeleteOutcome { succeeded: ok_ids, failed: bad.iter().map(|f| f.id).collect(), error: last_error };
        if outcome.is_fully_successful() {
            tracing::info!(uid, files = outcome.succeeded.len(), folders = folder_ids.len(), "delete_complete");
        } else {
            tracing::warn!(uid, succeeded = outcome.succeeded.len(), failed = outcome.failed.len(), "delete_not_fully_successful");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
#[path = "manage_tests.rs"]
mod manage_tests;
