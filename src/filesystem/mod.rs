//! The per-operation filesystem session.
//!
//! A [`FileSystem`] binds one user to a storage policy and its driver, a working selection
//! of folders and files, and a hook registry. It is created for a single request and is
//! never shared between concurrent operations; everything it needs from the process comes
//! through [`Services`].

pub mod archive;
pub mod file;
pub mod hooks;
pub mod manage;
pub mod upload;
pub mod validator;

use std::sync::Arc;

use crate::driver::Driver;
use crate::error::{AppError, AppResult};
use crate::models::{File, Folder, Policy, PolicyKind, User};
use crate::services::Services;
use crate::util::split_path;

pub use file::UploadSession;
pub use hooks::{Hook, HookRegistry, Stage};
pub use manage::DeleteOutcome;
pub use upload::{FileHeader, UploadContext, UploadOptions, Uploaded};

pub struct FileSystem {
    pub user: User,
    pub policy: Policy,
    driver: Arc<dyn Driver>,
    pub root: Option<Folder>,
    pub dir_target: Vec<Folder>,
    pub file_target: Vec<File>,
    hooks: HookRegistry,
    services: Services,
}

impl FileSystem {
    /// Session for `user` on its group's default policy.
    pub fn new(services: &Services, user: User) -> AppResult<Self> {
        let policy_id = user
            .policy_id()
            .ok_or_else(|| AppError::policy_not_allowed("no_policy", format!("group '{}' has no storage policy", user.group.name)))?;
        let policy = services.db.get_policy(policy_id)?;
        let driver = services.resolve_driver(&policy)?;
        let root = services.db.root_folder(user.id).ok();
        Ok(Self { user, policy, driver, root, dir_target: vec![], file_target: vec![], hooks: HookRegistry::default(), services: services.clone() })
    }

    /// Session on a slave node: no user, and bytes always land on local disk.
    pub fn new_for_slave(services: &Services, policy: Policy) -> AppResult<Self> {
        if policy.kind != PolicyKind::Local {
            return Err(AppError::internal_setting("slave_policy", "slave sessions only store on local disk"));
        }
        let driver = services.resolve_driver(&policy)?;
        Ok(Self {
            user: User::anonymous(),
            policy,
            driver,
            root: None,
            dir_target: vec![],
            file_target: vec![],
            hooks: HookRegistry::default(),
            services: services.clone(),
        })
    }

    pub fn services(&self) -> &Services { &self.services }

    pub fn driver(&self) -> &Arc<dyn Driver> { &self.driver }

    /// Rebind the session to another policy, resolving its driver.
    pub fn switch_policy(&mut self, policy_id: u64) -> AppResult<()> {
        if policy_id == self.policy.id { return Ok(()); }
        let policy = self.services.db.get_policy(policy_id)?;
        self.driver = self.services.resolve_driver(&policy)?;
        self.policy = policy;
        Ok(())
    }

    /// Policy and driver for `policy_id`, reusing the session's own when it matches.
    pub fn driver_for(&self, policy_id: u64) -> AppResult<(Policy, Arc<dyn Driver>)> {
        if policy_id == self.policy.id { return Ok((self.policy.clone(), self.driver.clone())); }
        let policy = self.services.db.get_policy(policy_id)?;
        let driver = self.services.resolve_driver(&policy)?;
        Ok((policy, driver))
    }

    pub fn hooks(&self) -> &HookRegistry { &self.hooks }

    pub fn use_hook<H: Hook + 'static>(&mut self, stage: Stage, hook: H) { self.hooks.add(stage, Arc::new(hook)); }

    pub fn clean_hooks(&mut self) { self.hooks.clear(); }

    /// Load owned folders and files into the working selection.
    pub fn set_targets(&mut self, dir_ids: &[u64], file_ids: &[u64]) {
        self.dir_target = self.services.db.folders_by_ids(dir_ids, self.user.id);
        self.file_target = self.services.db.files_by_ids(file_ids, self.user.id);
    }

    /// Drop the selection and hooks so the session can run another operation.
    pub fn reset(&mut self) {
        self.dir_target.clear();
        self.file_target.clear();
        self.hooks.clear();
    }

    fn root_folder(&self) -> AppResult<Folder> {
        self.root.clone().ok_or_else(|| AppError::not_found("root_not_found", "session has no root folder"))
    }

    /// Folder at a virtual path, e.g. `/docs/work`.
    pub fn folder_by_path(&self, path: &str) -> AppResult<Folder> {
        let mut cur = self.root_folder()?;
        for name in split_path(path).into_iter().skip(1) {
            cur = self
                .services
                .db
                .child_folder(cur.id, &name)
                .ok_or_else(|| AppError::not_found("folder_not_found", format!("folder '{}' does not exist", path)))?;
        }
        Ok(cur)
    }

    pub fn is_path_exist(&self, path: &str) -> Option<Folder> { self.folder_by_path(path).ok() }

    /// File at a virtual path, e.g. `/docs/a.txt`.
    pub fn file_by_path(&self, path: &str) -> AppResult<File> {
        let (dir, name) = crate::util::split_dir(path);
        let folder = self.folder_by_path(&dir)?;
        self.services.db.child_file(folder.id, &name).ok_or_else(|| AppError::not_found("file_not_found", format!("file '{}' does not exist", path)))
    }

    /// Policy new uploads into `path` should use: the nearest pinned folder on the deepest
    /// existing prefix of the path, otherwise the group default.
    pub fn policy_for_path(&self, path: &str) -> AppResult<u64> {
        let mut cur = self.root_folder()?;
        for name in split_path(path).into_iter().skip(1) {
            match self.services.db.child_folder(cur.id, &name) {
                Some(f) => cur = f,
                None => break,
            }
        }
        self.policy_for_folder(cur.id)
    }

    pub fn policy_for_folder(&self, folder_id: u64) -> AppResult<u64> {
        match self.services.db.effective_policy(folder_id).or_else(|| self.user.policy_id()) {
            Some(id) => Ok(id),
            None => Err(AppError::policy_not_allowed("no_policy", "no storage policy applies to this folder")),
        }
    }

    /// Owned file by id.
    pub fn owned_file(&self, id: u64) -> AppResult<File> {
        self.services.db.files_by_ids(&[id], self.user.id).pop().ok_or_else(|| AppError::not_found("file_not_found", format!("file {} does not exist", id)))
    }
}

#[cfg(test)]
pub(crate) mod test_support;
