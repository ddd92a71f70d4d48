//! Process-wide collaborators shared by every session: metadata, quota, cache and drivers.

use std::sync::Arc;

use crate::auth::HmacAuth;
use crate::cache::Cache;
use crate::config::{Config, Seed, SiteSettings, SlaveConfig};
use crate::driver::{Driver, DriverEnv, DriverRegistry};
use crate::error::AppResult;
use crate::ledger::CapacityLedger;
use crate::models::{Folder, MetaStore, Policy, User};
use crate::util::rand_string;

#[derive(Clone)]
pub struct Services {
    pub db: Arc<MetaStore>,
    pub ledger: Arc<CapacityLedger>,
    pub cache: Cache,
    pub drivers: Arc<DriverRegistry>,
    pub env: DriverEnv,
    pub slave: Arc<SlaveConfig>,
}

impl Services {
    pub fn new(config: &Config) -> Self { Self::with_registry(config, DriverRegistry::with_defaults()) }

    pub fn with_registry(config: &Config, drivers: DriverRegistry) -> Self {
        let secret = if config.system.session_secret.is_empty() {
            tracing::warn!("system.session_secret is empty; signed links will not survive a restart");
            rand_string(32)
        } else {
            config.system.session_secret.clone()
        };
        let cache = Cache::new();
        let env = DriverEnv::new(Arc::new(config.site.clone()), cache.clone(), HmacAuth::new(secret));
        Self {
            db: Arc::new(MetaStore::new()),
            ledger: Arc::new(CapacityLedger::new()),
            cache,
            drivers: Arc::new(drivers),
            env,
            slave: Arc::new(config.slave.clone()),
        }
    }

    pub fn settings(&self) -> &SiteSettings { &self.env.settings }

    /// Signer for master-issued links.
    pub fn signer(&self) -> &HmacAuth { &self.env.signer }

    pub fn resolve_driver(&self, policy: &Policy) -> AppResult<Arc<dyn Driver>> { self.drivers.resolve(policy, &self.env) }

    /// Register a user with its root folder and capacity account.
    pub fn create_user(&self, user: User) -> AppResult<Folder> {
        let root = self.db.insert_user(user.clone())?;
        self.ledger.open(user.id, user.group.max_storage, 0);
        Ok(root)
    }

    pub fn seed(&self, seed: &Seed) -> AppResult<()> {
        for p in &seed.policies {
            self.db.insert_policy(p.clone());
        }
        for u in &seed.users {
            self.create_user(u.clone())?;
        }
        tracing::info!(policies = seed.policies.len(), users = seed.users.len(), "seed_loaded");
        Ok(())
    }
}
