//! Binding of policy kinds to driver constructors.

use std::collections::HashMap;
use std::sync::Arc;

use super::{local::LocalDriver, onedrive::OneDriveDriver, remote::RemoteDriver, s3::S3Driver, Driver, DriverEnv};
use crate::error::{AppError, AppResult};
use crate::models::{Policy, PolicyKind};

pub type DriverFactory = Arc<dyn Fn(&Policy, &DriverEnv) -> AppResult<Arc<dyn Driver>> + Send + Sync>;

/// Wrap a concrete constructor as a [`DriverFactory`].
pub fn factory<D, F>(ctor: F) -> DriverFactory
where
    D: Driver + 'static,
    F: Fn(&Policy, &DriverEnv) -> AppResult<D> + Send + Sync + 'static,
{
    Arc::new(move |p: &Policy, env: &DriverEnv| -> AppResult<Arc<dyn Driver>> { Ok(Arc::new(ctor(p, env)?) as Arc<dyn Driver>) })
}

#[derive(Clone, Default)]
pub struct DriverRegistry {
    factories: HashMap<PolicyKind, DriverFactory>,
}

impl DriverRegistry {
    pub fn empty() -> Self { Self::default() }

    /// All built-in backends. `oss` and `cos` speak the S3 protocol.
    pub fn with_defaults() -> Self {
        let mut r = Self::empty();
        r.bind(PolicyKind::Local, factory(LocalDriver::new));
        r.bind(PolicyKind::Remote, factory(RemoteDriver::new));
        for kind in [PolicyKind::S3, PolicyKind::Oss, PolicyKind::Cos] {
            r.bind(kind, factory(S3Driver::new));
        }
        r.bind(PolicyKind::OneDrive, factory(OneDriveDriver::new));
        r
    }

    /// Bind or replace the constructor for `kind`.
    pub fn bind(&mut self, kind: PolicyKind, factory: DriverFactory) { self.factories.insert(kind, factory); }

    pub fn resolve(&self, policy: &Policy, env: &DriverEnv) -> AppResult<Arc<dyn Driver>> {
        let factory = self.factories.get(&policy.kind).ok_or_else(|| {
            AppError::internal_setting("unknown_policy_type", format!("no driver bound for policy type '{}'", policy.kind.as_str()))
        })?;
        factory(policy, env)
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
