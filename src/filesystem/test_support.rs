//! Fixture for session tests: a local policy on a temp dir, an in-memory "S3" policy, and one
//! user allowed on both.

use tempfile::TempDir;

use super::FileSystem;
use crate::config::Config;
use crate::driver::testing::MemoryBackend;
use crate::driver::{ByteStream, DriverRegistry};
use crate::models::{Group, Policy, PolicyKind, User};
use crate::services::Services;

pub(crate) const UID: u64 = 7;
pub(crate) const LOCAL: u64 = 1;
pub(crate) const MEMORY: u64 = 2;

pub(crate) struct Fixture {
    pub services: Services,
    pub memory: MemoryBackend,
    pub tmp: TempDir,
}

impl Fixture {
    pub fn new(max_storage: u64) -> Self { Self::with_local(max_storage, |_| {}) }

    /// Build the fixture, letting the caller adjust the local policy first.
    pub fn with_local(max_storage: u64, tweak: impl FnOnce(&mut Policy)) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.system.session_secret = "test-secret".to_string();
        cfg.site.data_dir = tmp.path().join("data").to_string_lossy().to_string();
        cfg.site.temp_path = tmp.path().join("temp").to_string_lossy().to_string();
        cfg.slave.secret = "slave-secret".to_string();

        let memory = MemoryBackend::new();
        let mut registry = DriverRegistry::with_defaults();
        registry.bind(PolicyKind::S3, memory.factory(PolicyKind::S3));
        let services = Services::with_registry(&cfg, registry);

        let mut local = Policy::new(LOCAL, "local", PolicyKind::Local);
        tweak(&mut local);
        services.db.insert_policy(local);
        services.db.insert_policy(Policy::new(MEMORY, "memory", PolicyKind::S3));

        let mut group = Group::new(1, "users", LOCAL, max_storage);
        group.policy_ids.push(MEMORY);
        services.create_user(User { id: UID, email: "u@example.com".into(), nick: "u".into(), group }).unwrap();
        Self { services, memory, tmp }
    }

    pub fn fs(&self) -> FileSystem {
        let user = self.services.db.get_user(UID).unwrap();
        FileSystem::new(&self.services, user).unwrap()
    }

    pub fn used(&self) -> u64 { self.services.ledger.used(UID).unwrap() }
}

pub(crate) fn bytes(b: &[u8]) -> ByteStream { Box::new(std::io::Cursor::new(b.to_vec())) }

/// Upload `content` to the virtual file `path` through the default stack.
pub(crate) async fn put_file(fs: &mut FileSystem, path: &str, content: &[u8]) -> crate::models::File {
    fs.upload_to(bytes(content), path, content.len() as u64, Default::default()).await.unwrap().record.unwrap()
}
