//! Lease election by advisory file lock. Only meaningful when every
//! replica shares the host; the kernel releases the lock if the holder
//! dies, which is the crash-failover path.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use fs2::FileExt;

use super::{ElectionError, LeaseBackend, LeaseState};

pub struct FileLease {
    dir: PathBuf,
    held: Mutex<Option<File>>,
}

impl FileLease {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            held: Mutex::new(None),
        }
    }

    fn lock_path(&self, lease_name: &str) -> PathBuf {
        self.dir.join(format!("{lease_name}.lock"))
    }
}

#[async_trait]
impl LeaseBackend for FileLease {
    async fn acquire_or_renew(
        &self,
        identity: &str,
        lease_name: &str,
        _duration: Duration,
    ) -> Result<LeaseState, ElectionError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| ElectionError::Other(anyhow::anyhow!("lease lock poisoned")))?;

        // The flock is held for as long as the handle lives; renewal is
        // implicit.
        if held.is_some() {
            return Ok(LeaseState::Acquired);
        }

        std::fs::create_dir_all(&self.dir)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(lease_name))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                file.set_len(0)?;
                file.seek(SeekFrom::Start(0))?;
                file.write_all(identity.as_bytes())?;
                file.sync_all()?;
                *held = Some(file);
                Ok(LeaseState::Acquired)
            }
            Err(_) => {
                let mut holder = String::new();
                file.seek(SeekFrom::Start(0))?;
                let _ = file.read_to_string(&mut holder);
                let holder = holder.trim().to_owned();
                Ok(LeaseState::NotLeader {
                    holder: (!holder.is_empty()).then_some(holder),
                })
            }
        }
    }

    async fn release(&self, _identity: &str, _lease_name: &str) -> Result<(), ElectionError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| ElectionError::Other(anyhow::anyhow!("lease lock poisoned")))?;
        if let Some(file) = held.take() {
            let _ = fs2::FileExt::unlock(&file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_then_transfers_on_release() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLease::new(dir.path());
        let b = FileLease::new(dir.path());
        let duration = Duration::from_secs(15);

        assert_eq!(
            a.acquire_or_renew("replica-a", "agent-x", duration).await.unwrap(),
            LeaseState::Acquired
        );
        // Renewal is a no-op while held.
        assert_eq!(
            a.acquire_or_renew("replica-a", "agent-x", duration).await.unwrap(),
            LeaseState::Acquired
        );

        match b.acquire_or_renew("replica-b", "agent-x", duration).await.unwrap() {
            LeaseState::NotLeader { holder } => assert_eq!(holder.as_deref(), Some("replica-a")),
            LeaseState::Acquired => panic!("second replica must not acquire a held lock"),
        }

        a.release("replica-a", "agent-x").await.unwrap();
        assert_eq!(
            b.acquire_or_renew("replica-b", "agent-x", duration).await.unwrap(),
            LeaseState::Acquired
        );
    }

    #[tokio::test]
    async fn distinct_lease_names_do_not_contend() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLease::new(dir.path());
        let b = FileLease::new(dir.path());
        let duration = Duration::from_secs(15);

        assert_eq!(
            a.acquire_or_renew("replica-a", "agent-x", duration).await.unwrap(),
            LeaseState::Acquired
        );
        assert_eq!(
            b.acquire_or_renew("replica-b", "agent-y", duration).await.unwrap(),
            LeaseState::Acquired
        );
    }
}
