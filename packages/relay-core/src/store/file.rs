use async_trait::async_trait;
use fslock::LockFile;
use log::{debug, info};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use super::{scan, KvStore, StoreError};

type Entries = BTreeMap<String, Vec<u8>>;

/// Key-value store persisted as a JSON snapshot.
///
/// Every operation takes an advisory lock on `<path>.lock`, reloads the
/// snapshot from disk and, if it changed anything, writes it back through a
/// temp file and a rename. Several processes (the relayer and the CLI) can
/// therefore share one file without losing each other's writes.
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    local: Mutex<()>,
}

impl FileStore {
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let mut lock_path = path.clone().into_os_string();
        lock_path.push(".lock");
        let store = Self {
            path,
            lock_path: PathBuf::from(lock_path),
            local: Mutex::new(()),
        };
        let count = store.locked(|entries| Ok((entries.len(), false))).await?;
        info!("Opened {:?} with {} records", store.path, count);
        Ok(store)
    }

    /// Runs `f` against the current on-disk snapshot under the file lock.
    /// `f` returns its result and whether the snapshot must be written back.
    async fn locked<R, F>(&self, f: F) -> Result<R, StoreError>
    where
        R: Send + 'static,
        F: FnOnce(&mut Entries) -> Result<(R, bool), StoreError> + Send + 'static,
    {
        let _local = self.local.lock().await;
        let path = self.path.clone();
        let lock_path = self.lock_path.clone();
        tokio::task::spawn_blocking(move || {
            let mut lock = LockFile::open(lock_path.as_path())?;
            lock.lock()?;
            let mut entries = load(&path)?;
            let (out, dirty) = f(&mut entries)?;
            if dirty {
                flush(&path, &entries)?;
            }
            lock.unlock()?;
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
    }
}

fn load(path: &Path) -> Result<Entries, StoreError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Entries::new()),
        Err(e) => return Err(e.into()),
    };
    let encoded: BTreeMap<String, String> = serde_json::from_str(&raw)?;
    let mut entries = Entries::new();
    for (key, value) in encoded {
        let bytes = hex::decode(&value).map_err(|e| StoreError::Serialization(format!("{}: {}", key, e)))?;
        entries.insert(key, bytes);
    }
    Ok(entries)
}

fn flush(path: &Path, entries: &Entries) -> Result<(), StoreError> {
    let encoded: BTreeMap<&String, String> = entries.iter().map(|(k, v)| (k, hex::encode(v))).collect();
    let raw = serde_json::to_vec_pretty(&encoded)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, raw)?;
    std::fs::rename(&tmp, path)?;
    debug!("Flushed {} records to {:?}", entries.len(), path);
    Ok(())
}

#[async_trait]
impl KvStore for FileStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let key = key.to_string();
        self.locked(move |entries| Ok((entries.get(&key).cloned(), false))).await
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<(), StoreError> {
        let key = key.to_string();
        self.locked(move |entries| {
            entries.insert(key, value);
            Ok(((), true))
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
    ) -> Result<bool, StoreError> {
        let key = key.to_string();
        let expected = expected.map(<[u8]>::to_vec);
        self.locked(move |entries| {
            if entries.get(&key) != expected.as_ref() {
                return Ok((false, false));
            }
            entries.insert(key, new);
            Ok((true, true))
        })
        .await
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let prefix = prefix.to_string();
        self.locked(move |entries| Ok((scan(entries, &prefix), false))).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let store = FileStore::open(&path).await.unwrap();
        store.put("msg/1", b"hello".to_vec()).await.unwrap();
        assert!(store
            .compare_and_swap("exec/abc", None, b"msg/1".to_vec())
            .await
            .unwrap());
        drop(store);

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("msg/1").await.unwrap(), Some(b"hello".to_vec()));
        assert!(!reopened
            .compare_and_swap("exec/abc", None, b"other".to_vec())
            .await
            .unwrap());
        assert_eq!(reopened.scan_prefix("exec/").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_two_handles_share_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");

        let relayer = FileStore::open(&path).await.unwrap();
        relayer.put("review/m1", b"open".to_vec()).await.unwrap();

        let operator = FileStore::open(&path).await.unwrap();
        assert!(operator
            .compare_and_swap("review/m1", Some(b"open"), b"approved".to_vec())
            .await
            .unwrap());

        // The first handle sees the decision and does not clobber it.
        assert_eq!(relayer.get("review/m1").await.unwrap(), Some(b"approved".to_vec()));
        relayer.put("msg/2", b"queued".to_vec()).await.unwrap();
        assert!(!relayer
            .compare_and_swap("review/m1", Some(b"open"), b"rejected".to_vec())
            .await
            .unwrap());

        let reopened = FileStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("review/m1").await.unwrap(), Some(b"approved".to_vec()));
        assert_eq!(reopened.get("msg/2").await.unwrap(), Some(b"queued".to_vec()));
    }

    #[tokio::test]
    async fn test_concurrent_handles_lose_no_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        let a = std::sync::Arc::new(FileStore::open(&path).await.unwrap());
        let b = std::sync::Arc::new(FileStore::open(&path).await.unwrap());

        let tasks: Vec<_> = (0..10)
            .map(|i| {
                let store = if i % 2 == 0 { a.clone() } else { b.clone() };
                tokio::spawn(async move { store.put(&format!("k/{}", i), vec![i as u8]).await.unwrap() })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(a.scan_prefix("k/").await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(
            FileStore::open(&path).await,
            Err(StoreError::Serialization(_))
        ));
    }
}
