//! Filesystem shard store.
//!
//! One file per shard, named by the lowercase hex sha-256 of its bytes.
//! Incoming data is staged under `tmp/` and renamed into place once its id
//! is known, so a shard path never points at a partial file.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::RngCore;
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::error::{NodeError, Result};

const TMP_DIR: &str = "tmp";
const HASH_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId([u8; 32]);

impl ShardId {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn of(data: &[u8]) -> Self {
        Self(crate::crypto::sha256(data))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse 64 lowercase hex characters.
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 64 || s.bytes().any(|b| b.is_ascii_uppercase()) {
            return None;
        }
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShardId({})", &self.to_hex()[..16])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Capacity {
    pub total: u64,
    pub used: u64,
    pub free: u64,
}

/// The narrow storage interface the transfer layer and crawler consume.
#[async_trait]
pub trait ShardStore: Send + Sync + 'static {
    async fn find(&self, id: &ShardId) -> Option<PathBuf>;

    /// Move a fully written staging file into the store under `id`.
    ///
    /// The caller vouches that `id` is the hash of the file.
    async fn import(&self, staged: &Path, id: &ShardId) -> Result<PathBuf>;

    async fn remove(&self, id: &ShardId) -> Result<bool>;

    fn capacity(&self) -> Capacity;

    /// A fresh path inside the staging directory.
    fn staging_path(&self) -> PathBuf;

    /// Hash a staging file and import it.
    async fn add_file(&self, staged: &Path) -> Result<ShardId> {
        let id = hash_file(staged).await?;
        self.import(staged, &id).await?;
        Ok(id)
    }

    async fn add_bytes(&self, data: &[u8]) -> Result<ShardId> {
        let staged = self.staging_path();
        fs::write(&staged, data).await?;
        let id = ShardId::of(data);
        if let Err(e) = self.import(&staged, &id).await {
            let _ = fs::remove_file(&staged).await;
            return Err(e);
        }
        Ok(id)
    }

    async fn size_of(&self, id: &ShardId) -> Option<u64> {
        let path = self.find(id).await?;
        fs::metadata(path).await.ok().map(|m| m.len())
    }
}

/// Streaming sha-256 of a file.
pub async fn hash_file(path: &Path) -> Result<ShardId> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUFFER_SIZE];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(ShardId(hasher.finalize().into()))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Layout {
    Flat,
    /// `ab/c/abc...` style trees for filesystems that dislike huge directories.
    Fanout,
}

pub struct FsShardStore {
    root: PathBuf,
    layout: Layout,
    /// 0 means no limit.
    limit: u64,
    used: Mutex<u64>,
}

impl FsShardStore {
    /// Open (or create) a store rooted at `root`. Leftover staging files are removed.
    pub async fn open(root: impl Into<PathBuf>, limit: u64, layout: Layout) -> Result<Arc<Self>> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        let tmp = root.join(TMP_DIR);
        if fs::try_exists(&tmp).await? {
            fs::remove_dir_all(&tmp).await?;
        }
        fs::create_dir_all(&tmp).await?;

        let used = dir_usage(&root).await?;
        info!(root = %root.display(), used, limit, "shard store opened");
        Ok(Arc::new(Self {
            root,
            layout,
            limit,
            used: Mutex::new(used),
        }))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_path(&self, id: &ShardId) -> PathBuf {
        let name = id.to_hex();
        match self.layout {
            Layout::Flat => self.root.join(name),
            Layout::Fanout => self.root.join(&name[..2]).join(&name[2..3]).join(name),
        }
    }

    /// Reserve `bytes`, failing with `MemoryError` if they do not fit.
    fn reserve(&self, bytes: u64) -> Result<()> {
        let mut used = self.used.lock();
        if self.limit != 0 {
            let free = self.limit.saturating_sub(*used);
            if bytes > free {
                return Err(NodeError::MemoryError { needed: bytes, free });
            }
        }
        *used += bytes;
        Ok(())
    }

    fn release(&self, bytes: u64) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
    }
}

#[async_trait]
impl ShardStore for FsShardStore {
    async fn find(&self, id: &ShardId) -> Option<PathBuf> {
        let path = self.shard_path(id);
        match fs::try_exists(&path).await {
            Ok(true) => Some(path),
            _ => None,
        }
    }

    async fn import(&self, staged: &Path, id: &ShardId) -> Result<PathBuf> {
        let dest = self.shard_path(id);
        if fs::try_exists(&dest).await? {
            // Shards are immutable: identical bytes are already here.
            fs::remove_file(staged).await?;
            return Ok(dest);
        }

        let size = fs::metadata(staged).await?.len();
        self.reserve(size)?;
        if let Some(parent) = dest.parent()
            && let Err(e) = fs::create_dir_all(parent).await
        {
            self.release(size);
            return Err(e.into());
        }
        if let Err(e) = fs::rename(staged, &dest).await {
            self.release(size);
            return Err(e.into());
        }
        debug!(shard = %&id.to_hex()[..16], size, "shard stored");
        Ok(dest)
    }

    async fn remove(&self, id: &ShardId) -> Result<bool> {
        let path = self.shard_path(id);
        let size = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&path).await?;
        self.release(size);
        debug!(shard = %&id.to_hex()[..16], "shard removed");
        Ok(true)
    }

    fn capacity(&self) -> Capacity {
        let used = *self.used.lock();
        let total = if self.limit == 0 { u64::MAX } else { self.limit };
        Capacity {
            total,
            used,
            free: total.saturating_sub(used),
        }
    }

    fn staging_path(&self) -> PathBuf {
        let mut suffix = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut suffix);
        self.root.join(TMP_DIR).join(format!("{}.part", hex::encode(suffix)))
    }
}

/// Bytes used by shard files under `root`, skipping the staging directory.
async fn dir_usage(root: &Path) -> Result<u64> {
    let mut total = 0u64;
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                if entry.file_name() != TMP_DIR || dir != root {
                    pending.push(entry.path());
                }
            } else if meta.is_file() {
                total += meta.len();
            } else {
                warn!(path = %entry.path().display(), "skipping non-regular file in shard store");
            }
        }
    }
    Ok(total)
}

/// Write `data` to a staging file and return its path, for callers that
/// need a file on disk before deciding on an id.
pub async fn stage_bytes(store: &dyn ShardStore, data: &[u8]) -> Result<PathBuf> {
    let path = store.staging_path();
    let mut file = fs::File::create(&path).await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_find_remove() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsShardStore::open(dir.path(), 0, Layout::Flat).await.expect("open");

        let id = store.add_bytes(b"hello shard").await.expect("add");
        assert_eq!(id, ShardId::of(b"hello shard"));
        let path = store.find(&id).await.expect("stored");
        assert_eq!(fs::read(&path).await.expect("read"), b"hello shard");
        assert_eq!(store.capacity().used, 11);

        assert!(store.remove(&id).await.expect("remove"));
        assert!(store.find(&id).await.is_none());
        assert!(!store.remove(&id).await.expect("second remove"));
        assert_eq!(store.capacity().used, 0);
    }

    #[tokio::test]
    async fn fanout_layout_nests_by_prefix() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsShardStore::open(dir.path(), 0, Layout::Fanout).await.expect("open");
        let id = store.add_bytes(b"nested").await.expect("add");
        let hex = id.to_hex();
        let expected = dir.path().join(&hex[..2]).join(&hex[2..3]).join(&hex);
        assert_eq!(store.find(&id).await, Some(expected));
    }

    #[tokio::test]
    async fn limit_is_enforced() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsShardStore::open(dir.path(), 16, Layout::Flat).await.expect("open");
        store.add_bytes(&[1u8; 10]).await.expect("fits");
        let err = store.add_bytes(&[2u8; 10]).await.expect_err("over limit");
        assert!(matches!(err, NodeError::MemoryError { needed: 10, free: 6 }));
        assert_eq!(store.capacity(), Capacity { total: 16, used: 10, free: 6 });
    }

    #[tokio::test]
    async fn usage_survives_reopen_and_staging_is_cleared() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let store = FsShardStore::open(dir.path(), 0, Layout::Flat).await.expect("open");
            store.add_bytes(&[7u8; 100]).await.expect("add");
            stage_bytes(store.as_ref(), &[0u8; 50]).await.expect("stage");
        }
        let store = FsShardStore::open(dir.path(), 0, Layout::Flat).await.expect("reopen");
        assert_eq!(store.capacity().used, 100);
        let mut leftovers = fs::read_dir(dir.path().join(TMP_DIR)).await.expect("tmp");
        assert!(leftovers.next_entry().await.expect("entry").is_none());
    }

    #[tokio::test]
    async fn add_file_hashes_staged_content() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsShardStore::open(dir.path(), 0, Layout::Flat).await.expect("open");
        let staged = stage_bytes(store.as_ref(), b"staged").await.expect("stage");
        let id = store.add_file(&staged).await.expect("add");
        assert_eq!(id, ShardId::of(b"staged"));
        assert!(!fs::try_exists(&staged).await.expect("exists"));
    }

    #[test]
    fn shard_id_hex_is_strict() {
        let id = ShardId::of(b"x");
        assert_eq!(ShardId::from_hex(&id.to_hex()), Some(id));
        assert!(ShardId::from_hex(&id.to_hex().to_uppercase()).is_none());
        assert!(ShardId::from_hex("abc").is_none());
    }
}
