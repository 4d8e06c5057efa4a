use async_trait::async_trait;
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::{fs, io::AsyncWrite};

pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

/// Where downloaded bytes end up. The download manager only ever asks for a
/// sink by key; naming and layout belong to the implementation.
///
/// Bytes written to a sink are not visible under `key` until [`commit`] is
/// called. [`discard`] throws away an unfinished write.
///
/// [`commit`]: Storage::commit
/// [`discard`]: Storage::discard
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Opens a fresh pending write for `key`.
    async fn open_for_write(&self, key: &str) -> io::Result<Sink>;

    /// Moves the finished write into place, replacing whatever was there.
    async fn commit(&self, key: &str) -> io::Result<()>;

    /// Drops the pending write of `key`, if any.
    async fn discard(&self, key: &str);
}

/// Keys are relative paths below `root`. Pending writes go to a `.part`
/// sibling and are renamed over the destination on commit.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }

    fn part_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.part"))
    }

    /// Size of an already present file, if any.
    pub async fn existing_len(&self, key: &str) -> Option<u64> {
        fs::metadata(self.path(key))
            .await
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
    }
}

async fn create_parent(path: &Path) -> io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent).await,
        _ => Ok(()),
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn open_for_write(&self, key: &str) -> io::Result<Sink> {
        let path = self.part_path(key);
        create_parent(&path).await?;
        let file = fs::File::create(&path).await?;
        Ok(Box::new(file))
    }

    async fn commit(&self, key: &str) -> io::Result<()> {
        fs::rename(self.part_path(key), self.path(key)).await
    }

    async fn discard(&self, key: &str) {
        let _ = fs::remove_file(self.part_path(key)).await;
    }
}
