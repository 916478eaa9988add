//! 临时写入、落盘同步与原子替换的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

/// A file written under a temporary name and moved into place once complete.
pub struct AtomicFile {
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标同目录创建临时文件（用于整体替换）。
    pub async fn beside(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "target has no parent"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        Self::create(parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()))).await
    }

    /// 在暂存目录创建临时文件（用于上传）。
    pub async fn staged_in(staging_dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(staging_dir).await?;
        Self::create(staging_dir.join(format!("{}.part", Uuid::new_v4()))).await
    }

    async fn create(temp_path: PathBuf) -> io::Result<Self> {
        let file = File::options()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await?;
        Ok(Self { temp_path, file })
    }

    /// 返回临时文件的可写句柄。
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub async fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 刷新并同步内容，返回可提交的暂存文件。
    pub async fn seal(mut self) -> io::Result<SealedFile> {
        let sealed: io::Result<()> = async {
            self.file.flush().await?;
            self.file.sync_all().await
        }
        .await;
        if let Err(err) = sealed {
            self.cleanup().await;
            return Err(err);
        }
        drop(self.file);
        Ok(SealedFile {
            temp_path: self.temp_path,
        })
    }

    /// 同步并原子替换目标文件（目标存在时覆盖）。
    pub async fn replace(self, target: &Path) -> io::Result<()> {
        let sealed = self.seal().await?;
        sealed.move_to(target).await
    }
}

/// Fully written and synced temporary file, not yet visible at its public path.
#[derive(Debug)]
pub struct SealedFile {
    temp_path: PathBuf,
}

impl SealedFile {
    pub async fn discard(self) {
        let _ = fs::remove_file(&self.temp_path).await;
    }

    /// 原子移动到目标路径，失败时清理临时文件。
    pub async fn move_to(self, target: &Path) -> io::Result<()> {
        if let Err(err) = fs::rename(&self.temp_path, target).await {
            #[cfg(windows)]
            {
                if err.kind() == io::ErrorKind::PermissionDenied
                    && fs::remove_file(target).await.is_ok()
                    && fs::rename(&self.temp_path, target).await.is_ok()
                {
                    sync_parent(target).await;
                    return Ok(());
                }
            }
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err);
        }
        sync_parent(target).await;
        Ok(())
    }

    /// 移动到 `dir` 下不与现有条目冲突的名称，返回最终文件名。
    ///
    /// Collisions get a `-N` counter before the extension. The name is
    /// claimed with `hard_link`, which fails on an existing entry, so two
    /// concurrent moves can never land on the same name.
    pub async fn move_into_unique(self, dir: &Path, name: &str) -> io::Result<String> {
        let mut candidate = name.to_string();
        let mut counter = 1u32;
        loop {
            let target = dir.join(&candidate);
            match fs::hard_link(&self.temp_path, &target).await {
                Ok(()) => {
                    let _ = fs::remove_file(&self.temp_path).await;
                    sync_parent(&target).await;
                    return Ok(candidate);
                }
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    candidate = numbered_name(name, counter);
                    counter += 1;
                }
                Err(err) => {
                    let _ = fs::remove_file(&self.temp_path).await;
                    return Err(err);
                }
            }
        }
    }
}

/// 整体写入字节内容（临时文件 + rename）。
pub async fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = target.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }
    let mut atomic = AtomicFile::beside(target).await?;
    if let Err(err) = atomic.file_mut().write_all(contents).await {
        atomic.cleanup().await;
        return Err(err);
    }
    atomic.replace(target).await
}

fn numbered_name(name: &str, counter: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{counter}.{ext}"),
        _ => format!("{name}-{counter}"),
    }
}

async fn sync_parent(target: &Path) {
    let Some(parent) = target.parent() else {
        return;
    };
    let parent = parent.to_path_buf();
    let _ = tokio::task::spawn_blocking(move || {
        let dir = std::fs::File::open(parent)?;
        dir.sync_all()
    })
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_atomic_replaces_contents() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("nested").join("record.json");

        write_atomic(&target, b"first").await.expect("first write");
        write_atomic(&target, b"second").await.expect("second write");

        assert_eq!(std::fs::read(&target).expect("read"), b"second");
        let leftovers = std::fs::read_dir(target.parent().expect("parent"))
            .expect("read dir")
            .count();
        assert_eq!(leftovers, 1, "temp files must not linger");
    }

    #[tokio::test]
    async fn unique_move_never_overwrites() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        let dest = temp.path().join("dest");
        std::fs::create_dir_all(&dest).expect("dest");
        std::fs::write(dest.join("a.txt"), b"original").expect("seed");

        let mut atomic = AtomicFile::staged_in(&staging).await.expect("stage");
        atomic.file_mut().write_all(b"new").await.expect("write");
        let sealed = atomic.seal().await.expect("seal");
        let stored = sealed
            .move_into_unique(&dest, "a.txt")
            .await
            .expect("move");

        assert_eq!(stored, "a-1.txt");
        assert_eq!(std::fs::read(dest.join("a.txt")).expect("read"), b"original");
        assert_eq!(std::fs::read(dest.join("a-1.txt")).expect("read"), b"new");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_unique_moves_keep_every_file() {
        let temp = tempdir().expect("tempdir");
        let staging = temp.path().join("staging");
        let dest = temp.path().join("dest");
        std::fs::create_dir_all(&dest).expect("dest");

        for round in 0..20 {
            let name = format!("r{round}.txt");
            let mut tasks = Vec::new();
            for index in 0..4u8 {
                let mut atomic = AtomicFile::staged_in(&staging).await.expect("stage");
                atomic.file_mut().write_all(&[index]).await.expect("write");
                let sealed = atomic.seal().await.expect("seal");
                let dest = dest.clone();
                let name = name.clone();
                tasks.push(tokio::spawn(async move {
                    sealed.move_into_unique(&dest, &name).await
                }));
            }

            let mut stored = Vec::new();
            for task in tasks {
                stored.push(task.await.expect("join").expect("move"));
            }
            let mut contents: Vec<u8> = stored
                .iter()
                .map(|name| std::fs::read(dest.join(name)).expect("read")[0])
                .collect();
            contents.sort_unstable();
            stored.sort();
            stored.dedup();

            assert_eq!(stored.len(), 4, "round {round} reused a name");
            assert_eq!(contents, vec![0, 1, 2, 3], "round {round} lost a file");
        }
        let leftovers = std::fs::read_dir(&staging).expect("staging").count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn numbered_name_keeps_extension() {
        assert_eq!(numbered_name("photo.jpg", 2), "photo-2.jpg");
        assert_eq!(numbered_name("README", 1), "README-1");
        assert_eq!(numbered_name(".env", 1), ".env-1");
    }
}
