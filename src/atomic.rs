//! 临时写入与原子替换的辅助方法（阻塞实现，在持锁的阻塞任务中调用）。

use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    /// 在目标路径同目录创建临时文件。
    pub fn new(target: &Path) -> io::Result<Self> {
        let parent = target
            .parent()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "invalid target path"))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "file".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path)?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    /// 放弃并清理临时文件。
    pub fn cleanup(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.temp_path);
    }

    /// 同步并原子替换目标文件。
    pub fn finalize(self) -> io::Result<()> {
        if let Err(err) = self.file.sync_all() {
            let _ = fs::remove_file(&self.temp_path);
            return Err(err);
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target) {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).is_ok() {
                    fs::rename(&self.temp_path, &self.target)?;
                } else {
                    let _ = fs::remove_file(&self.temp_path);
                    return Err(err);
                }
            }
            #[cfg(not(windows))]
            {
                let _ = fs::remove_file(&self.temp_path);
                return Err(err);
            }
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent);
        }

        Ok(())
    }
}

/// 整体写入 `contents` 并替换 `target`，读者要么看到旧内容，要么看到新内容。
pub fn write_atomic(target: &Path, contents: &[u8]) -> io::Result<()> {
    let mut atomic = AtomicFile::new(target)?;
    if let Err(err) = atomic.file_mut().write_all(contents) {
        atomic.cleanup();
        return Err(err);
    }
    atomic.finalize()
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> io::Result<()> {
    File::open(path)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn replaces_existing_file_without_leftovers() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("notes.txt");
        fs::write(&target, b"old").expect("seed");

        write_atomic(&target, b"new contents").expect("write");

        assert_eq!(fs::read(&target).expect("read"), b"new contents");
        let names: Vec<_> = fs::read_dir(temp.path())
            .expect("read_dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names.len(), 1);
    }

    #[test]
    fn missing_parent_fails_cleanly() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("missing").join("file.txt");
        let err = write_atomic(&target, b"data").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
