//! 租户工作区：根目录定位、符号链接越界检查与目录/元数据读取。
//!
//! 这里的磁盘访问全部是阻塞调用，由处理器在持有租户锁的
//! `spawn_blocking` 任务中执行。

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::paths::{self, PathTraversal};

/// Opaque tenant identifier supplied by the identity layer.
///
/// It must be a single plain path component so that `<base>/<tenant>` can
/// never name anything but a direct child of the workspace base.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn parse(raw: &str) -> Option<Self> {
        let id = raw.trim();
        if id.is_empty() || id == "." || id == ".." || id.contains(['/', '\\', '\0']) {
            return None;
        }
        Some(Self(id.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("path contains a NUL byte")]
    InvalidPath,
    #[error(transparent)]
    Traversal(#[from] PathTraversal),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 所有租户工作区的公共父目录。
#[derive(Clone, Debug)]
pub struct Workspaces {
    base: PathBuf,
}

impl Workspaces {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base: paths::clean(&base),
        }
    }

    pub async fn ensure_base(&self) -> io::Result<()> {
        tokio::fs::create_dir_all(&self.base).await
    }

    pub fn base_path(&self) -> &Path {
        &self.base
    }

    pub fn for_tenant(&self, tenant: &TenantId) -> Workspace {
        Workspace {
            root: self.base.join(tenant.as_str()),
        }
    }
}

/// 单个租户的根目录 `<base>/<tenant>`，由外部创建。
#[derive(Clone, Debug)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 解析调用方给出的相对路径；含 NUL 的路径在触碰磁盘前拒绝。
    pub fn resolve(&self, relative: &str) -> Result<PathBuf, StorageError> {
        if relative.contains('\0') {
            return Err(StorageError::InvalidPath);
        }
        Ok(paths::resolve_within_root(&self.root, relative)?)
    }

    /// 校验服务端拼出来的路径仍在根目录内。
    pub fn contain(&self, candidate: &Path) -> Result<PathBuf, PathTraversal> {
        paths::ensure_within_root(&self.root, candidate)
    }

    pub fn is_root(&self, target: &Path) -> bool {
        target == self.root()
    }

    /// 根目录必须已存在；网关从不自行创建租户根目录。
    pub fn require_root(&self) -> Result<(), StorageError> {
        match fs::metadata(&self.root) {
            Ok(metadata) if metadata.is_dir() => Ok(()),
            Ok(_) => Err(workspace_missing()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(workspace_missing()),
            Err(err) => Err(StorageError::Io(err)),
        }
    }

    /// 逐级检查 `target` 在根目录下已存在的组件，符号链接必须指回根目录内。
    ///
    /// 不存在的尾部组件直接放行；根目录不存在时也放行，由随后的存储调用
    /// 报告 NotFound。
    pub fn check_links(&self, target: &Path) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| PathTraversal::new(target.to_string_lossy()))?;
        let canonical_root = match fs::canonicalize(&self.root) {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::Io(err)),
        };

        let mut current = self.root.clone();
        for component in relative.components() {
            current.push(component.as_os_str());
            let metadata = match fs::symlink_metadata(&current) {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
                Err(err) => return Err(StorageError::Io(err)),
            };
            if !metadata.file_type().is_symlink() {
                continue;
            }
            match fs::canonicalize(&current) {
                Ok(resolved) if resolved.starts_with(&canonical_root) => {}
                Ok(_) => return Err(escaping_link(relative)),
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    return Err(escaping_link(relative));
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    pub fn list_dir(&self, target: &Path) -> Result<Vec<DirEntry>, StorageError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(target)? {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_directory: entry.file_type()?.is_dir(),
            });
        }

        entries.sort_by(|a, b| match (a.is_directory, b.is_directory) {
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
        });

        Ok(entries)
    }

    pub fn stat(&self, target: &Path) -> Result<FileStat, StorageError> {
        let metadata = fs::metadata(target)?;
        let modified = metadata.modified().ok().map(format_timestamp);
        let created = metadata
            .created()
            .ok()
            .map(format_timestamp)
            .or_else(|| modified.clone());
        Ok(FileStat {
            size: metadata.len(),
            is_directory: metadata.is_dir(),
            modified,
            created,
        })
    }
}

fn workspace_missing() -> StorageError {
    StorageError::Io(io::Error::new(ErrorKind::NotFound, "workspace not found"))
}

fn escaping_link(relative: &Path) -> StorageError {
    StorageError::Traversal(PathTraversal::new(relative.to_string_lossy()))
}

fn format_timestamp(timestamp: SystemTime) -> String {
    let datetime: DateTime<Utc> = timestamp.into();
    datetime.to_rfc3339()
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirEntry {
    pub name: String,
    pub is_directory: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStat {
    pub size: u64,
    pub is_directory: bool,
    pub modified: Option<String>,
    pub created: Option<String>,
}
