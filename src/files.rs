//! 租户文件操作处理器：重命名、读写、列目录、创建目录与删除。
//!
//! 每个处理器的顺序相同：先在锁外做纯词法的路径解析，再获取租户锁
//! （读操作共享、写操作独占），然后在阻塞线程里完成符号链接检查与唯一
//! 一次存储调用。锁守卫被移入阻塞任务，调用结束后才释放。

use axum::body::Bytes;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{Extension, Multipart};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use httpdate::fmt_http_date;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, info};

use crate::atomic::write_atomic;
use crate::error::ApiError;
use crate::http::{ApiJson, ApiQuery};
use crate::tenant_lock::{TenantLocks, TenantReadGuard, TenantWriteGuard};
use crate::workspace::{DirEntry, FileStat, TenantId, Workspace, Workspaces};

#[derive(Debug)]
pub struct FsConfig {
    /// `None` 表示无限等待。
    pub lock_wait: Option<Duration>,
}

impl FsConfig {
    pub fn from_secs(lock_wait_secs: u64) -> Self {
        Self {
            lock_wait: (lock_wait_secs > 0).then(|| Duration::from_secs(lock_wait_secs)),
        }
    }
}

#[derive(Deserialize)]
pub(crate) struct PathQuery {
    #[serde(default)]
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct PathBody {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct WriteBody {
    path: String,
    content: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RenameBody {
    path: String,
    new_name: String,
}

#[derive(Debug, Serialize)]
pub struct RenameResponse {
    renamed: bool,
}

#[derive(Debug, Serialize)]
pub struct WriteResponse {
    written: bool,
}

#[derive(Debug, Serialize)]
pub struct CreatedResponse {
    created: bool,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    removed: bool,
}

#[derive(Debug, Serialize)]
pub struct ReadResponse {
    content: String,
}

#[derive(Debug, Serialize)]
pub struct ReaddirResponse {
    entries: Vec<DirEntry>,
}

/// 返回文件或目录的元数据。
pub async fn stat_entry(
    ApiQuery(PathQuery { path }): ApiQuery<PathQuery>,
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
) -> Result<JsonResponse<FileStat>, ApiError> {
    let workspace = workspaces.for_tenant(&tenant);
    let target = workspace.resolve(&path)?;
    let guard = lock_shared(&locks, &tenant, &config).await?;
    let stat = run_locked(guard, move || {
        workspace.check_links(&target)?;
        Ok(workspace.stat(&target)?)
    })
    .await?;
    debug!(path, "stat entry");
    Ok(JsonResponse(stat))
}

/// 列出目录内容，空路径表示工作区根目录。
pub async fn read_dir(
    ApiQuery(PathQuery { path }): ApiQuery<PathQuery>,
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
) -> Result<JsonResponse<ReaddirResponse>, ApiError> {
    let workspace = workspaces.for_tenant(&tenant);
    let target = workspace.resolve(&path)?;
    let guard = lock_shared(&locks, &tenant, &config).await?;
    let entries = run_locked(guard, move || {
        workspace.check_links(&target)?;
        if !fs::metadata(&target)?.is_dir() {
            return Err(ApiError::BadRequest("path is not a directory".into()));
        }
        Ok(workspace.list_dir(&target)?)
    })
    .await?;
    info!(path, count = entries.len(), "list directory");
    Ok(JsonResponse(ReaddirResponse { entries }))
}

/// 以 UTF-8 文本读取文件。
pub async fn read_file(
    ApiQuery(PathQuery { path }): ApiQuery<PathQuery>,
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
) -> Result<JsonResponse<ReadResponse>, ApiError> {
    let workspace = workspaces.for_tenant(&tenant);
    let target = workspace.resolve(&path)?;
    let guard = lock_shared(&locks, &tenant, &config).await?;
    let (bytes, _) = run_locked(guard, move || read_regular_file(&workspace, &target)).await?;
    let content = String::from_utf8(bytes)
        .map_err(|_| ApiError::BadRequest("file is not valid UTF-8".into()))?;
    debug!(path, size = content.len(), "read file");
    Ok(JsonResponse(ReadResponse { content }))
}

/// 读取原始字节，附带 Content-Type 与 Last-Modified。
pub async fn read_file_binary(
    ApiQuery(PathQuery { path }): ApiQuery<PathQuery>,
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
) -> Result<Response, ApiError> {
    let workspace = workspaces.for_tenant(&tenant);
    let target = workspace.resolve(&path)?;
    let guard = lock_shared(&locks, &tenant, &config).await?;
    let (bytes, modified) =
        run_locked(guard, move || read_regular_file(&workspace, &target)).await?;

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("invalid mime type".into()))?,
    );
    if let Some(modified) = modified {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("failed to build response header".into()))?,
        );
    }
    debug!(path, size = bytes.len(), "read file binary");
    Ok((StatusCode::OK, headers, bytes).into_response())
}

/// 递归创建目录，已存在时视为成功。
pub async fn make_dir(
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
    ApiJson(PathBody { path }): ApiJson<PathBody>,
) -> Result<JsonResponse<CreatedResponse>, ApiError> {
    let workspace = workspaces.for_tenant(&tenant);
    let target = workspace.resolve(&path)?;
    if workspace.is_root(&target) {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let guard = lock_exclusive(&locks, &tenant, &config).await?;
    run_locked(guard, move || {
        workspace.require_root()?;
        workspace.check_links(&target)?;
        match fs::metadata(&target) {
            Ok(metadata) if !metadata.is_dir() => {
                return Err(ApiError::Conflict("a file already exists at path".into()));
            }
            Ok(_) => return Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&target)?;
        Ok(())
    })
    .await?;
    info!(path, "create directory");
    Ok(JsonResponse(CreatedResponse { created: true }))
}

/// 以 UTF-8 文本整体写入文件，自动创建父目录并原子替换。
pub async fn write_file(
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
    ApiJson(WriteBody { path, content }): ApiJson<WriteBody>,
) -> Result<JsonResponse<WriteResponse>, ApiError> {
    let size = content.len();
    write_contents(
        &tenant,
        &workspaces,
        &locks,
        &config,
        &path,
        content.into_bytes(),
    )
    .await?;
    info!(path, size, "write file");
    Ok(JsonResponse(WriteResponse { written: true }))
}

/// 写入 multipart 表单中的二进制内容：`path` 字段给出目标路径，`file` 字段为文件内容。
pub async fn write_file_binary(
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<JsonResponse<WriteResponse>, ApiError> {
    let BinaryUpload { path, contents } = read_binary_upload(multipart?).await?;
    let size = contents.len();
    write_contents(&tenant, &workspaces, &locks, &config, &path, contents).await?;
    info!(path, size, "write file binary");
    Ok(JsonResponse(WriteResponse { written: true }))
}

struct BinaryUpload {
    path: String,
    contents: Bytes,
}

/// 只在请求体读取阶段解析表单，不持有租户锁。未知字段忽略。
async fn read_binary_upload(mut multipart: Multipart) -> Result<BinaryUpload, ApiError> {
    let mut path = None;
    let mut contents = None;
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_owned);
        match name.as_deref() {
            Some("path") => path = Some(field.text().await?),
            Some("file") => contents = Some(field.bytes().await?),
            _ => {}
        }
    }
    let path = path.ok_or_else(|| ApiError::BadRequest("missing path field".into()))?;
    let contents =
        contents.ok_or_else(|| ApiError::BadRequest("missing file field".into()))?;
    Ok(BinaryUpload { path, contents })
}

/// 删除文件或目录（目录递归删除），不允许删除工作区根目录。
pub async fn remove_entry(
    ApiQuery(PathQuery { path }): ApiQuery<PathQuery>,
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
) -> Result<JsonResponse<RemovedResponse>, ApiError> {
    let workspace = workspaces.for_tenant(&tenant);
    let target = workspace.resolve(&path)?;
    if workspace.is_root(&target) {
        return Err(ApiError::BadRequest("cannot remove workspace root".into()));
    }
    let guard = lock_exclusive(&locks, &tenant, &config).await?;
    run_locked(guard, move || {
        workspace.check_links(&target)?;
        if fs::symlink_metadata(&target)?.is_dir() {
            fs::remove_dir_all(&target)?;
        } else {
            fs::remove_file(&target)?;
        }
        Ok(())
    })
    .await?;
    info!(path, "remove entry");
    Ok(JsonResponse(RemovedResponse { removed: true }))
}

/// 在原父目录内修改节点名称。
///
/// `newName` 只能是单个名称，不能借重命名把节点移动到别的目录。
/// 目标路径由源路径的父目录与新名称拼出后，再做一次根目录边界校验。
/// 目标已存在时拒绝，保证除源节点外不触碰其他节点。
pub async fn rename_entry(
    Extension(tenant): Extension<TenantId>,
    Extension(workspaces): Extension<Arc<Workspaces>>,
    Extension(locks): Extension<Arc<TenantLocks>>,
    Extension(config): Extension<Arc<FsConfig>>,
    ApiJson(RenameBody { path, new_name }): ApiJson<RenameBody>,
) -> Result<JsonResponse<RenameResponse>, ApiError> {
    let name = validate_new_name(&new_name)?;
    let workspace = workspaces.for_tenant(&tenant);
    let source = workspace.resolve(&path)?;
    let destination = source
        .parent()
        .map(|parent| parent.join(name))
        .and_then(|candidate| workspace.contain(&candidate).ok())
        .ok_or_else(|| ApiError::PathTraversal(new_name.clone()))?;

    let guard = lock_exclusive(&locks, &tenant, &config).await?;
    run_locked(guard, move || rename_within(&workspace, &source, &destination)).await?;
    info!(path, new_name = name, "rename entry");
    Ok(JsonResponse(RenameResponse { renamed: true }))
}

fn rename_within(
    workspace: &Workspace,
    source: &Path,
    destination: &Path,
) -> Result<(), ApiError> {
    workspace.check_links(source)?;
    workspace.check_links(destination)?;
    fs::symlink_metadata(source)?;
    if source == destination {
        return Ok(());
    }
    match fs::symlink_metadata(destination) {
        Ok(_) => return Err(ApiError::Conflict("destination already exists".into())),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => return Err(err.into()),
    }
    fs::rename(source, destination)?;
    Ok(())
}

/// 校验新名称：去掉首尾空白后非空，且不含路径分隔符。
///
/// 含 `..` 段的名称按越界处理，其余带分隔符的名称按请求错误处理。
fn validate_new_name(raw: &str) -> Result<&str, ApiError> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(ApiError::BadRequest("invalid new name".into()));
    }
    if name
        .split(['/', '\\'])
        .any(|segment| segment.trim() == "..")
    {
        return Err(ApiError::PathTraversal(raw.to_string()));
    }
    if name.contains(['/', '\\', '\0']) || name == "." {
        return Err(ApiError::BadRequest("invalid new name".into()));
    }
    Ok(name)
}

async fn write_contents(
    tenant: &TenantId,
    workspaces: &Workspaces,
    locks: &TenantLocks,
    config: &FsConfig,
    path: &str,
    contents: impl AsRef<[u8]> + Send + 'static,
) -> Result<(), ApiError> {
    let workspace = workspaces.for_tenant(tenant);
    let target = workspace.resolve(path)?;
    if workspace.is_root(&target) {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    let guard = lock_exclusive(locks, tenant, config).await?;
    run_locked(guard, move || {
        workspace.require_root()?;
        workspace.check_links(&target)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        if target.is_dir() {
            return Err(ApiError::BadRequest("path is a directory".into()));
        }
        write_atomic(&target, contents.as_ref())?;
        Ok(())
    })
    .await
}

fn read_regular_file(
    workspace: &Workspace,
    target: &Path,
) -> Result<(Vec<u8>, Option<SystemTime>), ApiError> {
    workspace.check_links(target)?;
    let metadata = fs::metadata(target)?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }
    Ok((fs::read(target)?, metadata.modified().ok()))
}

async fn lock_shared(
    locks: &TenantLocks,
    tenant: &TenantId,
    config: &FsConfig,
) -> Result<TenantReadGuard, ApiError> {
    match config.lock_wait {
        Some(wait) => Ok(locks.read_with_timeout(tenant.as_str(), wait).await?),
        None => Ok(locks.read(tenant.as_str()).await),
    }
}

async fn lock_exclusive(
    locks: &TenantLocks,
    tenant: &TenantId,
    config: &FsConfig,
) -> Result<TenantWriteGuard, ApiError> {
    match config.lock_wait {
        Some(wait) => Ok(locks.write_with_timeout(tenant.as_str(), wait).await?),
        None => Ok(locks.write(tenant.as_str()).await),
    }
}

/// 在阻塞线程中执行存储调用，守卫随闭包一起移动。
///
/// 请求 future 被丢弃（客户端断开、超时）时，阻塞任务仍会跑完，
/// 锁在存储调用结束后才释放。
async fn run_locked<G, T, F>(guard: G, op: F) -> Result<T, ApiError>
where
    G: Send + 'static,
    T: Send + 'static,
    F: FnOnce() -> Result<T, ApiError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let result = op();
        drop(guard);
        result
    })
    .await
    .map_err(|err| ApiError::Internal(err.to_string()))?
}
