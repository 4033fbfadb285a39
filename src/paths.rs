//! 路径解析：把不可信的相对路径限制在租户根目录之内。
//!
//! 解析是纯词法的：`.`、`..` 与多余分隔符在拼接后折叠，目标不需要存在。
//! 反斜杠一律视为分隔符，避免 `..\\..\\etc` 这类外来平台写法在 Unix 上
//! 以文件名形式混过校验。符号链接的检查需要访问磁盘，见 `workspace`。

use std::path::{Component, Path, PathBuf};

/// 解析结果越出了租户根目录。
///
/// `path` 保存被拒绝的原始输入，仅用于服务端日志，不会返回给调用方。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("path escapes workspace root: {path}")]
pub struct PathTraversal {
    pub path: String,
}

impl PathTraversal {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

/// 将 `relative` 拼接到 `root` 下并规范化，结果必须等于 `root` 或位于其下。
///
/// 空字符串解析为 `root` 本身。是否越界只看最终的规范形式：
/// `a/../b` 可以接受，`../../etc/passwd` 会被拒绝。
pub fn resolve_within_root(root: &Path, relative: &str) -> Result<PathBuf, PathTraversal> {
    let normalized = relative.replace('\\', "/");
    let trimmed = normalized.trim_start_matches('/');
    let candidate = if trimmed.is_empty() {
        root.to_path_buf()
    } else {
        root.join(trimmed)
    };
    ensure_within_root(root, &candidate).map_err(|_| PathTraversal::new(relative))
}

/// 对已构造好的绝对路径做同样的边界校验，返回规范化后的路径。
pub fn ensure_within_root(root: &Path, candidate: &Path) -> Result<PathBuf, PathTraversal> {
    let root = clean(root);
    let cleaned = clean(candidate);
    // Path::starts_with 按组件比较，`/data/u1` 不会匹配 `/data/u10`。
    if cleaned == root || cleaned.starts_with(&root) {
        Ok(cleaned)
    } else {
        Err(PathTraversal::new(candidate.to_string_lossy()))
    }
}

/// 词法规范化：去掉 `.`，用 `..` 弹出上一级；在根处的 `..` 被吸收。
pub fn clean(path: &Path) -> PathBuf {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return PathBuf::from(".");
    }
    parts.iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/workspaces/u1")
    }

    #[test]
    fn empty_path_resolves_to_root() {
        assert_eq!(resolve_within_root(&root(), ""), Ok(root()));
        assert_eq!(resolve_within_root(&root(), "/"), Ok(root()));
        assert_eq!(resolve_within_root(&root(), "."), Ok(root()));
    }

    #[test]
    fn nested_path_stays_inside() {
        assert_eq!(
            resolve_within_root(&root(), "a/b"),
            Ok(root().join("a").join("b"))
        );
        assert_eq!(
            resolve_within_root(&root(), "a//./b/"),
            Ok(root().join("a").join("b"))
        );
    }

    #[test]
    fn parent_segments_collapsing_inside_are_accepted() {
        assert_eq!(resolve_within_root(&root(), "a/../b"), Ok(root().join("b")));
        assert_eq!(resolve_within_root(&root(), "a/.."), Ok(root()));
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let err = resolve_within_root(&root(), "../../etc/passwd").unwrap_err();
        assert_eq!(err.path, "../../etc/passwd");
        assert!(resolve_within_root(&root(), "..").is_err());
        assert!(resolve_within_root(&root(), "a/../../u2/secret").is_err());
    }

    #[test]
    fn walking_out_and_back_is_judged_on_final_form() {
        // 最终形式回到了根目录之内
        assert_eq!(
            resolve_within_root(&root(), "../u1/notes.txt"),
            Ok(root().join("notes.txt"))
        );
    }

    #[test]
    fn sibling_with_shared_prefix_is_rejected() {
        assert!(resolve_within_root(&root(), "../u10/file").is_err());
        assert!(ensure_within_root(&root(), Path::new("/srv/workspaces/u10")).is_err());
        assert!(ensure_within_root(&root(), Path::new("/srv/workspaces/u1x/a")).is_err());
    }

    #[test]
    fn backslash_segments_are_treated_as_separators() {
        assert!(resolve_within_root(&root(), "..\\..\\etc\\passwd").is_err());
        assert_eq!(
            resolve_within_root(&root(), "a\\b"),
            Ok(root().join("a").join("b"))
        );
    }

    #[test]
    fn absolute_input_is_rooted_under_workspace() {
        assert_eq!(
            resolve_within_root(&root(), "/etc/passwd"),
            Ok(root().join("etc").join("passwd"))
        );
    }

    #[test]
    fn trailing_slash_on_root_does_not_matter() {
        let with_slash = PathBuf::from("/srv/workspaces/u1/");
        assert_eq!(resolve_within_root(&with_slash, "a"), Ok(root().join("a")));
        assert!(resolve_within_root(&with_slash, "../u10").is_err());
    }

    #[test]
    fn clean_absorbs_parent_at_filesystem_root() {
        assert_eq!(clean(Path::new("/../a")), PathBuf::from("/a"));
        assert_eq!(clean(Path::new("a/./b/../c")), PathBuf::from("a/c"));
    }
}
