use std::env;
use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use directories::ProjectDirs;
use thiserror::Error;

/// All file access goes through one of these five roots. Overridable via
/// environment for container mounts.
pub const ENV_CONFIG_DIR: &str = "MEDIAVAULT_CONFIG_DIR";
pub const ENV_DATA_DIR: &str = "MEDIAVAULT_DATA_DIR";
pub const ENV_DOWNLOADS_DIR: &str = "MEDIAVAULT_DOWNLOADS_DIR";
pub const ENV_LOG_DIR: &str = "MEDIAVAULT_LOG_DIR";
pub const ENV_TOKENS_DIR: &str = "MEDIAVAULT_TOKENS_DIR";

#[derive(Debug, Error)]
pub enum PathError {
    /// The resolved path escapes its base root.
    #[error("path must be within base directory {base}: {path}")]
    InvalidPath { base: PathBuf, path: PathBuf },
}

/// The five base roots fixed at process start.
#[derive(Debug, Clone)]
pub struct BaseRoots {
    pub config: PathBuf,
    pub data: PathBuf,
    pub downloads: PathBuf,
    pub logs: PathBuf,
    pub tokens: PathBuf,
}

impl BaseRoots {
    /// Resolve roots from the environment, defaulting under the per-user
    /// app data directory.
    pub fn from_env() -> Result<Self> {
        let dirs = ProjectDirs::from("com", "mediavault", "mediavault")
            .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))?;
        let base = dirs.data_dir().to_path_buf();

        Ok(Self {
            config: env_path(ENV_CONFIG_DIR, base.join("config")),
            data: env_path(ENV_DATA_DIR, base.clone()),
            downloads: env_path(ENV_DOWNLOADS_DIR, base.join("downloads")),
            logs: env_path(ENV_LOG_DIR, base.join("logs")),
            tokens: env_path(ENV_TOKENS_DIR, base.join("tokens")),
        })
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.config,
            &self.data,
            &self.downloads,
            &self.logs,
            &self.tokens,
        ] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create base dir: {}", dir.display()))?;
        }
        Ok(())
    }
}

fn env_path(name: &str, default: PathBuf) -> PathBuf {
    match env::var_os(name) {
        Some(value) if !value.is_empty() => absolutize(PathBuf::from(value)),
        _ => absolutize(default),
    }
}

fn absolutize(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        env::current_dir()
            .map(|cwd| cwd.join(&path))
            .unwrap_or(path)
    }
}

/// Everything the engine needs to know about where state lives.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    pub log_dir: PathBuf,
    pub db_path: PathBuf,
    pub search_db_path: PathBuf,
    pub temp_downloads_dir: PathBuf,
    pub library_dir: PathBuf,
    pub lock_file: PathBuf,
    pub ytdlp_temp_dir: PathBuf,
    pub thumbs_dir: PathBuf,
    pub client_delivery_dir: PathBuf,
    pub tools_dir: PathBuf,
}

impl EnginePaths {
    pub fn build(roots: &BaseRoots) -> Self {
        let ytdlp_temp_dir = roots.data.join("tmp").join("yt-dlp");
        Self {
            log_dir: roots.logs.clone(),
            db_path: roots.data.join("database").join("main.db"),
            search_db_path: roots.data.join("database").join("search.db"),
            temp_downloads_dir: roots.data.join("temp_downloads"),
            library_dir: roots.downloads.clone(),
            lock_file: roots.data.join("tmp").join("mediavault.lock"),
            thumbs_dir: ytdlp_temp_dir.join("thumbs"),
            client_delivery_dir: roots.data.join("temp_downloads").join("client_delivery"),
            tools_dir: roots.data.join("tools"),
            ytdlp_temp_dir,
        }
    }
}

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create dir: {}", path.display()))
}

/// Resolve `path` against `base_dir` and reject anything that escapes it.
///
/// Relative paths resolve inside the base; absolute paths must already be
/// within it. Symlinks are followed before the containment check, so a link
/// pointing outside the root fails the same way a `..` does.
pub fn resolve_dir(path: Option<&str>, base_dir: &Path) -> Result<PathBuf, PathError> {
    let raw = match path {
        None => return Ok(base_dir.to_path_buf()),
        Some(p) if p.trim().is_empty() => return Ok(base_dir.to_path_buf()),
        Some(p) => p.trim(),
    };

    let candidate = if Path::new(raw).is_absolute() {
        PathBuf::from(raw)
    } else {
        base_dir.join(raw)
    };

    let real = canonicalize_lenient(&candidate);
    let real_base = canonicalize_lenient(base_dir);
    if !real.starts_with(&real_base) {
        return Err(PathError::InvalidPath {
            base: base_dir.to_path_buf(),
            path: candidate,
        });
    }
    Ok(real)
}

/// Resolve a config file path against the config root; defaults to
/// `config.json` inside it.
pub fn resolve_config_path(path: Option<&str>, config_dir: &Path) -> Result<PathBuf, PathError> {
    match path {
        None => Ok(config_dir.join("config.json")),
        Some(p) if p.trim().is_empty() => Ok(config_dir.join("config.json")),
        Some(p) => resolve_dir(Some(p), config_dir),
    }
}

/// Like `fs::canonicalize` but tolerant of a not-yet-existing tail: the
/// deepest existing ancestor is canonicalized (following symlinks) and the
/// remaining components are appended after lexical `..` normalization.
fn canonicalize_lenient(path: &Path) -> PathBuf {
    let mut existing = path.to_path_buf();
    let mut tail: Vec<std::ffi::OsString> = Vec::new();
    loop {
        match fs::canonicalize(&existing) {
            Ok(real) => {
                let mut out = real;
                for part in tail.iter().rev() {
                    out.push(part);
                }
                return normalize_lexical(&out);
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    tail.push(name.to_os_string());
                    existing = parent.to_path_buf();
                }
                _ => return normalize_lexical(path),
            },
        }
    }
}

fn normalize_lexical(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_relative_inside_base() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path();
        let resolved = resolve_dir(Some("music/albums"), base).unwrap();
        assert!(resolved.starts_with(fs::canonicalize(base).unwrap()));
        assert!(resolved.ends_with("music/albums"));
    }

    #[test]
    fn test_resolve_none_returns_base() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(resolve_dir(None, tmp.path()).unwrap(), tmp.path());
    }

    #[test]
    fn test_reject_dotdot_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let err = resolve_dir(Some("../outside"), tmp.path()).unwrap_err();
        assert!(matches!(err, PathError::InvalidPath { .. }));
    }

    #[test]
    fn test_reject_absolute_outside_base() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let outside = other.path().join("dir");
        let err = resolve_dir(Some(outside.to_str().unwrap()), tmp.path()).unwrap_err();
        assert!(matches!(err, PathError::InvalidPath { .. }));
    }

    #[test]
    fn test_absolute_inside_base_allowed() {
        let tmp = tempfile::tempdir().unwrap();
        let inside = tmp.path().join("nested");
        fs::create_dir_all(&inside).unwrap();
        let resolved = resolve_dir(Some(inside.to_str().unwrap()), tmp.path()).unwrap();
        assert!(resolved.ends_with("nested"));
    }

    #[cfg(unix)]
    #[test]
    fn test_reject_symlink_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let link = tmp.path().join("link");
        std::os::unix::fs::symlink(other.path(), &link).unwrap();
        let err = resolve_dir(Some("link/sub"), tmp.path()).unwrap_err();
        assert!(matches!(err, PathError::InvalidPath { .. }));
    }

    #[test]
    fn test_config_path_default() {
        let tmp = tempfile::tempdir().unwrap();
        let resolved = resolve_config_path(None, tmp.path()).unwrap();
        assert!(resolved.ends_with("config.json"));
    }
}
