//! Virtual filesystem jail
//!
//! Client paths are mapped onto a real subtree purely lexically: the resolver
//! never consults the filesystem and never lets `..` climb above `/`. The only
//! place a virtual path meets the real filesystem is [`Jail::real_path`], which
//! prefixes the jail root.

use std::ffi::OsString;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncSeekExt;
use tracing::debug;

use crate::error::{FtpError, Result};

/// Longest virtual path, in bytes, including room for a terminator.
pub const MAX_PATH: usize = 1024;
/// Longest file name accepted for transfers, in bytes.
pub const MAX_NAME: usize = 256;

/// Path resolution failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// The resolved path would not fit in [`MAX_PATH`]
    #[error("path exceeds {limit} bytes")]
    NameTooLong {
        /// The limit that was hit
        limit: usize,
    },
}

impl From<VfsError> for FtpError {
    fn from(err: VfsError) -> Self {
        match err {
            VfsError::NameTooLong { .. } => FtpError::NameTooLong,
        }
    }
}

/// Resolves `path` against the virtual directory `cwd`.
///
/// Absolute input starts at `/`, relative input at `cwd`. `.` segments are
/// dropped, `..` pops one segment but never above `/`, repeated separators
/// collapse and a trailing separator is stripped unless the result is `/`.
/// On error no partial result is returned.
pub fn resolve(cwd: &str, path: &str) -> std::result::Result<String, VfsError> {
    let too_long = VfsError::NameTooLong { limit: MAX_PATH };
    let mut out = String::with_capacity(MAX_PATH);

    if path.starts_with('/') || cwd.is_empty() {
        out.push('/');
    } else {
        if cwd.len() >= MAX_PATH {
            return Err(too_long);
        }
        debug_assert!(cwd.starts_with('/'), "virtual cwd must be absolute");
        out.push_str(cwd);
    }

    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => pop_segment(&mut out),
            name => {
                if !out.ends_with('/') {
                    out.push('/');
                }
                if out.len() + name.len() >= MAX_PATH {
                    return Err(too_long);
                }
                out.push_str(name);
            }
        }
    }

    if out.len() > 1 && out.ends_with('/') {
        let trimmed = out.trim_end_matches('/').len().max(1);
        out.truncate(trimmed);
    }

    Ok(out)
}

fn pop_segment(out: &mut String) {
    let trimmed = out.trim_end_matches('/').len();
    out.truncate(trimmed);
    match out.rfind('/') {
        Some(0) | None => {
            out.clear();
            out.push('/');
        }
        Some(idx) => out.truncate(idx),
    }
}

/// Final path component, used as the transfer file name.
pub fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[idx + 1..],
        None => path,
    }
}

/// A resolved virtual path and its real counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathPair {
    /// Client visible path, always absolute and canonical
    pub virtual_path: String,
    /// `jail root + virtual_path`; never shown to the client
    pub real_path: PathBuf,
}

/// The bounded subtree a session may see.
#[derive(Debug, Clone)]
pub struct Jail {
    root: OsString,
    allow_symlinks: bool,
}

impl Jail {
    /// Creates a jail rooted at `root`.
    pub fn new(root: impl AsRef<Path>, allow_symlinks: bool) -> Self {
        let bytes = root.as_ref().as_os_str().as_bytes();
        let end = bytes.iter().rposition(|b| *b != b'/').map_or(0, |i| i + 1);
        Self {
            root: OsString::from_vec(bytes[..end].to_vec()),
            allow_symlinks,
        }
    }

    /// Root of the jail, without trailing separator (empty for `/`).
    pub fn root(&self) -> &Path {
        Path::new(&self.root)
    }

    /// Maps a canonical virtual path onto the real filesystem.
    pub fn real_path(&self, virtual_path: &str) -> PathBuf {
        let mut real = self.root.clone();
        real.push(virtual_path);
        PathBuf::from(real)
    }

    /// Resolves a client path relative to `cwd`. Pure; no filesystem access.
    pub fn resolve(&self, cwd: &str, path: &str) -> Result<PathPair> {
        let virtual_path = resolve(cwd, path)?;
        let real_path = self.real_path(&virtual_path);
        Ok(PathPair {
            virtual_path,
            real_path,
        })
    }

    /// Rejects paths that traverse a symlink when links are disallowed.
    ///
    /// Every existing component is checked; a link reports as not found.
    async fn check_links(&self, pair: &PathPair) -> Result<()> {
        if self.allow_symlinks {
            return Ok(());
        }

        let mut prefix = String::with_capacity(pair.virtual_path.len());
        for segment in pair.virtual_path.split('/').filter(|s| !s.is_empty()) {
            prefix.push('/');
            prefix.push_str(segment);
            match tokio::fs::symlink_metadata(self.real_path(&prefix)).await {
                Ok(md) if md.file_type().is_symlink() => {
                    debug!(path = %prefix, "symlink hidden by jail policy");
                    return Err(FtpError::NotFound);
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => break,
                Err(e) => return Err(FtpError::from_io(e)),
            }
        }
        Ok(())
    }

    async fn checked(&self, cwd: &str, path: &str) -> Result<PathPair> {
        let pair = self.resolve(cwd, path)?;
        self.check_links(&pair).await?;
        Ok(pair)
    }

    /// Stats the entry `path` names, following links only when allowed.
    pub async fn stat(&self, cwd: &str, path: &str) -> Result<(PathPair, Metadata)> {
        let pair = self.checked(cwd, path).await?;
        let md = tokio::fs::metadata(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        Ok((pair, md))
    }

    /// Opens an existing file for reading.
    pub async fn open(&self, cwd: &str, path: &str) -> Result<(PathPair, File)> {
        let pair = self.checked(cwd, path).await?;
        let file = File::open(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        Ok((pair, file))
    }

    /// Opens a file for writing. Offset 0 creates or truncates; a non-zero
    /// offset keeps the existing contents and positions the cursor there.
    pub async fn create(&self, cwd: &str, path: &str, offset: u64) -> Result<(PathPair, File)> {
        let pair = self.checked(cwd, path).await?;
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(FtpError::from_io)?;
        }
        Ok((pair, file))
    }

    /// Creates a directory.
    pub async fn mkdir(&self, cwd: &str, path: &str) -> Result<PathPair> {
        let pair = self.checked(cwd, path).await?;
        tokio::fs::create_dir(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        Ok(pair)
    }

    /// Removes an empty directory.
    pub async fn rmdir(&self, cwd: &str, path: &str) -> Result<PathPair> {
        let pair = self.checked(cwd, path).await?;
        if pair.virtual_path == "/" {
            return Err(FtpError::PermissionDenied);
        }
        tokio::fs::remove_dir(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        Ok(pair)
    }

    /// Removes a file.
    pub async fn unlink(&self, cwd: &str, path: &str) -> Result<PathPair> {
        let pair = self.checked(cwd, path).await?;
        tokio::fs::remove_file(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        Ok(pair)
    }

    /// Names in a directory, sorted, without `.` and `..`.
    pub async fn read_dir(&self, pair: &PathPair) -> Result<Vec<String>> {
        let mut dir = tokio::fs::read_dir(&pair.real_path)
            .await
            .map_err(FtpError::from_io)?;
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().await.map_err(FtpError::from_io)? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}
