//! Directory listing and timestamp formatting

use std::fs::{FileType, Metadata};
use std::os::unix::fs::{FileTypeExt, MetadataExt};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::Result;
use crate::vfs::{basename, Jail, PathPair};

/// Flags accepted by LIST.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// `-a`: include entries starting with a dot
    pub all: bool,
}

/// Splits leading `-flag` groups off a LIST argument.
///
/// Only `a` has a meaning; other flags are accepted and ignored. The rest of
/// the argument, trimmed, is the path; empty means the working directory.
pub fn parse_list_args(arg: &str) -> (ListOptions, &str) {
    let mut opts = ListOptions::default();
    let mut rest = arg.trim_start_matches([' ', '\t']);

    while let Some(group) = rest.strip_prefix('-') {
        let end = group.find([' ', '\t']).unwrap_or(group.len());
        if group[..end].contains('a') {
            opts.all = true;
        }
        rest = group[end..].trim_start_matches([' ', '\t']);
    }

    (opts, rest.trim())
}

/// `ls`-style file type character.
pub fn mode_char(file_type: FileType) -> char {
    if file_type.is_dir() {
        'd'
    } else if file_type.is_symlink() {
        'l'
    } else if file_type.is_char_device() {
        'c'
    } else if file_type.is_block_device() {
        'b'
    } else if file_type.is_fifo() {
        'p'
    } else if file_type.is_socket() {
        's'
    } else {
        '-'
    }
}

/// Format permission bits as an rwx string
pub fn format_mode(mode: u32) -> String {
    const BITS: [(u32, char); 9] = [
        (0o400, 'r'),
        (0o200, 'w'),
        (0o100, 'x'),
        (0o040, 'r'),
        (0o020, 'w'),
        (0o010, 'x'),
        (0o004, 'r'),
        (0o002, 'w'),
        (0o001, 'x'),
    ];
    BITS.iter()
        .map(|(bit, c)| if mode & bit != 0 { *c } else { '-' })
        .collect()
}

/// Modification time of `md` in UTC.
pub fn mtime(md: &Metadata) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(md.mtime(), 0).unwrap_or_default()
}

/// `YYYYMMDDHHMMSS`, as used by MDTM.
pub fn format_mdtm(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S").to_string()
}

/// One listing line, CRLF terminated.
pub fn list_line(name: &str, md: &Metadata) -> String {
    format!(
        "{}{} {} {} {} {} {} {}\r\n",
        mode_char(md.file_type()),
        format_mode(md.mode()),
        md.nlink(),
        md.uid(),
        md.gid(),
        md.size(),
        mtime(md).format("%b %-d %H:%M"),
        name
    )
}

/// Builds the listing for `target`, already stat'ed as `md`.
///
/// A directory lists its entries in name order; entries whose stat fails are
/// skipped. Anything else lists itself.
pub async fn render(
    jail: &Jail,
    target: &PathPair,
    md: &Metadata,
    opts: ListOptions,
) -> Result<Vec<String>> {
    if !md.is_dir() {
        return Ok(vec![list_line(basename(&target.virtual_path), md)]);
    }

    let mut lines = Vec::new();
    for name in jail.read_dir(target).await? {
        if name.starts_with('.') && !opts.all {
            continue;
        }
        match jail.stat(&target.virtual_path, &name).await {
            Ok((_, entry)) => lines.push(list_line(&name, &entry)),
            Err(e) => debug!(entry = %name, error = %e, "skipping unlistable entry"),
        }
    }
    Ok(lines)
}
