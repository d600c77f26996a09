use std::{
    ffi::CString,
    io::Write,
    os::unix::{ffi::OsStrExt, fs::MetadataExt},
    path::Path,
};

use anyhow::{Context, bail};
use libbtfs::XATTR_IS_BTFS;

/// Download progress of a file in percent, from its size and the 512-byte
/// blocks the filesystem says are backed by data.
pub fn progress_percent(size: u64, blocks: u64) -> u64 {
    if size == 0 {
        return 100;
    }
    (100.0 * 512.0 * blocks as f64 / size as f64).round() as u64
}

fn has_btfs_marker(path: &Path) -> std::io::Result<()> {
    let c_path = CString::new(path.as_os_str().as_bytes())?;
    let c_name = CString::new(XATTR_IS_BTFS)?;
    // SAFETY: both strings are NUL-terminated, a NULL buffer of size 0 only
    // asks for the value's length.
    #[cfg(target_os = "macos")]
    let res = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            std::ptr::null_mut(),
            0,
            0,
            0,
        )
    };
    #[cfg(not(target_os = "macos"))]
    let res = unsafe { libc::getxattr(c_path.as_ptr(), c_name.as_ptr(), std::ptr::null_mut(), 0) };
    if res < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn sorted_children(dir: &Path) -> Vec<std::ffi::OsString> {
    let mut names: Vec<_> = match std::fs::read_dir(dir) {
        Ok(rd) => rd.filter_map(|e| e.ok()).map(|e| e.file_name()).collect(),
        Err(_) => return Vec::new(),
    };
    names.sort();
    names
}

/// Print `path` and, for directories, everything below it.
pub fn scan(out: &mut impl Write, indent: &str, path: &Path) -> std::io::Result<()> {
    let meta = match std::fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(_) => return Ok(()),
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    if meta.is_dir() {
        writeln!(out, "{indent}{name}/")?;
        let indent = format!("{indent}    ");
        for child in sorted_children(path) {
            scan(out, &indent, &path.join(child))?;
        }
    } else if meta.is_file() {
        let progress = progress_percent(meta.size(), meta.blocks());
        writeln!(out, "{indent}{name} ({progress:3}%)")?;
    }
    Ok(())
}

pub fn stat(mountpoints: &[std::path::PathBuf]) -> anyhow::Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    for mountpoint in mountpoints {
        if let Err(e) = has_btfs_marker(mountpoint) {
            bail!("{mountpoint:?} is not a btfs mount: {e}");
        }
        let root = std::fs::canonicalize(mountpoint)
            .with_context(|| format!("failed to canonicalize {mountpoint:?}"))?;
        scan(&mut out, "", &root).context("error writing to stdout")?;
    }
    Ok(())
}
