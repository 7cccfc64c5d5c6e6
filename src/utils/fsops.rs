//! Filesystem helpers shared by the stages.
//!
//! Async I/O only (tokio); nothing here fails silently. Paths always come in
//! from the caller so tests can run against scratch trees.

use anyhow::{Context, Result};
use log::{debug, warn};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::AsyncReadExt;

/// Recursively collect all regular files under `root`, as absolute paths.
pub async fn collect_files_recursive(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out: Vec<PathBuf> = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let mut rd = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("read_dir failed: {dir:?}"))?;
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            let meta = ent.metadata().await?;
            if meta.is_dir() {
                stack.push(p);
            } else if meta.is_file() {
                out.push(p);
            }
        }
    }
    Ok(out)
}

/// Copy a directory tree, preserving Unix permission bits best-effort.
///
/// Returns the number of files copied.
pub async fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<usize> {
    debug!(
        "[PHASE: install] [STEP: files] copy_dir_recursive (src={:?}, dst={:?})",
        src, dst
    );

    let files = collect_files_recursive(src).await?;
    for file in &files {
        let rel = file
            .strip_prefix(src)
            .with_context(|| format!("path {file:?} not under {src:?}"))?;
        let target = dst.join(rel);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create_dir_all failed: {parent:?}"))?;
        }
        tokio::fs::copy(file, &target)
            .await
            .with_context(|| format!("copy failed: {file:?} -> {target:?}"))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(meta) = tokio::fs::metadata(file).await {
                let mode = meta.permissions().mode();
                let _ = tokio::fs::set_permissions(&target, std::fs::Permissions::from_mode(mode))
                    .await;
            }
        }
    }
    Ok(files.len())
}

/// SHA-256 of a file, lowercase hex.
pub async fn file_sha256(path: &Path) -> Result<String> {
    let mut f = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("open failed: {path:?}"))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Copy `src` to a sibling backup named `<src>.bak-<YYYYmmdd-HHMMSS>` and
/// verify the copy byte-identical via SHA-256. Returns the backup path.
pub async fn backup_with_timestamp(src: &Path) -> Result<PathBuf> {
    let ts = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let mut name = src
        .file_name()
        .ok_or_else(|| anyhow::anyhow!("backup source has no file name: {src:?}"))?
        .to_os_string();
    name.push(format!(".bak-{ts}"));
    let backup = src.with_file_name(name);

    tokio::fs::copy(src, &backup)
        .await
        .with_context(|| format!("backup copy failed: {src:?} -> {backup:?}"))?;

    let src_sha = file_sha256(src).await?;
    let bak_sha = file_sha256(&backup).await?;
    if src_sha != bak_sha {
        anyhow::bail!("backup verification failed: checksum mismatch for {backup:?}");
    }

    Ok(backup)
}

/// Remove whatever sits at `path`: a symlink is unlinked, a directory removed
/// recursively, a file deleted. Missing paths are fine.
pub async fn remove_path_any(path: &Path) -> Result<()> {
    let meta = match tokio::fs::symlink_metadata(path).await {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(anyhow::Error::new(e)).with_context(|| format!("stat failed: {path:?}"))
        }
    };

    if meta.file_type().is_symlink() || meta.is_file() {
        tokio::fs::remove_file(path)
            .await
            .with_context(|| format!("remove_file failed: {path:?}"))?;
    } else {
        tokio::fs::remove_dir_all(path)
            .await
            .with_context(|| format!("remove_dir_all failed: {path:?}"))?;
    }
    Ok(())
}

/// Apply a regex replacement in-place. Returns true if the file changed.
pub async fn replace_in_file(path: &Path, pattern: &Regex, replacement: &str) -> Result<bool> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read failed: {path:?}"))?;
    let replaced = pattern.replace_all(&contents, replacement);
    if replaced == contents {
        return Ok(false);
    }
    tokio::fs::write(path, replaced.as_bytes())
        .await
        .with_context(|| format!("write failed: {path:?}"))?;
    Ok(true)
}

/// Apply a regex replacement in-place, first match only. Returns true if the
/// file changed.
pub async fn replace_first_in_file(
    path: &Path,
    pattern: &Regex,
    replacement: &str,
) -> Result<bool> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("read failed: {path:?}"))?;
    let replaced = pattern.replace(&contents, replacement);
    if replaced == contents {
        return Ok(false);
    }
    tokio::fs::write(path, replaced.as_bytes())
        .await
        .with_context(|| format!("write failed: {path:?}"))?;
    Ok(true)
}

/// Recursively chmod every file and directory under (and including) `root`.
#[cfg(unix)]
pub async fn set_permissions_recursive(root: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        tokio::fs::set_permissions(&dir, std::fs::Permissions::from_mode(mode))
            .await
            .with_context(|| format!("chmod failed: {dir:?}"))?;
        let mut rd = match tokio::fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(_) => continue, // not a directory
        };
        while let Some(ent) = rd.next_entry().await? {
            let p = ent.path();
            if ent.metadata().await?.is_dir() {
                stack.push(p);
            } else {
                tokio::fs::set_permissions(&p, std::fs::Permissions::from_mode(mode))
                    .await
                    .with_context(|| format!("chmod failed: {p:?}"))?;
            }
        }
    }
    Ok(())
}

/// Create `link` as a symlink to `target`, replacing whatever was there.
#[cfg(unix)]
pub async fn force_symlink(target: &Path, link: &Path) -> Result<()> {
    remove_path_any(link).await?;
    tokio::fs::symlink(target, link)
        .await
        .with_context(|| format!("symlink failed: {link:?} -> {target:?}"))?;
    Ok(())
}

/// Best-effort recursive delete; failures are logged and swallowed.
pub async fn remove_path_best_effort(path: &Path) {
    if let Err(e) = remove_path_any(path).await {
        warn!(
            "[PHASE: install] [STEP: files] best-effort removal failed (path={:?}): {}",
            path, e
        );
    }
}
