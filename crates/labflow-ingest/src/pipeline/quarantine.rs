//! Moving rejected files out of the inbox

use chrono::Utc;
use labflow_common::checksum::file_sha256;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Suffix of the note written next to every quarantined file
pub const REASON_SUFFIX: &str = ".reason.txt";

/// Destination for `file_name` that does not overwrite an earlier rejection
fn free_target(dir: &Path, file_name: &str) -> PathBuf {
    let target = dir.join(file_name);
    if !target.exists() {
        return target;
    }

    let original = Path::new(file_name);
    let stem = original
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(file_name);
    let extension = original.extension().and_then(|e| e.to_str());
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3f");

    let mut counter = 0u32;
    loop {
        let suffix = if counter == 0 {
            stamp.to_string()
        } else {
            format!("{stamp}-{counter}")
        };
        let name = match extension {
            Some(ext) => format!("{stem}.{suffix}.{ext}"),
            None => format!("{stem}.{suffix}"),
        };
        let candidate = dir.join(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// Move `source` into `quarantine_dir` and write a sibling reason note.
///
/// Returns the quarantined path. Once the file has moved, a note that cannot
/// be written is only logged: the file is quarantined either way.
pub fn quarantine_file(source: &Path, quarantine_dir: &Path, reason: &str) -> io::Result<PathBuf> {
    let file_name = source
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "source has no file name"))?;

    std::fs::create_dir_all(quarantine_dir)?;
    let checksum = file_sha256(source).unwrap_or_else(|_| "unavailable".to_string());
    let target = free_target(quarantine_dir, file_name);

    if std::fs::rename(source, &target).is_err() {
        // Inbox and quarantine on different filesystems
        std::fs::copy(source, &target)?;
        std::fs::remove_file(source)?;
    }

    let note = format!(
        "file: {file_name}\nchecksum: {checksum}\nquarantined_at: {}\nreason: {reason}\n",
        Utc::now().to_rfc3339()
    );
    let mut note_name = target.as_os_str().to_owned();
    note_name.push(REASON_SUFFIX);
    let note_path = PathBuf::from(note_name);
    if let Err(e) = std::fs::write(&note_path, note) {
        warn!(
            file = %file_name,
            note = %note_path.display(),
            error = %e,
            "Quarantined file but could not write its reason note"
        );
    }

    Ok(target)
}
