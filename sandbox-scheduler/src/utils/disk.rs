use std::path::Path;

use sysinfo::Disks;

#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    #[error("No disk found holding {0}")]
    NoDisk(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Free space in MB on the disk holding `path`.
///
/// `path` may not exist yet; its closest existing ancestor is used.
pub fn free_space_mb(path: &Path) -> Result<u64, DiskError> {
    let mut existing = path.to_path_buf();
    while !existing.exists() {
        if !existing.pop() {
            break;
        }
    }
    let existing = if existing.as_os_str().is_empty() {
        std::env::current_dir()?
    } else {
        existing.canonicalize()?
    };

    let disks = Disks::new_with_refreshed_list();
    let disk = disks
        .iter()
        .filter(|d| existing.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .ok_or_else(|| DiskError::NoDisk(existing.display().to_string()))?;

    Ok(disk.available_space() / (1024 * 1024))
}

/// Format a size in MB in human-readable form
pub fn format_size_mb(size_mb: u64) -> String {
    if size_mb >= 1024 {
        format!("{:.2} GB", size_mb as f64 / 1024.0)
    } else {
        format!("{} MB", size_mb)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size_mb() {
        assert_eq!(format_size_mb(512), "512 MB");
        assert_eq!(format_size_mb(2048), "2.00 GB");
    }

    #[test]
    fn test_missing_path_uses_existing_ancestor() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("storage").join("analyses");

        // Containers without a visible mount table report no disks at all
        match free_space_mb(&missing) {
            Ok(_) | Err(DiskError::NoDisk(_)) => {}
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
}
