// LogManager Service
// Log retention cleanup and tail reads for the control API

use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// `.log` files in a directory with their modification times, newest first
fn log_files(log_dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, String> {
    if !log_dir.exists() {
        return Ok(Vec::new());
    }

    let entries = fs::read_dir(log_dir).map_err(|e| format!("Failed to read log dir: {e}"))?;
    let mut files: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter(|entry| entry.path().extension().and_then(|ext| ext.to_str()) == Some("log"))
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|metadata| metadata.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (entry.path(), modified)
        })
        .collect();

    files.sort_by(|a, b| b.1.cmp(&a.1));
    Ok(files)
}

/// Delete log files older than the retention window; 0 keeps everything
pub fn prune_logs(log_dir: &Path, retention_days: u32) -> Result<usize, String> {
    if retention_days == 0 {
        return Ok(0);
    }

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs(u64::from(retention_days) * SECONDS_PER_DAY))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    let removed = log_files(log_dir)?
        .into_iter()
        .filter(|(_, modified)| *modified < cutoff)
        .filter(|(path, _)| match fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[Logs] Failed to remove {path:?}: {e}");
                false
            }
        })
        .count();

    if removed > 0 {
        log::info!("[Logs] Pruned {removed} log file(s) older than {retention_days} days");
    }
    Ok(removed)
}

/// Last `max_lines` non-empty lines of the newest log file
pub fn read_recent_logs(log_dir: &Path, max_lines: usize) -> Result<Vec<String>, String> {
    let Some((latest, _)) = log_files(log_dir)?.into_iter().next() else {
        return Ok(Vec::new());
    };

    let bytes = fs::read(&latest).map_err(|e| format!("Failed to read log file: {e}"))?;
    let content = String::from_utf8_lossy(&bytes);
    let lines: Vec<&str> = content.lines().filter(|line| !line.trim().is_empty()).collect();

    let start = lines.len().saturating_sub(max_lines);
    Ok(lines[start..].iter().map(|line| line.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::tempdir;

    fn age_file(path: &Path, days: u64) {
        let file = File::options().write(true).open(path).unwrap();
        let modified = SystemTime::now() - Duration::from_secs(days * SECONDS_PER_DAY);
        file.set_modified(modified).unwrap();
    }

    #[test]
    fn test_prune_removes_only_old_logs() {
        let temp = tempdir().unwrap();
        let old = temp.path().join("old.log");
        let fresh = temp.path().join("fresh.log");
        let other = temp.path().join("notes.txt");
        for path in [&old, &fresh, &other] {
            fs::write(path, "line\n").unwrap();
        }
        age_file(&old, 10);
        age_file(&other, 10);

        assert_eq!(prune_logs(temp.path(), 7).unwrap(), 1);
        assert!(!old.exists());
        assert!(fresh.exists());
        assert!(other.exists());
    }

    #[test]
    fn test_zero_retention_keeps_everything() {
        let temp = tempdir().unwrap();
        let old = temp.path().join("old.log");
        fs::write(&old, "line\n").unwrap();
        age_file(&old, 100);

        assert_eq!(prune_logs(temp.path(), 0).unwrap(), 0);
        assert!(old.exists());
    }

    #[test]
    fn test_read_recent_logs_tails_newest_file() {
        let temp = tempdir().unwrap();
        let older = temp.path().join("a.log");
        let newer = temp.path().join("b.log");
        fs::write(&older, "stale\n").unwrap();
        fs::write(&newer, "one\n\ntwo\nthree\n").unwrap();
        age_file(&older, 2);

        let lines = read_recent_logs(temp.path(), 2).unwrap();
        assert_eq!(lines, vec!["two".to_string(), "three".to_string()]);
    }

    #[test]
    fn test_missing_dir_is_empty() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("logs");
        assert!(read_recent_logs(&missing, 10).unwrap().is_empty());
        assert_eq!(prune_logs(&missing, 7).unwrap(), 0);
    }
}
