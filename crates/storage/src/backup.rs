use super::SqliteStore;
use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::params;
use std::fs;
use std::path::{Path, PathBuf};

impl SqliteStore {
    /// Point-in-time copy via `VACUUM INTO`, then prunes the backup
    /// directory down to the retention count (oldest first).
    pub fn backup_to(&self, dir: &Path, retain: usize) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create backup dir: {}", dir.display()))?;
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let target = dir.join(format!("oracle-{stamp}.db"));
        let target_str = target
            .to_str()
            .context("backup path is not valid utf-8")?
            .to_string();

        self.conn
            .execute("VACUUM INTO ?1", params![target_str])
            .with_context(|| format!("failed to back up database to {}", target.display()))?;

        prune_backups(dir, retain)?;
        Ok(target)
    }
}

fn prune_backups(dir: &Path, retain: usize) -> Result<()> {
    let mut backups: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to read backup dir: {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension().and_then(|ext| ext.to_str()) == Some("db")
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .map(|name| name.starts_with("oracle-"))
                    .unwrap_or(false)
        })
        .collect();
    backups.sort();

    while backups.len() > retain.max(1) {
        let oldest = backups.remove(0);
        fs::remove_file(&oldest)
            .with_context(|| format!("failed to prune backup {}", oldest.display()))?;
        tracing::info!(path = %oldest.display(), "pruned old backup");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::test_support::open_migrated;

    #[test]
    fn backup_creates_a_copy_and_prunes_to_retention() {
        let (dir, store) = open_migrated().expect("store");
        let backup_dir = dir.path().join("backups");

        let mut created = Vec::new();
        for _ in 0..3 {
            created.push(store.backup_to(&backup_dir, 2).expect("backup"));
            // Distinct timestamps keep filenames unique at 1 s granularity.
            std::thread::sleep(std::time::Duration::from_millis(1_100));
        }

        let remaining: Vec<_> = std::fs::read_dir(&backup_dir)
            .expect("read backups")
            .filter_map(|entry| entry.ok())
            .collect();
        assert_eq!(remaining.len(), 2);
        assert!(!created[0].exists());
        assert!(created[2].exists());
    }
}
