use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::types::ChannelRecord;

const CACHE_FILE_NAME: &str = "holodex_channels_cache.json";
const CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Serialize, Deserialize)]
struct CacheSnapshot {
    channels: Vec<ChannelRecord>,
    last_update: u64,
}

/// TTL-bounded local directory of channel metadata, persisted as a single
/// JSON snapshot. The id/name indices are rebuilt wholesale on every
/// `replace`; the handle index is populated lazily as handles get resolved
/// and deliberately survives `replace`.
pub struct ChannelDirectory {
    cache_file: PathBuf,
    channels: Vec<ChannelRecord>,
    by_id: HashMap<String, ChannelRecord>,
    by_name: HashMap<String, ChannelRecord>,
    by_handle: HashMap<String, ChannelRecord>,
    last_update: Option<u64>,
    ttl: Duration,
}

impl ChannelDirectory {
    pub fn new(cache_dir: impl AsRef<Path>) -> Self {
        Self::with_ttl(cache_dir, CACHE_TTL)
    }

    pub fn with_ttl(cache_dir: impl AsRef<Path>, ttl: Duration) -> Self {
        let cache_dir = cache_dir.as_ref();
        if let Err(e) = fs::create_dir_all(cache_dir) {
            tracing::warn!(dir = %cache_dir.display(), error = %e, "Could not create cache directory");
        }
        Self {
            cache_file: cache_dir.join(CACHE_FILE_NAME),
            channels: Vec::new(),
            by_id: HashMap::new(),
            by_name: HashMap::new(),
            by_handle: HashMap::new(),
            last_update: None,
            ttl,
        }
    }

    /// Loads the persisted snapshot. Returns false when the file is absent
    /// or unreadable; the directory simply stays empty in that case.
    pub fn load(&mut self) -> bool {
        let raw = match fs::read_to_string(&self.cache_file) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::info!(file = %self.cache_file.display(), error = %e, "No channel cache to load");
                return false;
            }
        };

        let snapshot: CacheSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(file = %self.cache_file.display(), error = %e, "Invalid channel cache format");
                return false;
            }
        };

        self.set_channels(snapshot.channels);
        self.last_update = Some(snapshot.last_update);
        tracing::info!(channels = self.channels.len(), "Loaded channel cache");
        true
    }

    /// A snapshot is valid while the cache file exists and its timestamp is
    /// within the TTL. Falls back to the file's mtime when no timestamp has
    /// been loaded yet.
    pub fn is_valid(&self) -> bool {
        if !self.cache_file.exists() {
            return false;
        }

        let last_update = self.last_update.or_else(|| {
            fs::metadata(&self.cache_file)
                .and_then(|meta| meta.modified())
                .ok()
                .and_then(|mtime| {
                    mtime
                        .duration_since(std::time::UNIX_EPOCH)
                        .ok()
                        .map(|d| d.as_secs())
                })
        });

        match last_update {
            Some(last_update) => {
                let now = Utc::now().timestamp().max(0) as u64;
                now.saturating_sub(last_update) < self.ttl.as_secs()
            }
            None => false,
        }
    }

    /// Replaces the full channel set, rebuilds the id/name indices, and
    /// persists immediately. Persistence failures are logged and non-fatal;
    /// the in-memory state stays authoritative for the process lifetime.
    pub fn replace(&mut self, records: Vec<ChannelRecord>) {
        self.set_channels(records);
        self.last_update = Some(Utc::now().timestamp().max(0) as u64);
        if let Err(e) = self.save() {
            tracing::error!(file = %self.cache_file.display(), error = %e, "Failed to persist channel cache");
        } else {
            tracing::info!(channels = self.channels.len(), "Saved channel cache");
        }
    }

    fn set_channels(&mut self, records: Vec<ChannelRecord>) {
        self.by_id = records
            .iter()
            .map(|record| (record.id.clone(), record.clone()))
            .collect();
        self.by_name = records
            .iter()
            .map(|record| (record.name.clone(), record.clone()))
            .collect();
        self.channels = records;
    }

    fn save(&self) -> std::io::Result<()> {
        let snapshot = CacheSnapshot {
            channels: self.channels.clone(),
            last_update: self.last_update.unwrap_or(0),
        };
        let raw = serde_json::to_string_pretty(&snapshot)?;
        fs::write(&self.cache_file, raw)
    }

    pub fn by_id(&self, channel_id: &str) -> Option<&ChannelRecord> {
        self.by_id.get(channel_id)
    }

    pub fn by_name(&self, name: &str) -> Option<&ChannelRecord> {
        self.by_name.get(name)
    }

    pub fn by_handle(&self, handle: &str) -> Option<&ChannelRecord> {
        self.by_handle.get(handle)
    }

    /// Records a handle resolution. The handle index lives outside the bulk
    /// snapshot and is not touched by `replace`.
    pub fn insert_handle(&mut self, handle: &str, record: ChannelRecord) {
        self.by_handle.insert(handle.to_string(), record);
    }

    pub fn channels(&self) -> &[ChannelRecord] {
        &self.channels
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Case-insensitive substring search over name and english name.
    /// Queries shorter than two characters return nothing.
    pub fn search(&self, query: &str) -> Vec<ChannelRecord> {
        let query = query.trim().to_lowercase();
        if query.len() < 2 {
            return Vec::new();
        }

        self.channels
            .iter()
            .filter(|record| {
                record.name.to_lowercase().contains(&query)
                    || record
                        .english_name
                        .as_ref()
                        .is_some_and(|name| name.to_lowercase().contains(&query))
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, name: &str) -> ChannelRecord {
        ChannelRecord {
            id: id.to_string(),
            name: name.to_string(),
            english_name: None,
            handle: None,
            org: None,
            suborg: None,
            avatar_url: None,
            kind: None,
        }
    }

    #[test]
    fn test_replace_then_lookup_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = ChannelDirectory::new(dir.path());

        let records = vec![record("UC1", "Talent One"), record("UC2", "Talent Two")];
        directory.replace(records.clone());

        for r in &records {
            assert_eq!(directory.by_id(&r.id), Some(r));
            assert_eq!(directory.by_name(&r.name), Some(r));
        }
        assert!(directory.by_id("UC404").is_none());
        assert!(directory.by_name("Nobody").is_none());
    }

    #[test]
    fn test_fresh_snapshot_is_valid_and_reloadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = ChannelDirectory::new(dir.path());
        directory.replace(vec![record("UC1", "Talent One")]);
        assert!(directory.is_valid());

        let mut reloaded = ChannelDirectory::new(dir.path());
        assert!(reloaded.load());
        assert!(reloaded.is_valid());
        assert_eq!(reloaded.len(), 1);
        assert!(reloaded.by_id("UC1").is_some());
    }

    #[test]
    fn test_expired_snapshot_is_invalid_despite_file_presence() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ChannelDirectory::new(dir.path());
        writer.replace(vec![record("UC1", "Talent One")]);

        let mut directory = ChannelDirectory::with_ttl(dir.path(), Duration::from_secs(0));
        assert!(directory.load(), "file should still load");
        assert!(!directory.is_valid(), "zero TTL must expire any snapshot");
    }

    #[test]
    fn test_missing_and_corrupt_files_do_not_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = ChannelDirectory::new(dir.path());
        assert!(!directory.load());
        assert!(!directory.is_valid());

        fs::write(dir.path().join(CACHE_FILE_NAME), "not json").unwrap();
        assert!(!directory.load());
    }

    #[test]
    fn test_handle_index_survives_replace() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = ChannelDirectory::new(dir.path());

        directory.replace(vec![record("UC1", "Talent One")]);
        directory.insert_handle("@talent1", record("UC1", "Talent One"));

        // Wipes id/name indices, but handle resolutions are kept as-is.
        directory.replace(vec![record("UC2", "Talent Two")]);

        assert!(directory.by_id("UC1").is_none());
        assert!(directory.by_handle("@talent1").is_some());
    }

    #[test]
    fn test_search_matches_name_and_english_name() {
        let dir = tempfile::tempdir().unwrap();
        let mut directory = ChannelDirectory::new(dir.path());

        let mut with_english = record("UC1", "ときのそら");
        with_english.english_name = Some("Tokino Sora".to_string());
        directory.replace(vec![with_english, record("UC2", "Other Talent")]);

        assert_eq!(directory.search("sora").len(), 1);
        assert_eq!(directory.search("talent").len(), 1);
        assert!(directory.search("s").is_empty(), "one-char query is ignored");
        assert!(directory.search("nothing").is_empty());
    }
}
