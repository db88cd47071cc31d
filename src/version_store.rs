//! Append-only versioned file store (spec §4.4): every write creates a new
//! immutable version; exactly one version per file is "current". Grounded on
//! the WAL's append-then-point-at-latest discipline in
//! `infrastructure/write_ahead_log.rs`.

use crate::error::{AppError, AppResult};
use crate::models::{current_time_millis, FileVersion};
use crate::vector_clock::VectorClock;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

struct FileHistory {
    versions: Vec<FileVersion>,
    current_version_id: String,
    /// Raw bytes, keyed by version_id. Kept alongside metadata so
    /// `restore_version` (spec §5.4) can always produce a new version
    /// without the caller re-uploading content.
    content: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
pub struct VersionStore {
    files: RwLock<HashMap<String, FileHistory>>,
}

impl VersionStore {
    pub fn new() -> Self {
        Self { files: RwLock::new(HashMap::new()) }
    }

    /// Appends a new version for `file_id` and makes it current. The
    /// previous current version (if any) becomes this version's parent and
    /// stops being current -- there is never more than one current version.
    pub fn create_version(
        &self,
        file_id: &str,
        bytes: Vec<u8>,
        content_hash: String,
        created_by_node_id: &str,
        vector_clock: VectorClock,
    ) -> FileVersion {
        let mut files = self.files.write().unwrap();
        let history = files.entry(file_id.to_string()).or_insert_with(|| FileHistory {
            versions: Vec::new(),
            current_version_id: String::new(),
            content: HashMap::new(),
        });

        let parent_version_id = if history.current_version_id.is_empty() {
            None
        } else {
            Some(history.current_version_id.clone())
        };

        for v in history.versions.iter_mut() {
            v.is_current = false;
        }

        let version_number = history.versions.len() as i64 + 1;
        let version = FileVersion {
            version_id: Uuid::new_v4().to_string(),
            file_id: file_id.to_string(),
            version_number,
            content_hash,
            size: bytes.len() as i64,
            created_at: current_time_millis(),
            created_by_node_id: created_by_node_id.to_string(),
            vector_clock,
            is_current: true,
            parent_version_id,
        };

        history.content.insert(version.version_id.clone(), bytes);
        history.current_version_id = version.version_id.clone();
        history.versions.push(version.clone());
        version
    }

    pub fn get_current(&self, file_id: &str) -> AppResult<FileVersion> {
        let files = self.files.read().unwrap();
        let history = files
            .get(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))?;
        history
            .versions
            .iter()
            .find(|v| v.version_id == history.current_version_id)
            .cloned()
            .ok_or_else(|| AppError::InvariantViolation(format!("file {} has no current version", file_id)))
    }

    pub fn get_version(&self, file_id: &str, version_id: &str) -> AppResult<FileVersion> {
        let files = self.files.read().unwrap();
        let history = files
            .get(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))?;
        history
            .versions
            .iter()
            .find(|v| v.version_id == version_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("version {} not found", version_id)))
    }

    pub fn list_versions(&self, file_id: &str) -> Vec<FileVersion> {
        self.files
            .read()
            .unwrap()
            .get(file_id)
            .map(|h| h.versions.clone())
            .unwrap_or_default()
    }

    pub fn get_bytes(&self, file_id: &str, version_id: &str) -> AppResult<Vec<u8>> {
        let files = self.files.read().unwrap();
        let history = files
            .get(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))?;
        history
            .content
            .get(version_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("version {} has no stored content", version_id)))
    }

    pub fn get_current_bytes(&self, file_id: &str) -> AppResult<Vec<u8>> {
        let current = self.get_current(file_id)?;
        self.get_bytes(file_id, &current.version_id)
    }

    /// Makes `version_id` current again by appending a *new* version that
    /// copies its content -- history is append-only, restoring never rewrites
    /// the past (spec §4.4 invariant).
    pub fn restore_version(
        &self,
        file_id: &str,
        version_id: &str,
        restored_by_node_id: &str,
        vector_clock: VectorClock,
    ) -> AppResult<FileVersion> {
        let (bytes, content_hash) = {
            let files = self.files.read().unwrap();
            let history = files
                .get(file_id)
                .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))?;
            let target = history
                .versions
                .iter()
                .find(|v| v.version_id == version_id)
                .ok_or_else(|| AppError::NotFound(format!("version {} not found", version_id)))?;
            let bytes = history
                .content
                .get(version_id)
                .cloned()
                .ok_or_else(|| AppError::NotFound(format!("version {} has no stored content", version_id)))?;
            (bytes, target.content_hash.clone())
        };

        Ok(self.create_version(file_id, bytes, content_hash, restored_by_node_id, vector_clock))
    }

    /// Deletes a version. Refused only when it is the sole version and it is
    /// current (spec §4.4); if it was current and other versions remain, the
    /// highest-numbered remaining version is promoted to current.
    pub fn delete_version(&self, file_id: &str, version_id: &str) -> AppResult<()> {
        let mut files = self.files.write().unwrap();
        let history = files
            .get_mut(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))?;

        if history.current_version_id == version_id && history.versions.len() == 1 {
            return Err(AppError::InvariantViolation(
                "cannot delete the sole version of a file".to_string(),
            ));
        }

        let before = history.versions.len();
        history.versions.retain(|v| v.version_id != version_id);
        if history.versions.len() == before {
            return Err(AppError::NotFound(format!("version {} not found", version_id)));
        }
        history.content.remove(version_id);

        if history.current_version_id == version_id {
            let promoted = history
                .versions
                .iter_mut()
                .max_by_key(|v| v.version_number)
                .expect("at least one version remains after a non-sole deletion");
            promoted.is_current = true;
            history.current_version_id = promoted.version_id.clone();
        }

        Ok(())
    }

    /// Retains only the `keep_n` most recent versions (plus the current
    /// version, which is always kept even if `keep_n` is zero).
    pub fn cleanup(&self, file_id: &str, keep_n: usize) -> AppResult<usize> {
        let mut files = self.files.write().unwrap();
        let history = files
            .get_mut(file_id)
            .ok_or_else(|| AppError::NotFound(format!("file {} has no versions", file_id)))?;

        let mut sorted = history.versions.clone();
        sorted.sort_by_key(|v| -v.version_number);
        let mut keep: std::collections::HashSet<String> =
            sorted.iter().take(keep_n).map(|v| v.version_id.clone()).collect();
        keep.insert(history.current_version_id.clone());

        let before = history.versions.len();
        history.versions.retain(|v| keep.contains(&v.version_id));
        history.content.retain(|id, _| keep.contains(id));
        Ok(before - history.versions.len())
    }

    pub fn remove_file(&self, file_id: &str) {
        self.files.write().unwrap().remove(file_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vc() -> VectorClock {
        VectorClock::new()
    }

    #[test]
    fn first_version_is_current_with_no_parent() {
        let store = VersionStore::new();
        let v = store.create_version("f1", b"hello".to_vec(), "h1".to_string(), "n1", vc());
        assert_eq!(v.version_number, 1);
        assert!(v.is_current);
        assert!(v.parent_version_id.is_none());
    }

    #[test]
    fn only_one_version_is_current_at_a_time() {
        let store = VersionStore::new();
        store.create_version("f1", b"v1".to_vec(), "h1".to_string(), "n1", vc());
        let v2 = store.create_version("f1", b"v2".to_vec(), "h2".to_string(), "n1", vc());

        let versions = store.list_versions("f1");
        let current_count = versions.iter().filter(|v| v.is_current).count();
        assert_eq!(current_count, 1);
        assert_eq!(store.get_current("f1").unwrap().version_id, v2.version_id);
    }

    #[test]
    fn version_numbers_are_monotonic() {
        let store = VersionStore::new();
        for i in 0..5 {
            store.create_version("f1", vec![i], format!("h{}", i), "n1", vc());
        }
        let versions = store.list_versions("f1");
        let mut numbers: Vec<i64> = versions.iter().map(|v| v.version_number).collect();
        numbers.sort();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn restore_appends_rather_than_rewrites() {
        let store = VersionStore::new();
        let v1 = store.create_version("f1", b"v1".to_vec(), "h1".to_string(), "n1", vc());
        store.create_version("f1", b"v2".to_vec(), "h2".to_string(), "n1", vc());

        let restored = store.restore_version("f1", &v1.version_id, "n1", vc()).unwrap();
        assert_eq!(restored.version_number, 3);
        assert_eq!(restored.content_hash, v1.content_hash);
        assert_eq!(store.list_versions("f1").len(), 3);
    }

    #[test]
    fn cannot_delete_the_sole_current_version() {
        let store = VersionStore::new();
        let v1 = store.create_version("f1", b"v1".to_vec(), "h1".to_string(), "n1", vc());
        let result = store.delete_version("f1", &v1.version_id);
        assert!(result.is_err());
    }

    #[test]
    fn deleting_current_version_promotes_the_highest_remaining_one() {
        let store = VersionStore::new();
        store.create_version("f1", b"v1".to_vec(), "h1".to_string(), "n1", vc());
        let v2 = store.create_version("f1", b"v2".to_vec(), "h2".to_string(), "n1", vc());

        store.delete_version("f1", &v2.version_id).unwrap();

        let current = store.get_current("f1").unwrap();
        assert_eq!(current.version_number, 1);
        assert!(current.is_current);
    }

    #[test]
    fn cleanup_always_keeps_current() {
        let store = VersionStore::new();
        for i in 0..5 {
            store.create_version("f1", vec![i], format!("h{}", i), "n1", vc());
        }
        let removed = store.cleanup("f1", 0).unwrap();
        assert_eq!(removed, 4);
        assert_eq!(store.list_versions("f1").len(), 1);
        assert!(store.get_current("f1").is_ok());
    }
}
