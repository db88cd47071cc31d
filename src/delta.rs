//! Content-addressed delta engine (spec §4.3): fixed-size chunking, weak +
//! strong fingerprints, minimal delta computation/reconstruction, and an
//! optional reference-counted chunk store. Grounded on the original
//! `coordinator/delta_sync.py::DeltaSync`/`ChunkStore`.

use crate::error::{AppError, AppResult};
use crate::models::ChunkSignature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

const ADLER_MODULUS: u32 = 65_521;

/// Position-independent Adler-32-style rolling hash over a window of bytes.
pub fn rolling_hash(data: &[u8], window: usize) -> u32 {
    let window = window.min(data.len()).max(1).min(data.len().max(1));
    let slice = if data.is_empty() { data } else { &data[..window.min(data.len())] };

    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in slice {
        a = (a + byte as u32) % ADLER_MODULUS;
        b = (b + a) % ADLER_MODULUS;
    }
    (b << 16) | a
}

pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// A single content addition in a delta, keyed by its position in the new
/// content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkAdd {
    pub offset: usize,
    pub size: usize,
    pub data: Vec<u8>,
}

/// A copy from the old content into the new content at a (possibly
/// different) offset -- the reconstruction half of an unchanged chunk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyOp {
    pub new_offset: usize,
    pub old_offset: usize,
    pub size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub file_id: Option<String>,
    pub unchanged_indices: Vec<usize>,
    pub chunks_to_add: Vec<ChunkAdd>,
    pub chunks_to_remove: Vec<usize>,
    pub copy_ops: Vec<CopyOp>,
    pub new_size: usize,
    pub new_content_hash: String,
    pub bandwidth_saved: u64,
    pub compression_ratio: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeltaEngineStats {
    pub files_processed: u64,
    pub total_original_size: u64,
    pub total_delta_size: u64,
    pub bandwidth_saved: u64,
}

pub struct DeltaEngine {
    chunk_size: usize,
    window_size: usize,
    stats: RwLock<DeltaEngineStats>,
}

impl DeltaEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            window_size: (chunk_size / 4).min(64).max(1),
            stats: RwLock::new(DeltaEngineStats::default()),
        }
    }

    /// Splits `content` into consecutive `chunk_size`-sized blocks (the last
    /// block may be shorter but is never empty) and emits one signature per
    /// block.
    pub fn signature(&self, content: &[u8]) -> Vec<ChunkSignature> {
        if content.is_empty() {
            return Vec::new();
        }

        let mut signatures = Vec::new();
        let mut offset = 0usize;
        let mut index = 0usize;
        while offset < content.len() {
            let end = (offset + self.chunk_size).min(content.len());
            let chunk = &content[offset..end];
            signatures.push(ChunkSignature {
                index,
                offset,
                size: chunk.len(),
                weak_hash: rolling_hash(chunk, self.window_size),
                strong_hash: sha256_hex(chunk),
            });
            offset = end;
            index += 1;
        }
        signatures
    }

    /// Builds the minimal set of chunk additions/removals that transforms
    /// `old_bytes` into `new_bytes`.
    pub fn compute_delta(&self, old_bytes: &[u8], new_bytes: &[u8], file_id: Option<String>) -> Delta {
        let new_hash = sha256_hex(new_bytes);

        if old_bytes.is_empty() {
            let bandwidth_saved = 0;
            let delta = Delta {
                file_id,
                unchanged_indices: Vec::new(),
                chunks_to_add: if new_bytes.is_empty() {
                    Vec::new()
                } else {
                    vec![ChunkAdd { offset: 0, size: new_bytes.len(), data: new_bytes.to_vec() }]
                },
                chunks_to_remove: Vec::new(),
                copy_ops: Vec::new(),
                new_size: new_bytes.len(),
                new_content_hash: new_hash,
                bandwidth_saved,
                compression_ratio: 0.0,
            };
            self.record_stats(&delta, new_bytes.len());
            return delta;
        }

        if new_bytes.is_empty() {
            let old_signatures = self.signature(old_bytes);
            let delta = Delta {
                file_id,
                unchanged_indices: Vec::new(),
                chunks_to_add: Vec::new(),
                chunks_to_remove: (0..old_signatures.len()).collect(),
                copy_ops: Vec::new(),
                new_size: 0,
                new_content_hash: new_hash,
                bandwidth_saved: 0,
                compression_ratio: 0.0,
            };
            self.record_stats(&delta, 0);
            return delta;
        }

        let old_signatures = self.signature(old_bytes);
        let mut old_by_hash: HashMap<&str, &ChunkSignature> = HashMap::new();
        for sig in &old_signatures {
            old_by_hash.entry(sig.strong_hash.as_str()).or_insert(sig);
        }

        let new_signatures = self.signature(new_bytes);
        let mut unchanged_indices = Vec::new();
        let mut chunks_to_add = Vec::new();
        let mut copy_ops = Vec::new();
        let mut used_old_hashes: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut bandwidth_saved: u64 = 0;

        for sig in &new_signatures {
            if let Some(old_sig) = old_by_hash.get(sig.strong_hash.as_str()) {
                unchanged_indices.push(sig.index);
                copy_ops.push(CopyOp { new_offset: sig.offset, old_offset: old_sig.offset, size: sig.size });
                used_old_hashes.insert(sig.strong_hash.clone());
                bandwidth_saved += sig.size as u64;
            } else {
                let chunk = &new_bytes[sig.offset..sig.offset + sig.size];
                chunks_to_add.push(ChunkAdd { offset: sig.offset, size: sig.size, data: chunk.to_vec() });
            }
        }

        let chunks_to_remove: Vec<usize> = old_signatures
            .iter()
            .filter(|sig| !used_old_hashes.contains(&sig.strong_hash))
            .map(|sig| sig.index)
            .collect();

        let compression_ratio = if new_bytes.is_empty() {
            0.0
        } else {
            bandwidth_saved as f64 / new_bytes.len() as f64
        };

        let delta = Delta {
            file_id,
            unchanged_indices,
            chunks_to_add,
            chunks_to_remove,
            copy_ops,
            new_size: new_bytes.len(),
            new_content_hash: new_hash,
            bandwidth_saved,
            compression_ratio,
        };
        self.record_stats(&delta, new_bytes.len());
        delta
    }

    /// Reconstructs `new_bytes` from `old_bytes` plus the delta's additions
    /// and copies. Verifies the result's SHA-256 against the delta's
    /// recorded hash; a mismatch is a contract violation, not a retryable
    /// error.
    pub fn apply_delta(&self, old_bytes: &[u8], delta: &Delta) -> AppResult<Vec<u8>> {
        let mut result = vec![0u8; delta.new_size];

        for copy in &delta.copy_ops {
            let old_end = copy.old_offset + copy.size;
            if old_end > old_bytes.len() {
                return Err(AppError::InvariantViolation(
                    "delta copy operation references bytes past the end of old content".to_string(),
                ));
            }
            let new_end = copy.new_offset + copy.size;
            if new_end > result.len() {
                return Err(AppError::InvariantViolation(
                    "delta copy operation writes past the end of new content".to_string(),
                ));
            }
            result[copy.new_offset..new_end].copy_from_slice(&old_bytes[copy.old_offset..old_end]);
        }

        for add in &delta.chunks_to_add {
            let new_end = add.offset + add.size;
            if new_end > result.len() || add.data.len() != add.size {
                return Err(AppError::InvariantViolation(
                    "delta add operation has inconsistent offset/size".to_string(),
                ));
            }
            result[add.offset..new_end].copy_from_slice(&add.data);
        }

        let actual_hash = sha256_hex(&result);
        if actual_hash != delta.new_content_hash {
            return Err(AppError::InvariantViolation(format!(
                "delta reconstruction mismatch: expected {}, got {}",
                delta.new_content_hash, actual_hash
            )));
        }

        Ok(result)
    }

    /// Merges two adjacent add-operations when the second begins exactly
    /// where the first ends.
    pub fn optimize(&self, delta: &Delta) -> Delta {
        let mut sorted_adds = delta.chunks_to_add.clone();
        sorted_adds.sort_by_key(|c| c.offset);

        let mut merged: Vec<ChunkAdd> = Vec::new();
        for add in sorted_adds {
            if let Some(last) = merged.last_mut() {
                if last.offset + last.size == add.offset {
                    last.size += add.size;
                    last.data.extend_from_slice(&add.data);
                    continue;
                }
            }
            merged.push(add);
        }

        Delta { chunks_to_add: merged, ..delta.clone() }
    }

    fn record_stats(&self, delta: &Delta, original_size: usize) {
        let mut stats = self.stats.write().unwrap();
        stats.files_processed += 1;
        stats.total_original_size += original_size as u64;
        let delta_size: u64 = delta.chunks_to_add.iter().map(|c| c.size as u64).sum();
        stats.total_delta_size += delta_size;
        stats.bandwidth_saved += delta.bandwidth_saved;
    }

    pub fn stats(&self) -> DeltaEngineStats {
        self.stats.read().unwrap().clone()
    }
}

/// A content-addressed chunk store keyed by `strong_hash`, with reference
/// counting so several files sharing a chunk don't duplicate storage.
/// Treated as an opaque blob store; the on-disk layout below this key is
/// out of scope (spec §1).
#[derive(Default)]
pub struct ChunkStore {
    entries: RwLock<HashMap<String, ChunkEntry>>,
}

struct ChunkEntry {
    bytes: Vec<u8>,
    ref_count: u64,
}

impl ChunkStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, hash: &str, bytes: Vec<u8>) {
        let mut entries = self.entries.write().unwrap();
        entries
            .entry(hash.to_string())
            .and_modify(|e| e.ref_count += 1)
            .or_insert(ChunkEntry { bytes, ref_count: 1 });
    }

    pub fn get(&self, hash: &str) -> Option<Vec<u8>> {
        self.entries.read().unwrap().get(hash).map(|e| e.bytes.clone())
    }

    pub fn has(&self, hash: &str) -> bool {
        self.entries.read().unwrap().contains_key(hash)
    }

    pub fn release(&self, hash: &str) {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get_mut(hash) {
            entry.ref_count = entry.ref_count.saturating_sub(1);
        }
    }

    /// Removes entries with zero references.
    pub fn gc(&self) -> usize {
        let mut entries = self.entries.write().unwrap();
        let before = entries.len();
        entries.retain(|_, e| e.ref_count > 0);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }
}

mod hex {
    pub fn encode(bytes: impl AsRef<[u8]>) -> String {
        let bytes = bytes.as_ref();
        let mut out = String::with_capacity(bytes.len() * 2);
        for byte in bytes {
            out.push_str(&format!("{:02x}", byte));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_produce_no_additions() {
        let engine = DeltaEngine::new(4096);
        let content = b"hello world".to_vec();
        let delta = engine.compute_delta(&content, &content, None);
        assert!(delta.chunks_to_add.is_empty());
        assert_eq!(delta.bandwidth_saved, content.len() as u64);
        assert_eq!(delta.compression_ratio, 1.0);
    }

    #[test]
    fn empty_old_is_single_add() {
        let engine = DeltaEngine::new(4096);
        let new_content = b"hello world".to_vec();
        let delta = engine.compute_delta(&[], &new_content, None);
        assert_eq!(delta.chunks_to_add.len(), 1);
        assert_eq!(delta.chunks_to_add[0].size, new_content.len());
        assert!(delta.chunks_to_remove.is_empty());
    }

    #[test]
    fn empty_new_is_single_remove() {
        let engine = DeltaEngine::new(4096);
        let old_content = b"hello world".to_vec();
        let delta = engine.compute_delta(&old_content, &[], None);
        assert!(delta.chunks_to_add.is_empty());
        assert_eq!(delta.chunks_to_remove.len(), 1);
        assert_eq!(delta.new_size, 0);
    }

    #[test]
    fn apply_delta_round_trips() {
        let engine = DeltaEngine::new(4096);
        let old_content = b"the quick brown fox".to_vec();
        let new_content = b"the slow brown fox jumps".to_vec();
        let delta = engine.compute_delta(&old_content, &new_content, None);
        let rebuilt = engine.apply_delta(&old_content, &delta).unwrap();
        assert_eq!(rebuilt, new_content);
    }

    #[test]
    fn small_edit_with_small_chunks_isolates_change() {
        // Mirrors spec.md scenario S2 with C = 4.
        let engine = DeltaEngine::new(4);
        let old_content = b"hello world".to_vec(); // 11 bytes
        let new_content = b"hello wOrld".to_vec(); // one byte changed at index 7

        let delta = engine.compute_delta(&old_content, &new_content, None);
        assert_eq!(delta.chunks_to_add.len(), 1);
        assert_eq!(delta.chunks_to_add[0].offset, 4);
        assert_eq!(delta.unchanged_indices.len(), 2);
    }

    #[test]
    fn small_edit_with_large_chunks_rewrites_whole_chunk() {
        // Mirrors spec.md scenario S2 with C = 4096.
        let engine = DeltaEngine::new(4096);
        let old_content = b"hello world".to_vec();
        let new_content = b"hello wOrld".to_vec();

        let delta = engine.compute_delta(&old_content, &new_content, None);
        assert_eq!(delta.chunks_to_add.len(), 1);
        assert_eq!(delta.chunks_to_add[0].size, 11);
        assert!(delta.unchanged_indices.is_empty());
        assert_eq!(delta.bandwidth_saved, 0);
    }

    #[test]
    fn optimize_merges_adjacent_adds() {
        let engine = DeltaEngine::new(4096);
        let delta = Delta {
            file_id: None,
            unchanged_indices: Vec::new(),
            chunks_to_add: vec![
                ChunkAdd { offset: 0, size: 4, data: vec![1, 2, 3, 4] },
                ChunkAdd { offset: 4, size: 2, data: vec![5, 6] },
            ],
            chunks_to_remove: Vec::new(),
            copy_ops: Vec::new(),
            new_size: 6,
            new_content_hash: sha256_hex(&[1, 2, 3, 4, 5, 6]),
            bandwidth_saved: 0,
            compression_ratio: 0.0,
        };

        let optimized = engine.optimize(&delta);
        assert_eq!(optimized.chunks_to_add.len(), 1);
        assert_eq!(optimized.chunks_to_add[0].size, 6);
    }

    #[test]
    fn apply_delta_rejects_hash_mismatch() {
        let engine = DeltaEngine::new(4096);
        let mut delta = engine.compute_delta(b"abc", b"abd", None);
        delta.new_content_hash = "not-a-real-hash".to_string();
        let result = engine.apply_delta(b"abc", &delta);
        assert!(result.is_err());
    }

    #[test]
    fn chunk_store_gc_removes_unreferenced() {
        let store = ChunkStore::new();
        store.put("h1", vec![1, 2, 3]);
        store.put("h2", vec![4, 5, 6]);
        store.release("h1");
        let removed = store.gc();
        assert_eq!(removed, 1);
        assert!(!store.has("h1"));
        assert!(store.has("h2"));
    }
}
