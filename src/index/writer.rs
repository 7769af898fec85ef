//! Index writer
//!
//! Builds the node file bottom-up from a sorted key feed. Keys arrive one at
//! a time through [`IndexWriter::append`]; leaves are flushed as they fill,
//! then internal levels are built over the flushed level until a single root
//! remains. The root is written last, so its offset is only known at
//! [`IndexWriter::finish`] time, when the metadata sidecar is written.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{error_id, EngineError, EngineResult};
use crate::value::{cmp_values, Value};

use super::{
    encode_node, IndexMetadata, IndexNode, InternalEntry, LeafEntry, INDEX_FORMAT_VERSION,
};

/// Bottom-up writer for one index
pub struct IndexWriter {
    node_path: PathBuf,
    meta_path: PathBuf,
    out: BufWriter<File>,
    branching_factor: usize,
    attributes: serde_json::Value,
    /// Entries of the leaf currently being filled
    pending: Vec<LeafEntry>,
    /// Absolute index of the pending leaf's first key
    pending_first_idx: u64,
    /// Flushed nodes of the level currently being built, as (first key,
    /// offset) pairs
    level: Vec<(Value, u64)>,
    last_key: Option<Value>,
    n_keys: u64,
    bytes_written: u64,
}

impl IndexWriter {
    /// Create `<name>.idx` (truncating) for an index with the given fanout.
    /// `attributes` are carried verbatim into the metadata sidecar.
    pub fn create(
        name: &Path,
        branching_factor: usize,
        attributes: serde_json::Value,
    ) -> EngineResult<IndexWriter> {
        if branching_factor < 2 {
            return Err(EngineError::internal(
                "index_writer",
                format!("branching factor {branching_factor} below 2"),
            ));
        }
        let node_path = name.with_extension("idx");
        let meta_path = name.with_extension("meta.json");
        let file = File::create(&node_path).map_err(|e| {
            EngineError::resource(node_path.display().to_string(), None, e.to_string())
        })?;
        Ok(IndexWriter {
            node_path,
            meta_path,
            out: BufWriter::new(file),
            branching_factor,
            attributes,
            pending: Vec::new(),
            pending_first_idx: 0,
            level: Vec::new(),
            last_key: None,
            n_keys: 0,
            bytes_written: 0,
        })
    }

    /// Append the next key in sorted order, with the byte offset of its
    /// record and an optional annotation ([`Value::Missing`] for none).
    /// Duplicate keys are allowed; a key sorting before its predecessor is
    /// a user error.
    pub fn append(
        &mut self,
        key: Value,
        record_offset: u64,
        annotation: Value,
    ) -> EngineResult<()> {
        if let Some(prev) = &self.last_key {
            if cmp_values(&key, prev) == std::cmp::Ordering::Less {
                return Err(EngineError::user(
                    error_id::UNSORTED_KEYS,
                    format!("key {key} arrived after {prev}"),
                ));
            }
        }
        self.last_key = Some(key.clone());
        self.pending.push(LeafEntry {
            key,
            record_offset,
            annotation,
        });
        self.n_keys += 1;
        if self.pending.len() == self.branching_factor {
            self.flush_leaf()?;
        }
        Ok(())
    }

    /// Write remaining nodes and the metadata sidecar
    pub fn finish(mut self) -> EngineResult<IndexMetadata> {
        if !self.pending.is_empty() {
            self.flush_leaf()?;
        }
        let mut height = usize::from(!self.level.is_empty());
        // Collapse levels until one node covers everything.
        while self.level.len() > 1 {
            let children = std::mem::take(&mut self.level);
            for group in children.chunks(self.branching_factor) {
                let node = IndexNode::Internal {
                    entries: group
                        .iter()
                        .map(|(first_key, offset)| InternalEntry {
                            first_key: first_key.clone(),
                            child_offset: *offset,
                        })
                        .collect(),
                };
                let offset = self.write_node(&node)?;
                self.level.push((group[0].0.clone(), offset));
            }
            height += 1;
        }
        let root_offset = self.level.first().map_or(0, |(_, offset)| *offset);
        self.out.flush()?;
        let metadata = IndexMetadata {
            version: INDEX_FORMAT_VERSION,
            branching_factor: self.branching_factor,
            height,
            n_keys: self.n_keys,
            root_offset,
            attributes: self.attributes.clone(),
        };
        let meta_file = File::create(&self.meta_path).map_err(|e| {
            EngineError::resource(self.meta_path.display().to_string(), None, e.to_string())
        })?;
        serde_json::to_writer_pretty(meta_file, &metadata)?;
        info!(
            path = %self.node_path.display(),
            n_keys = metadata.n_keys,
            height = metadata.height,
            bytes = self.bytes_written,
            "index_written"
        );
        Ok(metadata)
    }

    fn flush_leaf(&mut self) -> EngineResult<()> {
        let entries = std::mem::take(&mut self.pending);
        let first_key = entries[0].key.clone();
        let node = IndexNode::Leaf {
            first_idx: self.pending_first_idx,
            entries,
        };
        self.pending_first_idx = self.n_keys;
        let offset = self.write_node(&node)?;
        self.level.push((first_key, offset));
        Ok(())
    }

    fn write_node(&mut self, node: &IndexNode) -> EngineResult<u64> {
        let block = encode_node(node)?;
        let offset = self.bytes_written;
        self.out.write_all(&block)?;
        self.bytes_written += block.len() as u64;
        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ten_keys_fanout_four_builds_height_two() {
        let dir = tempdir().unwrap();
        let mut w = IndexWriter::create(
            &dir.path().join("part-0"),
            4,
            serde_json::json!({ "key": ["idx"] }),
        )
        .unwrap();
        for k in (0..100).step_by(10) {
            w.append(Value::Int32(k), k as u64 * 16, Value::Missing).unwrap();
        }
        let meta = w.finish().unwrap();
        assert_eq!(meta.n_keys, 10);
        assert_eq!(meta.height, 2);
        assert_eq!(meta.branching_factor, 4);
        assert!(meta.root_offset > 0, "root is written after the leaves");
    }

    #[test]
    fn unsorted_keys_are_rejected() {
        let dir = tempdir().unwrap();
        let mut w =
            IndexWriter::create(&dir.path().join("bad"), 4, serde_json::Value::Null).unwrap();
        w.append(Value::Int32(5), 0, Value::Missing).unwrap();
        w.append(Value::Int32(5), 8, Value::Missing).unwrap();
        let err = w.append(Value::Int32(4), 16, Value::Missing).unwrap_err();
        assert!(err.to_string().contains(error_id::UNSORTED_KEYS));
    }

    #[test]
    fn empty_index_has_height_zero() {
        let dir = tempdir().unwrap();
        let w = IndexWriter::create(&dir.path().join("empty"), 4, serde_json::Value::Null)
            .unwrap();
        let meta = w.finish().unwrap();
        assert_eq!(meta.n_keys, 0);
        assert_eq!(meta.height, 0);
    }
}
