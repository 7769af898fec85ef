//! Index reader
//!
//! Random-access reader over one written index. Every decoded node is kept
//! in an offset-keyed cache for the reader's lifetime; index files are small
//! relative to the data they index and a reader is typically dropped right
//! after a partition finishes, so the cache is unbounded and freed on
//! [`IndexReader::close`].
//!
//! The one query primitive is [`IndexReader::bound_query`]: the number of
//! stored keys sorting before a [`Bound`]. Point and interval lookups are
//! phrased as one or two bound queries.

use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::value::Value;

use super::{
    decode_node, key_before_bound, Bound, IndexMetadata, IndexNode, LeafEntry,
    INDEX_FORMAT_VERSION,
};

/// Row range selected by an interval query
#[derive(Debug, Clone, PartialEq)]
pub struct IntervalSlice {
    /// Absolute index of the first selected key
    pub start: u64,
    /// Number of selected keys
    pub count: u64,
    /// Leaf entry at `start`, when it lives in the leaf the start bound
    /// descended to (`None` for an empty selection past a leaf boundary)
    pub first_record: Option<LeafEntry>,
}

/// Decode-cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Node blocks read and decoded from disk
    pub decodes: u64,
    /// Node lookups served from the cache
    pub hits: u64,
}

/// Reader over one `<name>.idx` / `<name>.meta.json` pair
pub struct IndexReader {
    path: String,
    metadata: IndexMetadata,
    /// `None` once closed
    file: Option<File>,
    cache: HashMap<u64, Arc<IndexNode>>,
    stats: CacheStats,
}

impl IndexReader {
    /// Open an index, validating the metadata version
    pub fn open(name: &Path) -> EngineResult<IndexReader> {
        let node_path = name.with_extension("idx");
        let meta_path = name.with_extension("meta.json");
        let meta_file = File::open(&meta_path).map_err(|e| {
            EngineError::resource(meta_path.display().to_string(), None, e.to_string())
        })?;
        let metadata: IndexMetadata = serde_json::from_reader(meta_file)?;
        if metadata.version != INDEX_FORMAT_VERSION {
            return Err(EngineError::resource(
                meta_path.display().to_string(),
                None,
                format!(
                    "format version {} not supported (reader speaks {})",
                    metadata.version, INDEX_FORMAT_VERSION
                ),
            ));
        }
        let path = node_path.display().to_string();
        let file = File::open(&node_path)
            .map_err(|e| EngineError::resource(path.clone(), None, e.to_string()))?;
        debug!(path = %path, n_keys = metadata.n_keys, height = metadata.height, "index_opened");
        Ok(IndexReader {
            path,
            metadata,
            file: Some(file),
            cache: HashMap::new(),
            stats: CacheStats::default(),
        })
    }

    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.stats
    }

    /// Number of stored keys sorting before `bound`
    pub fn bound_query(&mut self, bound: &Bound) -> EngineResult<u64> {
        self.bound_query_record(bound).map(|(position, _)| position)
    }

    /// [`IndexReader::bound_query`] plus the leaf entry at the returned
    /// position, when that entry lives in the leaf the descent reached
    pub fn bound_query_record(
        &mut self,
        bound: &Bound,
    ) -> EngineResult<(u64, Option<LeafEntry>)> {
        if self.metadata.n_keys == 0 {
            // Still honor use-after-close even when there is nothing to read.
            if self.file.is_none() {
                return Err(use_after_close());
            }
            return Ok((0, None));
        }
        let mut offset = self.metadata.root_offset;
        loop {
            let node = self.node(offset)?;
            match node.as_ref() {
                IndexNode::Internal { entries } => {
                    let before = entries
                        .iter()
                        .take_while(|e| key_before_bound(&e.first_key, bound))
                        .count();
                    // The child that may still hold keys before the bound is
                    // the last one starting before it; child 0 when none do.
                    let child = before.saturating_sub(1);
                    offset = entries
                        .get(child)
                        .ok_or_else(|| {
                            EngineError::resource(&self.path, Some(offset), "empty internal node")
                        })?
                        .child_offset;
                }
                IndexNode::Leaf { first_idx, entries } => {
                    let before = entries
                        .iter()
                        .take_while(|e| key_before_bound(&e.key, bound))
                        .count();
                    // Past the last entry, first_idx + len addresses the
                    // first key of the next leaf (or one past the dataset).
                    return Ok((first_idx + before as u64, entries.get(before).cloned()));
                }
            }
        }
    }

    /// Position of the first key not less than `key`
    pub fn lower_bound(&mut self, key: &Value) -> EngineResult<u64> {
        self.bound_query(&Bound::start(key.clone(), true))
    }

    /// Position one past the last key not greater than `key`
    pub fn upper_bound(&mut self, key: &Value) -> EngineResult<u64> {
        self.bound_query(&Bound::end(key.clone(), true))
    }

    /// Key range selected by an interval, with the leaf entry of the first
    /// selected key so a consumer can seek straight to its record
    pub fn query_interval(
        &mut self,
        start: &Value,
        end: &Value,
        includes_start: bool,
        includes_end: bool,
    ) -> EngineResult<IntervalSlice> {
        let (lo, first_record) =
            self.bound_query_record(&Bound::start(start.clone(), includes_start))?;
        let hi = self.bound_query(&Bound::end(end.clone(), includes_end))?;
        if hi < lo {
            return Err(EngineError::internal(
                "index_reader",
                format!("interval bounds crossed: start position {lo}, end position {hi}"),
            ));
        }
        Ok(IntervalSlice {
            start: lo,
            count: hi - lo,
            first_record,
        })
    }

    /// Drop the file handle and free the decode cache. Further queries fail.
    pub fn close(&mut self) {
        self.file = None;
        self.cache.clear();
        self.cache.shrink_to_fit();
        debug!(path = %self.path, decodes = self.stats.decodes, hits = self.stats.hits, "index_closed");
    }

    /// Decode the node at `offset`, through the cache
    pub(crate) fn node(&mut self, offset: u64) -> EngineResult<Arc<IndexNode>> {
        if let Some(node) = self.cache.get(&offset) {
            self.stats.hits += 1;
            return Ok(Arc::clone(node));
        }
        let file = self.file.as_mut().ok_or_else(use_after_close)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| EngineError::resource(&self.path, Some(offset), e.to_string()))?;
        let mut header = [0u8; 9];
        file.read_exact(&mut header)
            .map_err(|e| EngineError::resource(&self.path, Some(offset), e.to_string()))?;
        let len = u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
        let mut block = header.to_vec();
        block.resize(9 + len, 0);
        file.read_exact(&mut block[9..])
            .map_err(|e| EngineError::resource(&self.path, Some(offset), e.to_string()))?;
        let node = Arc::new(decode_node(&block, &self.path, offset)?);
        self.stats.decodes += 1;
        self.cache.insert(offset, Arc::clone(&node));
        Ok(node)
    }
}

fn use_after_close() -> EngineError {
    EngineError::internal("index_reader", "query on a closed reader")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::IndexWriter;
    use tempfile::{tempdir, TempDir};

    /// Keys 0, 10, .., 90 with fanout 4: three leaves under one root.
    fn decade_index() -> (TempDir, IndexReader) {
        let dir = tempdir().unwrap();
        let name = dir.path().join("part-0");
        let mut w = IndexWriter::create(&name, 4, serde_json::Value::Null).unwrap();
        for k in (0..100).step_by(10) {
            w.append(Value::Int32(k), k as u64 * 64, Value::Missing).unwrap();
        }
        w.finish().unwrap();
        let r = IndexReader::open(&name).unwrap();
        (dir, r)
    }

    #[test]
    fn bound_queries_on_decade_keys() {
        let (_dir, mut r) = decade_index();
        assert_eq!(r.lower_bound(&Value::Int32(25)).unwrap(), 3);
        assert_eq!(r.upper_bound(&Value::Int32(20)).unwrap(), 3);
        assert_eq!(r.lower_bound(&Value::Int32(20)).unwrap(), 2);
        assert_eq!(r.lower_bound(&Value::Int32(-5)).unwrap(), 0);
        assert_eq!(r.lower_bound(&Value::Int32(95)).unwrap(), 10);
        assert_eq!(r.upper_bound(&Value::Int32(90)).unwrap(), 10);
    }

    #[test]
    fn interval_query_counts_rows() {
        let (_dir, mut r) = decade_index();
        let slice = r
            .query_interval(&Value::Int32(20), &Value::Int32(50), true, false)
            .unwrap();
        assert_eq!((slice.start, slice.count), (2, 3)); // 20, 30, 40
        let first = slice.first_record.unwrap();
        assert_eq!(first.key, Value::Int32(20));
        assert_eq!(first.record_offset, 20 * 64);
        let slice = r
            .query_interval(&Value::Int32(20), &Value::Int32(50), false, true)
            .unwrap();
        assert_eq!((slice.start, slice.count), (3, 3)); // 30, 40, 50
        let slice = r
            .query_interval(&Value::Int32(41), &Value::Int32(49), true, true)
            .unwrap();
        assert_eq!(slice.count, 0);
    }

    #[test]
    fn repeated_queries_hit_the_cache() {
        let (_dir, mut r) = decade_index();
        r.lower_bound(&Value::Int32(25)).unwrap();
        let cold = r.cache_stats();
        assert_eq!(cold.decodes, 2, "one root, one leaf");
        r.lower_bound(&Value::Int32(25)).unwrap();
        r.lower_bound(&Value::Int32(5)).unwrap();
        let warm = r.cache_stats();
        assert_eq!(warm.decodes, 2, "same nodes, no further decodes");
        assert!(warm.hits >= 3);
    }

    #[test]
    fn closed_reader_rejects_queries() {
        let (_dir, mut r) = decade_index();
        r.lower_bound(&Value::Int32(25)).unwrap();
        r.close();
        let err = r.lower_bound(&Value::Int32(25)).unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn unsupported_version_is_rejected_at_open() {
        let dir = tempdir().unwrap();
        let name = dir.path().join("part-0");
        let mut w = IndexWriter::create(&name, 4, serde_json::Value::Null).unwrap();
        w.append(Value::Int32(1), 0, Value::Missing).unwrap();
        let mut meta = w.finish().unwrap();
        meta.version = 99;
        let meta_file = std::fs::File::create(name.with_extension("meta.json")).unwrap();
        serde_json::to_writer(meta_file, &meta).unwrap();
        let err = IndexReader::open(&name).map(|_| ()).unwrap_err();
        assert!(err.to_string().contains("version 99"));
    }

    #[test]
    fn string_keys_order_lexicographically() {
        let dir = tempdir().unwrap();
        let name = dir.path().join("contigs");
        let mut w = IndexWriter::create(&name, 3, serde_json::Value::Null).unwrap();
        for (i, contig) in ["chr1", "chr10", "chr2", "chrX"].iter().enumerate() {
            w.append(Value::str(contig), i as u64 * 32, Value::Missing).unwrap();
        }
        w.finish().unwrap();
        let mut r = IndexReader::open(&name).unwrap();
        assert_eq!(r.lower_bound(&Value::str("chr10")).unwrap(), 1);
        assert_eq!(r.upper_bound(&Value::str("chr2")).unwrap(), 3);
    }
}
