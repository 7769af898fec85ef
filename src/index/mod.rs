//! # On-Disk Key Index
//!
//! A two-part, multi-level sorted index over row keys:
//!
//! ```text
//!   <name>.idx        node blocks, leaves first, root last
//!   <name>.meta.json  version, shape, root offset, free attributes
//! ```
//!
//! Nodes are written bottom-up: leaf nodes carry the absolute index of
//! their first key plus `(key, record offset, annotation)` entries,
//! internal nodes carry `(first key, child offset)` entries. Every block
//! is framed as
//!
//! ```text
//!   tag: u8   (0 = leaf, 1 = internal)
//!   len: u32  little-endian payload length
//!   crc: u32  little-endian CRC32 of the payload
//!   payload   bincode-encoded node
//! ```
//!
//! so a reader can verify a block without decoding it. Queries are bound
//! queries: "how many keys sort before this bound". Ties are resolved by the
//! bound's lean, see [`cmp_key_with_bound`].

mod reader;
mod staged;
mod writer;

pub use reader::{CacheStats, IndexReader, IntervalSlice};
pub use staged::StagedIndexReader;
pub use writer::IndexWriter;

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::value::{cmp_values, Value};

/// Format version accepted by this crate
pub const INDEX_FORMAT_VERSION: u32 = 1;

/// Node block tag for leaves
pub(crate) const LEAF_TAG: u8 = 0;
/// Node block tag for internal nodes
pub(crate) const INTERNAL_TAG: u8 = 1;

/// Sidecar metadata, stored as JSON next to the node file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Format version; readers reject anything they do not know
    pub version: u32,
    /// Maximum entries per node
    pub branching_factor: usize,
    /// Tree height, leaves included; an empty index has height 0
    pub height: usize,
    /// Total number of indexed keys
    pub n_keys: u64,
    /// Byte offset of the root node in the node file
    pub root_offset: u64,
    /// Free-form writer attributes (source dataset, key field names)
    pub attributes: serde_json::Value,
}

/// One leaf entry: a key, where its record lives, and a free annotation
/// carried for the record (for example a per-row byte length)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeafEntry {
    pub key: Value,
    /// Byte offset of the record in the indexed data file
    pub record_offset: u64,
    /// Writer-defined payload; [`Value::Missing`] when the writer has none
    pub annotation: Value,
}

/// One internal entry: the first key of a subtree and where to find it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InternalEntry {
    /// Smallest key in the child's subtree
    pub first_key: Value,
    /// Byte offset of the child node
    pub child_offset: u64,
}

/// A decoded node block
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IndexNode {
    Leaf {
        /// Absolute index of the first key in this leaf
        first_idx: u64,
        entries: Vec<LeafEntry>,
    },
    Internal { entries: Vec<InternalEntry> },
}

/// A query bound: a key plus a lean deciding which side of an equal stored
/// key the bound falls on.
///
/// `leans_right == false` places the bound immediately left of equal keys
/// (an equal key does not count as before the bound); `leans_right == true`
/// places it immediately right (an equal key does count). A closed interval
/// start and an open interval end both lean left; an open start and a closed
/// end both lean right.
#[derive(Debug, Clone)]
pub struct Bound {
    pub key: Value,
    pub leans_right: bool,
}

impl Bound {
    /// Bound for an interval start with the given inclusivity
    pub fn start(key: Value, includes_start: bool) -> Self {
        Bound {
            key,
            leans_right: !includes_start,
        }
    }

    /// Bound for an interval end with the given inclusivity
    pub fn end(key: Value, includes_end: bool) -> Self {
        Bound {
            key,
            leans_right: includes_end,
        }
    }
}

/// Order a stored key against a bound. `Less` means the key sorts before
/// the bound position.
pub fn cmp_key_with_bound(key: &Value, bound: &Bound) -> Ordering {
    match cmp_values(key, &bound.key) {
        Ordering::Equal => {
            if bound.leans_right {
                Ordering::Less
            } else {
                Ordering::Greater
            }
        }
        other => other,
    }
}

/// True when the stored key sorts before the bound position
pub fn key_before_bound(key: &Value, bound: &Bound) -> bool {
    cmp_key_with_bound(key, bound) == Ordering::Less
}

/// Frame a node into a block: tag, length, checksum, payload
pub(crate) fn encode_node(node: &IndexNode) -> EngineResult<Vec<u8>> {
    let tag = match node {
        IndexNode::Leaf { .. } => LEAF_TAG,
        IndexNode::Internal { .. } => INTERNAL_TAG,
    };
    let payload = bincode::serialize(node)?;
    let mut out = Vec::with_capacity(9 + payload.len());
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Decode one framed block, verifying tag and checksum. `path` and `offset`
/// feed error context only.
pub(crate) fn decode_node(block: &[u8], path: &str, offset: u64) -> EngineResult<IndexNode> {
    let (&tag, rest) = block.split_first().ok_or_else(|| {
        EngineError::resource(path, Some(offset), "truncated node block")
    })?;
    if tag != LEAF_TAG && tag != INTERNAL_TAG {
        return Err(EngineError::resource(
            path,
            Some(offset),
            format!("unknown node tag {tag}; file written by an unsupported format version"),
        ));
    }
    if rest.len() < 8 {
        return Err(EngineError::resource(
            path,
            Some(offset),
            "truncated node header",
        ));
    }
    let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
    let crc = u32::from_le_bytes([rest[4], rest[5], rest[6], rest[7]]);
    let payload = rest.get(8..8 + len).ok_or_else(|| {
        EngineError::resource(path, Some(offset), "truncated node payload")
    })?;
    if crc32fast::hash(payload) != crc {
        return Err(EngineError::resource(
            path,
            Some(offset),
            "node checksum mismatch",
        ));
    }
    let node: IndexNode = bincode::deserialize(payload)?;
    let tag_matches = matches!(
        (&node, tag),
        (IndexNode::Leaf { .. }, LEAF_TAG) | (IndexNode::Internal { .. }, INTERNAL_TAG)
    );
    if !tag_matches {
        return Err(EngineError::resource(
            path,
            Some(offset),
            "node tag disagrees with payload",
        ));
    }
    Ok(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bound_lean_resolves_ties() {
        let key = Value::Int32(20);
        let closed_start = Bound::start(Value::Int32(20), true);
        let open_start = Bound::start(Value::Int32(20), false);
        let closed_end = Bound::end(Value::Int32(20), true);
        assert!(!key_before_bound(&key, &closed_start));
        assert!(key_before_bound(&key, &open_start));
        assert!(key_before_bound(&key, &closed_end));
        assert!(key_before_bound(&Value::Int32(10), &closed_start));
        assert!(!key_before_bound(&Value::Int32(30), &closed_end));
    }

    #[test]
    fn node_blocks_round_trip() {
        let node = IndexNode::Leaf {
            first_idx: 8,
            entries: vec![
                LeafEntry {
                    key: Value::locus("chr1", 100),
                    record_offset: 0,
                    annotation: Value::Missing,
                },
                LeafEntry {
                    key: Value::locus("chr1", 250),
                    record_offset: 512,
                    annotation: Value::Int32(37),
                },
            ],
        };
        let block = encode_node(&node).unwrap();
        let decoded = decode_node(&block, "test.idx", 0).unwrap();
        match decoded {
            IndexNode::Leaf { first_idx, entries } => {
                assert_eq!(first_idx, 8);
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].record_offset, 512);
                assert_eq!(entries[1].annotation, Value::Int32(37));
            }
            IndexNode::Internal { .. } => panic!("leaf decoded as internal"),
        }
    }

    #[test]
    fn corrupt_payload_is_detected() {
        let node = IndexNode::Internal {
            entries: vec![InternalEntry {
                first_key: Value::Int32(1),
                child_offset: 9,
            }],
        };
        let mut block = encode_node(&node).unwrap();
        let last = block.len() - 1;
        block[last] ^= 0xff;
        let err = decode_node(&block, "test.idx", 0).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn unknown_tag_is_a_format_error() {
        let node = IndexNode::Leaf {
            first_idx: 0,
            entries: vec![],
        };
        let mut block = encode_node(&node).unwrap();
        block[0] = 7;
        let err = decode_node(&block, "test.idx", 64).unwrap_err();
        assert!(err.to_string().contains("unsupported format"));
    }
}
