//! End-to-end index coverage: write, reopen, query, and drive the compiled
//! descent against the plain reader over realistic genomic keys.

use tempfile::tempdir;

use locus::index::{Bound, IndexReader, IndexWriter, StagedIndexReader};
use locus::Value;

/// Locus keys across two contigs, sorted the way the value order sorts them.
fn locus_keys() -> Vec<Value> {
    let mut keys = Vec::new();
    for pos in (100..2100).step_by(100) {
        keys.push(Value::locus("chr1", pos));
    }
    for pos in (500..1500).step_by(50) {
        keys.push(Value::locus("chr2", pos));
    }
    keys
}

fn write_index(dir: &std::path::Path, fanout: usize) -> std::path::PathBuf {
    let name = dir.join("part-0");
    let mut w = IndexWriter::create(
        &name,
        fanout,
        serde_json::json!({ "key": ["contig", "position"] }),
    )
    .unwrap();
    for (i, key) in locus_keys().into_iter().enumerate() {
        w.append(key, i as u64 * 48, Value::Missing).unwrap();
    }
    w.finish().unwrap();
    name
}

#[test]
fn reopened_index_reports_its_shape() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 8);
    let r = IndexReader::open(&name).unwrap();
    let meta = r.metadata();
    assert_eq!(meta.n_keys, 40);
    assert_eq!(meta.branching_factor, 8);
    assert_eq!(meta.attributes["key"][0], "contig");
}

#[test]
fn point_lookups_across_contigs() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 8);
    let mut r = IndexReader::open(&name).unwrap();

    assert_eq!(r.lower_bound(&Value::locus("chr1", 100)).unwrap(), 0);
    assert_eq!(r.lower_bound(&Value::locus("chr1", 150)).unwrap(), 1);
    // All of chr1 sorts before any chr2 key.
    assert_eq!(r.lower_bound(&Value::locus("chr2", 0)).unwrap(), 20);
    assert_eq!(r.upper_bound(&Value::locus("chr2", 1450)).unwrap(), 40);
    assert_eq!(r.lower_bound(&Value::locus("chr3", 1)).unwrap(), 40);
}

#[test]
fn interval_selects_a_contig_slice() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 8);
    let mut r = IndexReader::open(&name).unwrap();

    // chr2:600-800 closed on both ends: 600, 650, 700, 750, 800.
    let slice = r
        .query_interval(
            &Value::locus("chr2", 600),
            &Value::locus("chr2", 800),
            true,
            true,
        )
        .unwrap();
    assert_eq!(slice.count, 5);
    assert_eq!(slice.start, 22);
    let first = slice.first_record.unwrap();
    assert_eq!(first.key, Value::locus("chr2", 600));
    assert_eq!(first.record_offset, 22 * 48);

    // Whole of chr1 via a half-open interval ending at the contig boundary.
    let slice = r
        .query_interval(
            &Value::locus("chr1", 0),
            &Value::locus("chr2", 0),
            true,
            false,
        )
        .unwrap();
    assert_eq!((slice.start, slice.count), (0, 20));
}

#[test]
fn every_fanout_answers_identically() {
    let dir = tempdir().unwrap();
    let wide = write_index(dir.path(), 32);
    // Different tree shapes over the same keys.
    let deep_dir = tempdir().unwrap();
    let deep = {
        let name = deep_dir.path().join("part-0");
        let mut w = IndexWriter::create(&name, 2, serde_json::Value::Null).unwrap();
        for (i, key) in locus_keys().into_iter().enumerate() {
            w.append(key, i as u64 * 48, Value::Missing).unwrap();
        }
        w.finish().unwrap();
        name
    };
    let mut a = IndexReader::open(&wide).unwrap();
    let mut b = IndexReader::open(&deep).unwrap();
    assert!(b.metadata().height > a.metadata().height);
    for key in locus_keys() {
        assert_eq!(a.lower_bound(&key).unwrap(), b.lower_bound(&key).unwrap());
        assert_eq!(a.upper_bound(&key).unwrap(), b.upper_bound(&key).unwrap());
    }
}

#[test]
fn staged_descent_matches_plain_reader_on_locus_keys() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 4);
    let mut plain = IndexReader::open(&name).unwrap();
    let mut staged = StagedIndexReader::new(IndexReader::open(&name).unwrap()).unwrap();

    for key in locus_keys() {
        assert_eq!(
            staged.lower_bound(&key).unwrap(),
            plain.lower_bound(&key).unwrap()
        );
    }
    for (contig, pos) in [("chr0", 1), ("chr1", 1050), ("chr2", 525), ("chr9", 1)] {
        let probe = Value::locus(contig, pos);
        assert_eq!(
            staged.bound_query(&Bound::start(probe.clone(), false)).unwrap(),
            plain.bound_query(&Bound::start(probe, false)).unwrap()
        );
    }
    let slice = plain
        .query_interval(
            &Value::locus("chr2", 600),
            &Value::locus("chr2", 800),
            true,
            true,
        )
        .unwrap();
    let (start, count) = staged
        .query_interval(
            &Value::locus("chr2", 600),
            &Value::locus("chr2", 800),
            true,
            true,
        )
        .unwrap();
    assert_eq!((start, count), (slice.start, slice.count));
}

#[test]
fn annotations_ride_along_with_leaf_entries() {
    let dir = tempdir().unwrap();
    let name = dir.path().join("annotated");
    let mut w = IndexWriter::create(&name, 4, serde_json::Value::Null).unwrap();
    for (i, key) in locus_keys().into_iter().enumerate() {
        w.append(key, i as u64 * 48, Value::Int32(i as i32)).unwrap();
    }
    w.finish().unwrap();
    let mut r = IndexReader::open(&name).unwrap();
    let (pos, record) = r
        .bound_query_record(&Bound::start(Value::locus("chr2", 750), true))
        .unwrap();
    assert_eq!(pos, 25);
    assert_eq!(record.unwrap().annotation, Value::Int32(25));
}

#[test]
fn descents_share_decoded_nodes() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 4);
    let mut r = IndexReader::open(&name).unwrap();

    // Touch every leaf once.
    for key in locus_keys() {
        r.lower_bound(&key).unwrap();
    }
    let full_scan = r.cache_stats();
    // A second full sweep decodes nothing new.
    for key in locus_keys() {
        r.lower_bound(&key).unwrap();
    }
    assert_eq!(r.cache_stats().decodes, full_scan.decodes);
    assert!(r.cache_stats().hits > full_scan.hits);
}

#[test]
fn close_releases_the_reader() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 4);
    let mut staged = StagedIndexReader::new(IndexReader::open(&name).unwrap()).unwrap();
    staged.lower_bound(&Value::locus("chr1", 100)).unwrap();
    staged.close();
    let err = staged.lower_bound(&Value::locus("chr1", 100)).unwrap_err();
    assert!(err.is_internal());
}

#[test]
fn truncated_node_file_is_a_resource_error() {
    let dir = tempdir().unwrap();
    let name = write_index(dir.path(), 4);
    let idx = name.with_extension("idx");
    let bytes = std::fs::read(&idx).unwrap();
    std::fs::write(&idx, &bytes[..bytes.len() / 2]).unwrap();
    let mut r = IndexReader::open(&name).unwrap();
    let err = r.lower_bound(&Value::locus("chr1", 100)).unwrap_err();
    assert!(matches!(err, locus::EngineError::Resource { .. }));
}
