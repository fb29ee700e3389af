//! Integration tests for the chunk file format.

use silo::chunk::{Chunk, ChunkKind};
use tempfile::TempDir;

const PAGE: u64 = 4096;

/// Exercises one chunk through the full bisection grid of the two access
/// modes.
fn verify_chunk(chunk: &Chunk) {
    assert_eq!(chunk.min_ts(), 0);
    assert_eq!(chunk.max_ts(), 4);
    assert_eq!(chunk.block_size(), 4);
    assert_eq!(chunk.entries(), 3);
    assert_eq!(chunk.piece_at(0).unwrap(), (0, b"ala ".to_vec()));
    assert_eq!(chunk.piece_at(1).unwrap(), (1, b"ma  ".to_vec()));
    assert_eq!(chunk.piece_at(2).unwrap(), (4, b"kota".to_vec()));

    chunk.append(5, b"test").unwrap();

    for (ts, left, right) in [
        (0, 0, 1),
        (1, 1, 2),
        (2, 2, 2),
        (3, 2, 2),
        (4, 2, 3),
        (5, 3, 4),
        (6, 4, 4),
    ] {
        assert_eq!(chunk.find_left(ts).unwrap(), left, "find_left({ts})");
        assert_eq!(chunk.find_right(ts).unwrap(), right, "find_right({ts})");
    }
}

#[test]
fn test_chunk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("0");

    let chunk = Chunk::create(&path, 0, b"ala ", PAGE, ChunkKind::Normal, 0, false).unwrap();
    chunk.append(1, b"ma  ").unwrap();
    chunk.append(4, b"kota").unwrap();
    verify_chunk(&chunk);
    chunk.close(false).unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), PAGE);
}

#[test]
fn test_chunk_alternative() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("0");

    let chunk = Chunk::create(&path, 0, b"ala ", PAGE, ChunkKind::Normal, 0, false).unwrap();
    chunk.close(false).unwrap();

    // Re-open descriptor-based and continue appending.
    let chunk = Chunk::open(0, ChunkKind::Normal, &path, PAGE, 0, true).unwrap();
    chunk.append(1, b"ma  ").unwrap();
    chunk.append(4, b"kota").unwrap();
    verify_chunk(&chunk);
    chunk.close(false).unwrap();

    assert_eq!(std::fs::metadata(&path).unwrap().len(), PAGE);
}

#[test]
fn test_direct_chunk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("0.direct");

    let chunk = Chunk::create(&path, 0, b"ala ", PAGE, ChunkKind::Direct, 0, false).unwrap();
    chunk.append(1, b"ma  ").unwrap();
    chunk.append(4, b"kota").unwrap();
    verify_chunk(&chunk);
    chunk.close(false).unwrap();

    // Header plus four exact records, no padding, no footer.
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 4 + 4 * 12);

    let chunk = Chunk::open(0, ChunkKind::Direct, &path, PAGE, 0, false).unwrap();
    assert_eq!(chunk.entries(), 4);
    assert_eq!(chunk.max_ts(), 5);
    chunk.close(false).unwrap();
}

#[test]
fn test_gzip_chunk() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("0.gz");

    let chunk = Chunk::create(&path, 0, b"ala ", PAGE, ChunkKind::DirectGzip, 6, false).unwrap();
    chunk.append(1, b"ma  ").unwrap();
    chunk.append(4, b"kota").unwrap();
    verify_chunk(&chunk);
    chunk.close(false).unwrap();

    let chunk = Chunk::open(0, ChunkKind::DirectGzip, &path, PAGE, 6, false).unwrap();
    assert_eq!(chunk.entries(), 4);
    assert_eq!(chunk.piece_at(3).unwrap(), (5, b"test".to_vec()));
    chunk.close(false).unwrap();
}
