//! Crash-consistency tests.
//!
//! Each scenario builds a tree in a crash-simulating pool, then replays one
//! mutation once per persist it performs. The durable image captured right
//! after the `n`-th persist is written to a file and reopened, which runs
//! recovery. The recovered tree must hold exactly the contents from before
//! or after the mutation, pass `verify`, and accept further writes.

#![expect(clippy::unwrap_used, reason = "fail fast in tests")]

mod common;

use nvart::key::encode_u64;
use nvart::{ArtConfig, ArtTree, InsertOutcome, RemoveOutcome, UpdateOutcome};

const POOL: usize = 4 << 20;

type Records = Vec<(Vec<u8>, Vec<u8>)>;

fn crash_tree() -> ArtTree {
    ArtTree::create(ArtConfig::in_memory(POOL).with_crash_simulation()).unwrap()
}

/// `prefix` followed by one byte, for every byte in `bytes`.
fn keyed(prefix: &[u8], bytes: impl IntoIterator<Item = u8>) -> Vec<Vec<u8>> {
    bytes
        .into_iter()
        .map(|b| {
            let mut k = prefix.to_vec();
            k.push(b);
            k
        })
        .collect()
}

fn insert_all(tree: &ArtTree, keys: &[Vec<u8>]) {
    for k in keys {
        assert_eq!(tree.insert(k, k).unwrap(), InsertOutcome::Inserted);
    }
}

/// Replay `op` against a fresh copy of the `setup` tree for every persist
/// it issues, and check each crash image.
fn check_every_crash_point(setup: impl Fn(&ArtTree), op: impl Fn(&ArtTree)) {
    common::init_tracing();

    // Dry run: contents on both sides and the number of persists.
    let dry = crash_tree();
    setup(&dry);
    let before: Records = common::dump(&dry);
    let start: usize = dry.pool().flush_count();
    op(&dry);
    let flushes: usize = dry.pool().flush_count() - start;
    let after: Records = common::dump(&dry);
    assert!(flushes > 0, "mutation persisted nothing");
    assert_ne!(before, after, "mutation changed nothing");

    for n in 1..=flushes {
        let tree = crash_tree();
        setup(&tree);
        tree.pool().arm_crash_point(n);
        op(&tree);
        let image: Vec<u8> = tree.pool().take_crash_image().unwrap();
        drop(tree);

        let (_dir, recovered) = common::reopen_image(&image);
        let contents: Records = common::dump(&recovered);
        assert!(
            contents == before || contents == after,
            "crash after persist {n}/{flushes} recovered to neither state: {} records",
            contents.len()
        );
        if n == flushes {
            assert_eq!(contents, after, "all persists done but the mutation is lost");
        }
        assert_eq!(recovered.len(), contents.len());
        common::assert_healthy(&recovered);

        // Free lists were rebuilt: writes work and reachable data survives.
        assert_eq!(
            recovered.insert(b"\xfe after crash", b"ok").unwrap(),
            InsertOutcome::Inserted
        );
        assert_eq!(recovered.lookup(b"\xfe after crash").as_deref(), Some(&b"ok"[..]));
        for (k, v) in &contents {
            assert_eq!(recovered.lookup(k).as_ref(), Some(v));
        }
        common::assert_healthy(&recovered);
    }
}

// ============================================================================
//  Inserts
// ============================================================================

#[test]
fn insert_into_existing_leaf_array() {
    check_every_crash_point(
        |t| insert_all(t, &[b"apple".to_vec(), b"apricot".to_vec()]),
        |t| assert_eq!(t.insert(b"apex", b"1").unwrap(), InsertOutcome::Inserted),
    );
}

#[test]
fn insert_new_leaf_array_under_root() {
    check_every_crash_point(
        |t| insert_all(t, &[b"apple".to_vec(), b"cherry".to_vec()]),
        |t| assert_eq!(t.insert(b"banana", b"2").unwrap(), InsertOutcome::Inserted),
    );
}

#[test]
fn insert_splitting_a_compressed_prefix() {
    // 65 keys sharing "user:00" split into a branch with a six-byte prefix;
    // "uzz" then diverges inside that prefix.
    let keys: Vec<Vec<u8>> = (0..65u32)
        .map(|i| format!("user:{i:04}").into_bytes())
        .collect();
    check_every_crash_point(
        |t| insert_all(t, &keys),
        |t| assert_eq!(t.insert(b"uzz", b"3").unwrap(), InsertOutcome::Inserted),
    );
}

#[test]
fn insert_splitting_a_full_leaf_array() {
    let mut keys: Vec<Vec<u8>> = keyed(b"sA", 0..32);
    keys.extend(keyed(b"sB", 0..32));
    check_every_crash_point(
        |t| insert_all(t, &keys),
        |t| assert_eq!(t.insert(b"sA\x20", b"4").unwrap(), InsertOutcome::Inserted),
    );
}

#[test]
fn insert_after_integer_split() {
    // Big-endian integers differ only in their last byte: the split fans
    // out into one LeafArray per key.
    let keys: Vec<Vec<u8>> = (0..65u64).map(|i| encode_u64(i).to_vec()).collect();
    check_every_crash_point(
        |t| insert_all(t, &keys),
        |t| {
            let k = encode_u64(1_000);
            assert_eq!(t.insert(&k, &k).unwrap(), InsertOutcome::Inserted);
        },
    );
}

#[test]
fn insert_splitting_then_growing_a_branch() {
    // One full LeafArray over four second bytes: the next insert splits it
    // into an N4, which is then full for a fifth byte.
    let keys: Vec<Vec<u8>> = (b'A'..=b'D').flat_map(|c| keyed(&[b'k', c], 0..16)).collect();
    check_every_crash_point(
        |t| insert_all(t, &keys),
        |t| assert_eq!(t.insert(b"kE", b"5").unwrap(), InsertOutcome::Inserted),
    );
}

// ============================================================================
//  Updates, tombstones and removals
// ============================================================================

#[test]
fn update_value() {
    check_every_crash_point(
        |t| insert_all(t, &keyed(b"row", 0..10)),
        |t| assert_eq!(t.update(b"row\x04", b"replaced").unwrap(), UpdateOutcome::Updated),
    );
}

#[test]
fn tombstone_live_key() {
    check_every_crash_point(
        |t| insert_all(t, &keyed(b"row", 0..10)),
        |t| t.remove_tombstone(b"row\x07").unwrap(),
    );
}

#[test]
fn revive_tombstoned_key() {
    check_every_crash_point(
        |t| {
            insert_all(t, &keyed(b"row", 0..10));
            t.remove_tombstone(b"row\x02").unwrap();
        },
        |t| assert_eq!(t.insert(b"row\x02", b"back").unwrap(), InsertOutcome::Inserted),
    );
}

#[test]
fn remove_from_shared_leaf_array() {
    check_every_crash_point(
        |t| insert_all(t, &keyed(b"row", 0..10)),
        |t| assert_eq!(t.remove(b"row\x05").unwrap(), RemoveOutcome::Removed),
    );
}

#[test]
fn remove_last_key_of_root_child() {
    check_every_crash_point(
        |t| insert_all(t, &[b"apple".to_vec(), b"banana".to_vec()]),
        |t| assert_eq!(t.remove(b"banana").unwrap(), RemoveOutcome::Removed),
    );
}

#[test]
fn remove_merging_an_n4() {
    // 63 "mA.." keys plus "mB" fill one LeafArray; a 65th key splits it into
    // an N4 over {A, B}. Removing "mB" leaves the N4 one child, so it merges.
    let mut keys: Vec<Vec<u8>> = keyed(b"mA", 0..63);
    keys.push(b"mB".to_vec());
    keys.push(b"mA\x3f".to_vec());
    check_every_crash_point(
        |t| insert_all(t, &keys),
        |t| assert_eq!(t.remove(b"mB").unwrap(), RemoveOutcome::Removed),
    );
}

#[test]
fn remove_merging_an_n4_into_a_branch() {
    // "qB" plus 64 "qA.." keys split twice: an N4 at depth 1 over {A, B},
    // whose A child is an N4 at depth 2 over {x, y}. Removing "qB" lifts
    // the inner N4 into the root, extending its prefix by "A".
    let mut keys: Vec<Vec<u8>> = keyed(b"qAx", 0..32);
    keys.extend(keyed(b"qAy", 0..31));
    keys.push(b"qB".to_vec());
    keys.push(b"qAy\x1f".to_vec());
    keys.push(b"qAy\x20".to_vec());
    check_every_crash_point(
        |t| {
            insert_all(t, &keys);
            assert_eq!(t.verify().n4, 2);
        },
        |t| {
            assert_eq!(t.remove(b"qB").unwrap(), RemoveOutcome::Removed);
            assert_eq!(t.verify().n4, 1);
        },
    );
}

#[test]
fn remove_shrinking_n16_to_n4() {
    // A split over {A, B, C, D} gives an N4; "kE" grows it to an N16, and
    // removing "kE" again leaves an N16 with four children.
    let mut keys: Vec<Vec<u8>> = keyed(b"kA", 0..61);
    keys.extend([b"kB".to_vec(), b"kC".to_vec(), b"kD".to_vec()]);
    keys.push(b"kA\x3d".to_vec());
    keys.push(b"kE".to_vec());
    check_every_crash_point(
        |t| {
            insert_all(t, &keys);
            assert_eq!(t.remove(b"kE").unwrap(), RemoveOutcome::Removed);
            let stats = t.verify();
            assert_eq!((stats.n4, stats.n16), (0, 1));
        },
        |t| {
            assert_eq!(t.remove(b"kD").unwrap(), RemoveOutcome::Removed);
            let stats = t.verify();
            assert_eq!((stats.n4, stats.n16), (1, 0));
        },
    );
}

#[test]
fn remove_shrinking_n48_to_n16() {
    // 47 "nA.." keys and 17 single-key groups split into an N48 with 18
    // children; five removals bring it down to 13.
    let singles: Vec<Vec<u8>> = keyed(b"n", b'B'..b'B' + 17);
    let mut keys: Vec<Vec<u8>> = keyed(b"nA", 0..47);
    keys.extend(singles.iter().cloned());
    keys.push(b"nA\x2f".to_vec());
    check_every_crash_point(
        |t| {
            insert_all(t, &keys);
            assert_eq!(t.verify().n48, 1);
            for k in &singles[..5] {
                assert_eq!(t.remove(k).unwrap(), RemoveOutcome::Removed);
            }
            assert_eq!(t.verify().n48, 1);
        },
        |t| {
            assert_eq!(t.remove(&singles[5]).unwrap(), RemoveOutcome::Removed);
            let stats = t.verify();
            assert_eq!((stats.n48, stats.n16), (0, 1));
        },
    );
}

#[test]
fn remove_shrinking_n256_to_n48() {
    // 65 one-byte suffixes split into a non-root N256; 27 removals bring it
    // down to 38 children.
    let keys: Vec<Vec<u8>> = keyed(b"p", 0..65);
    check_every_crash_point(
        |t| {
            insert_all(t, &keys);
            assert_eq!(t.verify().n256, 2);
            for k in &keys[..27] {
                assert_eq!(t.remove(k).unwrap(), RemoveOutcome::Removed);
            }
            assert_eq!(t.verify().n256, 2);
        },
        |t| {
            assert_eq!(t.remove(&keys[27]).unwrap(), RemoveOutcome::Removed);
            let stats = t.verify();
            assert_eq!((stats.n256, stats.n48), (1, 1));
        },
    );
}

// ============================================================================
//  Simulation plumbing
// ============================================================================

#[test]
fn durable_image_matches_after_every_completed_operation() {
    let tree = crash_tree();
    insert_all(&tree, &keyed(b"k", 0..100));
    tree.remove(b"k\x10").unwrap();

    let image: Vec<u8> = tree.pool().durable_image().unwrap();
    let (_dir, recovered) = common::reopen_image(&image);
    assert_eq!(common::dump(&recovered), common::dump(&tree));
    assert_eq!(recovered.len(), 99);
    common::assert_healthy(&recovered);
}

#[test]
fn unarmed_pool_captures_nothing() {
    let plain = common::memory_tree(POOL);
    plain.insert(b"a", b"1").unwrap();
    assert!(plain.pool().take_crash_image().is_none());
    assert!(plain.pool().durable_image().is_none());
    assert_eq!(plain.pool().flush_count(), 0);

    let sim = crash_tree();
    sim.pool().arm_crash_point(1_000_000);
    sim.insert(b"a", b"1").unwrap();
    assert!(sim.pool().take_crash_image().is_none());
}
