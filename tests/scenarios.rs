//! End-to-end scenario tests driving the engine through its public API.
use btree_topology_engine::allocator::InMemoryAllocator;
use btree_topology_engine::bkey::{BKey, BtreePointer, NodeLocator};
use btree_topology_engine::config::EngineConfig;
use btree_topology_engine::engine::Engine;
use btree_topology_engine::error::ErrorKind;
use btree_topology_engine::journal::InMemoryJournal;
use btree_topology_engine::node::{Node, NodeCell, NodeHandle};
use btree_topology_engine::{BtreeId, Pos};
use std::sync::Arc;

fn new_engine() -> Engine {
    Engine::new(
        EngineConfig::for_tests(),
        Arc::new(InMemoryJournal::new(4096)),
        Arc::new(InMemoryAllocator::new(1 << 30)),
    )
}

fn leaf_key(pos: u64) -> BKey {
    BKey::Live {
        pos: Pos(pos),
        value: BtreePointer::V1 {
            locator: NodeLocator {
                device: 0,
                offset: pos,
            },
        },
    }
}

fn leaf(btree_id: BtreeId, keys: &[u64]) -> NodeHandle {
    let mut node = Node::new_empty(btree_id, 0, Pos::MIN, Pos::MAX);
    for &k in keys {
        node.bset.push(leaf_key(k));
    }
    node.format = btree_topology_engine::format::calc_format(&node);
    NodeCell::new(node)
}

/// Splitting a full root leaf produces a level-1 root with two children
/// whose ranges cover the original span with no gap or overlap.
#[test]
fn split_root_leaf_produces_covering_children() {
    let engine = new_engine();
    let btree_id = BtreeId(1);
    let root = leaf(btree_id, &[1, 2, 3, 4]);
    engine.recover_root(btree_id, root.clone());

    engine.do_split(&root, None, &[leaf_key(5)]).unwrap();

    let new_root = engine.root_for_read(btree_id).unwrap();
    let content = new_root.content.read();
    assert_eq!(content.level, 1);
    assert_eq!(content.bset.len(), 2);
    assert_eq!(content.min_key, Pos::MIN);
    assert_eq!(content.max_key, Pos::MAX);

    let mut pivots: Vec<Pos> = content.bset.iter().map(|k| k.pos()).collect();
    pivots.sort();
    assert_eq!(pivots[1], Pos::MAX, "last child must cover up to the parent's max_key");
}

/// Two small siblings under threshold get merged into one child, and the
/// parent ends up with exactly one pointer: the stale pointer to the
/// now-dying left sibling is deleted, not just shadowed by the new one.
#[test]
fn merge_siblings_under_threshold() {
    let engine = new_engine();
    let btree_id = BtreeId(2);
    // Parent starts out holding A's and B's own pointers, at their
    // max_key, the way a real parent would before any merge.
    let root = leaf(btree_id, &[10, 20]);
    {
        let mut content = root.content.read().clone();
        content.level = 1;
        *root.content.lock_intent().upgrade_to_write() = content;
    }
    engine.recover_root(btree_id, root.clone());

    let a = leaf(btree_id, &[1, 2]);
    {
        let mut c = a.content.read().clone();
        c.min_key = Pos(0);
        c.max_key = Pos(10);
        *a.content.lock_intent().upgrade_to_write() = c;
    }
    let b = leaf(btree_id, &[12]);
    {
        let mut c = b.content.read().clone();
        c.min_key = Pos(11);
        c.max_key = Pos(20);
        *b.content.lock_intent().upgrade_to_write() = c;
    }

    let merged = engine.maybe_merge(&a, &b, &root).unwrap();
    assert!(merged);

    let parent_content = root.content.read();
    let live: Vec<Pos> = parent_content
        .bset
        .iter()
        .filter(|k| !k.is_whiteout())
        .map(|k| k.pos())
        .collect();
    assert_eq!(
        live,
        vec![Pos(20)],
        "A's stale pointer at pos 10 must be deleted, not left alongside the new one"
    );
    assert!(
        parent_content
            .bset
            .iter()
            .find(|k| k.pos() == Pos(10))
            .is_some_and(|k| k.is_whiteout()),
        "pos 10 must carry a whiteout, not be silently dropped"
    );
}

/// A rewrite completes successfully and preserves the node's keys.
#[test]
fn rewrite_preserves_contents() {
    let engine = new_engine();
    let btree_id = BtreeId(3);
    let root = leaf(btree_id, &[1, 2, 3]);
    engine.recover_root(btree_id, root.clone());

    engine.rewrite(&root, None).unwrap();

    let new_root = engine.root_for_read(btree_id).unwrap();
    let content = new_root.content.read();
    let mut positions: Vec<u64> = content.bset.iter().map(|k| k.pos().0).collect();
    positions.sort();
    assert_eq!(positions, vec![1, 2, 3]);
}

/// Once the journal is in its fatal error state, new topology updates are
/// refused rather than silently corrupting the tree.
#[test]
fn journal_error_short_circuits_new_updates() {
    let journal = Arc::new(InMemoryJournal::new(4096));
    let engine = Engine::new(
        EngineConfig::for_tests(),
        journal.clone(),
        Arc::new(InMemoryAllocator::new(1 << 30)),
    );
    let btree_id = BtreeId(4);
    let root = leaf(btree_id, &[1]);
    engine.recover_root(btree_id, root.clone());

    journal.inject_error();

    let err = engine.rewrite(&root, None).unwrap_err();
    assert!(matches!(err.kind(), ErrorKind::JournalError));
    assert_eq!(engine.nr_pending(), 0, "a refused update must not linger");
}

/// Splitting a level-2 root yields a level-3 root.
#[test]
fn depth_increases_on_split() {
    let engine = new_engine();
    let btree_id = BtreeId(5);
    let mut node = Node::new_empty(btree_id, 2, Pos::MIN, Pos::MAX);
    for k in 1..=4u64 {
        node.bset.push(leaf_key(k));
    }
    node.format = btree_topology_engine::format::calc_format(&node);
    let root = NodeCell::new(node);
    engine.recover_root(btree_id, root.clone());

    engine.do_split(&root, None, &[leaf_key(5)]).unwrap();

    let new_root = engine.root_for_read(btree_id).unwrap();
    assert_eq!(new_root.content.read().level, 3);
}

/// `start()` failing before any node is published (here: disk space
/// exhaustion) must not leak journal credit or pool nodes, even across
/// repeated retries.
#[test]
fn idempotent_retry_leaks_nothing_on_start_failure() {
    let journal = Arc::new(InMemoryJournal::new(4096));
    let allocator = Arc::new(InMemoryAllocator::new(1));
    let engine = Engine::new(EngineConfig::for_tests(), journal, allocator);
    let btree_id = BtreeId(6);
    let root = leaf(btree_id, &[1, 2, 3, 4]);
    engine.recover_root(btree_id, root.clone());

    for _ in 0..3 {
        let result = engine.do_split(&root, None, &[leaf_key(5)]);
        assert!(result.is_err());
        assert_eq!(engine.nr_pending(), 0);
    }
}
