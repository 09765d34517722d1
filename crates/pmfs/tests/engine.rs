//! End-to-end scenarios for the data engine: writes through the radix
//! tree, log growth and garbage collection, directory index behavior,
//! truncation, and crash recovery through the truncate list.

use std::sync::Arc;

use pmfs::fs::PMFS_RESERVED_BLOCKS;
use pmfs::{
    BlockAllocator, LiteJournal, MountOpts, PmArena, PmfsState, RangeAllocator, SetattrFields,
};
use pmfs_common::inode::{S_IFDIR, S_IFREG};
use pmfs_common::log::{block_off, FileWriteEntry, LOG_ENTRY_SIZE};
use pmfs_common::{bkdr_hash, BlockType};

const MB: usize = 1024 * 1024;

fn fresh_fs(len: usize) -> (PmfsState, Arc<RangeAllocator>) {
    let arena = PmArena::volatile(len);
    let allocator = Arc::new(RangeAllocator::new(
        PMFS_RESERVED_BLOCKS,
        (len >> 12) as u64,
    ));
    let journal = Arc::new(LiteJournal::new());
    let fs = PmfsState::format(arena, allocator.clone(), journal, 0, "pmfs-test").unwrap();
    (fs, allocator)
}

fn write_block(fs: &PmfsState, file: &Arc<pmfs::InodeHeader>, blk: u64, fill: u8) {
    let buf = vec![fill; 4096];
    assert_eq!(fs.write(file, blk << 12, &buf).unwrap(), 4096);
}

/// Walk the log page chain and count its pages.
fn chain_length(fs: &PmfsState, pi_off: u64) -> u32 {
    let pi = fs.inode_at(pi_off);
    if pi.log_head == 0 {
        return 0;
    }
    let mut pages = 1;
    let mut page = block_off(pi.log_head);
    loop {
        let next = fs.next_log_page(page);
        if next == 0 {
            break;
        }
        pages += 1;
        page = next;
    }
    pages
}

/// Is `p` inside the chain starting at `log_head`?
fn chain_contains(fs: &PmfsState, pi_off: u64, p: u64) -> bool {
    let pi = fs.inode_at(pi_off);
    let mut page = block_off(pi.log_head);
    loop {
        if block_off(p) == page {
            return true;
        }
        let next = fs.next_log_page(page);
        if next == 0 {
            return false;
        }
        page = next;
    }
}

#[test]
fn write_one_block_and_read_it_back() {
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"a", S_IFREG | 0o644, 0).unwrap();

    write_block(&fs, &file, 0, b'A');

    let off = fs.find_data_block(&file, 0);
    assert_ne!(off, 0);
    assert!(fs.arena().bytes(off, 4096).iter().all(|&b| b == b'A'));

    let mut buf = vec![0u8; 4096];
    assert_eq!(fs.read(&file, 0, &mut buf).unwrap(), 4096);
    assert_eq!(buf, vec![b'A'; 4096]);

    let pi = fs.inode_at(file.pi_off);
    assert_eq!(pi.i_size, 4096);
    assert_eq!(pi.height, 0);
    assert_eq!(pi.i_blocks, 1);
}

#[test]
fn sparse_writes_grow_height_to_three() {
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"sparse", S_IFREG | 0o644, 0).unwrap();

    // one block per tree height: direct, height 2, height 3
    for (blk, fill) in [(0u64, b'x'), (513, b'y'), (262_145, b'z')] {
        write_block(&fs, &file, blk, fill);
    }

    let pi = fs.inode_at(file.pi_off);
    assert_eq!(pi.height, 3);

    for (blk, fill) in [(0u64, b'x'), (513, b'y'), (262_145, b'z')] {
        let off = fs.find_data_block(&file, blk);
        assert_ne!(off, 0, "block {} should be mapped", blk);
        assert!(fs.arena().bytes(off, 4096).iter().all(|&b| b == fill));
    }
    // everything else is a hole
    for blk in [1u64, 2, 512, 514, 1000, 262_144, 262_146, 300_000] {
        assert_eq!(fs.find_data_block(&file, blk), 0, "block {} should be a hole", blk);
    }
}

#[test]
fn truncate_shrinks_tree_and_frees_blocks() {
    let (fs, alloc) = fresh_fs(64 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"big", S_IFREG | 0o644, 0).unwrap();

    for blk in 0..1024u64 {
        write_block(&fs, &file, blk, (blk % 251) as u8);
    }
    {
        let pi = fs.inode_at(file.pi_off);
        assert_eq!(pi.height, 2);
        assert_eq!(pi.i_blocks, 1024);
        assert_eq!(pi.i_size, 4 * MB as u64);
    }

    let free_before = alloc.count_free_blocks();
    fs.setattr(&file, &SetattrFields::size(2 * MB as u64)).unwrap();

    let pi = fs.inode_at(file.pi_off);
    assert_eq!(pi.height, 1);
    assert_eq!(pi.i_blocks, 512);
    assert_eq!(pi.i_size, 2 * MB as u64);

    // 512 data blocks came back, plus at least one interior node
    assert!(alloc.count_free_blocks() >= free_before + 512);

    for blk in 0..512u64 {
        assert_ne!(fs.find_data_block(&file, blk), 0);
    }
    for blk in 512..1024u64 {
        assert_eq!(fs.find_data_block(&file, blk), 0);
    }
}

#[test]
fn truncate_is_idempotent() {
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"idem", S_IFREG | 0o644, 0).unwrap();

    for blk in 0..8u64 {
        write_block(&fs, &file, blk, b'i');
    }

    // truncating to the current size moves no blocks
    let blocks_before = fs.inode_at(file.pi_off).i_blocks;
    fs.setattr(&file, &SetattrFields::size(8 * 4096)).unwrap();
    assert_eq!(fs.inode_at(file.pi_off).i_blocks, blocks_before);

    // truncate to zero twice
    fs.setattr(&file, &SetattrFields::size(0)).unwrap();
    fs.setattr(&file, &SetattrFields::size(0)).unwrap();
    let pi = fs.inode_at(file.pi_off);
    assert_eq!(pi.root, 0);
    assert_eq!(pi.height, 0);
    assert_eq!(pi.i_blocks, 0);
}

#[test]
fn log_gc_reclaims_fully_invalidated_pages() {
    let (fs, alloc) = fresh_fs(64 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"log", S_IFREG | 0o644, 0).unwrap();

    // fill the first log page exactly (127 entries)
    for blk in 0..127u64 {
        write_block(&fs, &file, blk, b'1');
    }
    let first_page = {
        let pi = fs.inode_at(file.pi_off);
        assert_eq!(pi.log_pages, 1);
        block_off(pi.log_head)
    };

    // rewriting every block supersedes all 127 entries; the 128th append
    // grows the log (no page is dead yet at that point)
    for blk in 0..127u64 {
        write_block(&fs, &file, blk, b'2');
    }
    {
        let pi = fs.inode_at(file.pi_off);
        assert_eq!(block_off(pi.log_head), first_page);
        assert!(pi.log_pages >= 2);
    }

    // the next growth collects the now fully-dead first page
    let free_before = alloc.count_free_blocks();
    for blk in 0..127u64 {
        write_block(&fs, &file, blk, b'3');
    }

    let pi = fs.inode_at(file.pi_off);
    assert_ne!(block_off(pi.log_head), first_page, "dead head page not collected");
    assert!(alloc.count_free_blocks() > free_before - 512, "pages leaked");

    // log invariants: head and tail inside the chain, page count matches
    assert!(chain_contains(&fs, file.pi_off, pi.log_head));
    assert!(chain_contains(&fs, file.pi_off, pi.log_tail));
    assert_eq!(chain_length(&fs, file.pi_off), pi.log_pages);

    // data is still the newest copy everywhere
    for blk in 0..127u64 {
        let off = fs.find_data_block(&file, blk);
        assert_ne!(off, 0);
        assert!(fs.arena().bytes(off, 4096).iter().all(|&b| b == b'3'));
    }
}

#[test]
fn assign_frees_predecessor_and_marks_entry() {
    let (fs, alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"cow", S_IFREG | 0o644, 0).unwrap();

    write_block(&fs, &file, 0, b'a');
    let old_entry = fs.inode_at(file.pi_off).root; // height 0: root is the entry
    let old_data = fs.find_data_block(&file, 0);
    assert_ne!(old_data, 0);

    write_block(&fs, &file, 0, b'b');

    // the displaced block is back on the free list
    assert!(alloc.is_free(old_data >> 12, 1), "old data block not freed");
    // and the superseded entry was marked exactly once
    let entry = fs.arena().at::<FileWriteEntry>(old_entry);
    assert_eq!(entry.invalid_count(), 1);
    assert!(entry.is_dead());

    let new_data = fs.find_data_block(&file, 0);
    assert_ne!(new_data, 0);
    assert_ne!(new_data, old_data);
    assert!(fs.arena().bytes(new_data, 4096).iter().all(|&b| b == b'b'));
}

#[test]
fn directory_index_matches_reference_map() {
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();

    let d = fs.create(&root, b"d", S_IFDIR | 0o755, 0).unwrap();
    fs.create(&d, b"a", S_IFREG | 0o644, 0).unwrap();
    fs.create(&d, b"b", S_IFREG | 0o644, 0).unwrap();

    // reference: ordered by BKDR hash
    let mut reference: Vec<(u32, &[u8])> = vec![(bkdr_hash(b"a"), b"a"), (bkdr_hash(b"b"), b"b")];
    reference.sort_by_key(|(h, _)| *h);

    let listed = fs.list_dir(&d);
    let expect: Vec<Vec<u8>> = reference.iter().map(|(_, n)| n.to_vec()).collect();
    assert_eq!(listed, expect);

    // parent gained the subdirectory link
    assert_eq!(fs.inode_at(root.pi_off).i_links_count, 3);

    // unlink both children, then the directory itself
    fs.unlink(&d, b"a").unwrap();
    fs.unlink(&d, b"b").unwrap();
    assert!(fs.list_dir(&d).is_empty());

    let d_ino = d.ino;
    fs.unlink(&root, b"d").unwrap();
    fs.evict_inode(&d).unwrap();
    assert_eq!(fs.inode_at(root.pi_off).i_links_count, 2);
    assert!(fs.iget(d_ino).is_err());

    // duplicate names are rejected through the hash comparator
    fs.create(&root, b"x", S_IFREG | 0o644, 0).unwrap();
    assert!(fs.create(&root, b"x", S_IFREG | 0o644, 0).is_err());
}

#[test]
fn directory_index_rebuilds_after_remount() {
    let len = 16 * MB;
    let (fs, _alloc) = fresh_fs(len);
    {
        let root = fs.root().unwrap();
        let d = fs.create(&root, b"dir", S_IFDIR | 0o755, 0).unwrap();
        fs.create(&d, b"one", S_IFREG | 0o644, 0).unwrap();
        fs.create(&d, b"two", S_IFREG | 0o644, 0).unwrap();
        fs.create(&d, b"three", S_IFREG | 0o644, 0).unwrap();
        fs.unlink(&d, b"two").unwrap();

        // a mode change is logged as a setattr record and replayed
        let attr = SetattrFields {
            valid: pmfs::AttrMask::MODE,
            mode: S_IFDIR | 0o700,
            ..Default::default()
        };
        fs.setattr(&d, &attr).unwrap();
    }

    // power cycle
    let bytes = fs.into_arena().into_backing().unwrap();
    let arena = PmArena::from_backing(bytes);
    let allocator = Arc::new(RangeAllocator::empty());
    let journal = Arc::new(LiteJournal::new());
    let fs = PmfsState::mount(arena, allocator, journal, MountOpts::empty()).unwrap();

    let root = fs.root().unwrap();
    let root_inner = root.inner.lock();
    let node = fs.find_dir_node(&root_inner, b"dir").unwrap();
    drop(root_inner);

    let d = fs.iget(node.ino).unwrap();
    let names = fs.list_dir(&d);
    // "." and ".." come back from the log, "two" does not
    assert!(names.contains(&b"one".to_vec()));
    assert!(names.contains(&b"three".to_vec()));
    assert!(!names.contains(&b"two".to_vec()));

    // the rebuilt index covers the root and the subdirectory
    let sizes = fs.dir_index_sizes();
    assert_eq!(sizes[&node.ino], 4); // ".", "..", "one", "three"

    // the setattr record came back through the log replay
    assert_eq!(fs.inode_at(d.pi_off).i_mode, S_IFDIR | 0o700);
}

#[test]
fn rmdir_then_crash_reclaims_the_directory() {
    let len = 16 * MB;
    let (fs, _alloc) = fresh_fs(len);
    let gone_ino;
    {
        let root = fs.root().unwrap();
        let d = fs.create(&root, b"doomed", S_IFDIR | 0o755, 0).unwrap();
        gone_ino = d.ino;
        fs.unlink(&root, b"doomed").unwrap();
        assert_eq!(fs.truncate_list_len(), 1);
        // crash before evict: the link-change record is the last log entry
    }

    let bytes = fs.into_arena().into_backing().unwrap();
    let arena = PmArena::from_backing(bytes);
    let allocator = Arc::new(RangeAllocator::empty());
    let journal = Arc::new(LiteJournal::new());
    let fs = PmfsState::mount(arena, allocator.clone(), journal, MountOpts::empty()).unwrap();

    assert_eq!(fs.truncate_list_len(), 0);
    assert!(fs.iget(gone_ino).is_err());
    // the directory's log page came back
    assert!(allocator.count_free_blocks() >= 1);

    let root = fs.root().unwrap();
    assert!(!fs.list_dir(&root).contains(&b"doomed".to_vec()));
}

#[test]
fn unlink_while_open_recovers_after_crash() {
    let len = 32 * MB;
    let (fs, _alloc) = fresh_fs(len);

    let victim_ino;
    let victim_blocks;
    {
        let root = fs.root().unwrap();
        let victim = fs.create(&root, b"victim", S_IFREG | 0o644, 0).unwrap();
        for blk in 0..16u64 {
            write_block(&fs, &victim, blk, b'v');
        }
        victim_ino = victim.ino;
        victim_blocks = fs.inode_at(victim.pi_off).i_blocks;
        assert_eq!(victim_blocks, 16);

        // unlink while "open": no evict follows
        fs.unlink(&root, b"victim").unwrap();
        assert_eq!(fs.truncate_list_len(), 1);
        assert_eq!(fs.inode_at(victim.pi_off).i_links_count, 0);
    }

    // crash before evict
    let bytes = fs.into_arena().into_backing().unwrap();
    let arena = PmArena::from_backing(bytes);
    let allocator = Arc::new(RangeAllocator::empty());
    let journal = Arc::new(LiteJournal::new());
    let fs = PmfsState::mount(arena, allocator.clone(), journal, MountOpts::empty()).unwrap();

    // recovery freed the orphan: list drained, slot reusable, blocks and
    // log pages handed to the allocator
    assert_eq!(fs.truncate_list_len(), 0);
    assert!(fs.iget(victim_ino).is_err());
    assert!(allocator.count_free_blocks() >= victim_blocks + 1);

    let root = fs.root().unwrap();
    let reborn = fs.create(&root, b"reborn", S_IFREG | 0o644, 0).unwrap();
    assert_eq!(reborn.ino, victim_ino, "slot should be reused lowest-first");
}

#[test]
fn seek_data_and_hole() {
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"holes", S_IFREG | 0o644, 0).unwrap();

    // blocks 2 and 3 hold data; 0, 1 and 4.. are holes
    write_block(&fs, &file, 2, b'd');
    write_block(&fs, &file, 3, b'd');
    fs.setattr(&file, &SetattrFields::size(6 * 4096)).unwrap();

    // SEEK_DATA from a hole advances to the data
    let mut off = 0u64;
    fs.find_region(&file, &mut off, false).unwrap();
    assert_eq!(off, 2 * 4096);

    // SEEK_DATA inside data stays put
    let mut off = 2 * 4096 + 100;
    fs.find_region(&file, &mut off, false).unwrap();
    assert_eq!(off, 2 * 4096 + 100);

    // SEEK_HOLE inside a hole stays put
    let mut off = 4096u64;
    fs.find_region(&file, &mut off, true).unwrap();
    assert_eq!(off, 4096);

    // past EOF is ENXIO
    let mut off = 7 * 4096;
    assert!(fs.find_region(&file, &mut off, false).is_err());
}

#[test]
fn inode_table_grows_on_demand() {
    let (fs, _alloc) = fresh_fs(32 * MB);
    let root = fs.root().unwrap();

    let initial_slots = fs.inodes_count();
    assert_eq!(initial_slots, 32); // one 4K table block

    // exhaust the first table block and force growth
    let mut files = Vec::new();
    for i in 0..40 {
        let name = format!("f{}", i);
        files.push(fs.create(&root, name.as_bytes(), S_IFREG | 0o644, 0).unwrap());
    }
    assert!(fs.inodes_count() > initial_slots);

    // inode numbers are unique and ascending from the hint
    let mut inos: Vec<u64> = files.iter().map(|f| f.ino).collect();
    let deduped = {
        let mut v = inos.clone();
        v.dedup();
        v
    };
    inos.sort_unstable();
    assert_eq!(deduped.len(), files.len());
    assert_eq!(inos, deduped);
}

#[test]
fn file_tree_rebuild_survives_remount() {
    let len = 32 * MB;
    let (fs, _alloc) = fresh_fs(len);
    {
        let root = fs.root().unwrap();
        let file = fs.create(&root, b"data", S_IFREG | 0o644, 0).unwrap();
        for blk in 0..600u64 {
            write_block(&fs, &file, blk, (blk % 7) as u8 + b'0');
        }
        // rewrite a few so dead entries exist in the log
        for blk in 0..10u64 {
            write_block(&fs, &file, blk, b'R');
        }
    }

    let bytes = fs.into_arena().into_backing().unwrap();
    let arena = PmArena::from_backing(bytes);
    let allocator = Arc::new(RangeAllocator::empty());
    let journal = Arc::new(LiteJournal::new());
    let fs = PmfsState::mount(arena, allocator, journal, MountOpts::empty()).unwrap();

    let root = fs.root().unwrap();
    let inner = root.inner.lock();
    let node = fs.find_dir_node(&inner, b"data").unwrap();
    drop(inner);
    let file = fs.iget(node.ino).unwrap();

    let mut buf = vec![0u8; 4096];
    for blk in 0..10u64 {
        fs.read(&file, blk << 12, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == b'R'), "block {} lost its rewrite", blk);
    }
    for blk in 10..600u64 {
        fs.read(&file, blk << 12, &mut buf).unwrap();
        let expect = (blk % 7) as u8 + b'0';
        assert!(buf.iter().all(|&b| b == expect), "block {} corrupt", blk);
    }
}

#[test]
fn log_entries_survive_tail_protocol() {
    // an entry is only visible once the tail moves past it
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();
    let file = fs.create(&root, b"tail", S_IFREG | 0o644, 0).unwrap();

    write_block(&fs, &file, 0, b'1');
    let pi = fs.inode_at(file.pi_off);
    assert_ne!(pi.log_head, 0);
    assert_eq!(pi.log_tail, pi.log_head + LOG_ENTRY_SIZE as u64);

    write_block(&fs, &file, 1, b'2');
    let pi = fs.inode_at(file.pi_off);
    assert_eq!(pi.log_tail, pi.log_head + 2 * LOG_ENTRY_SIZE as u64);
}

#[test]
fn blocksize_hint_prefers_large_blocks() {
    let (fs, _alloc) = fresh_fs(16 * MB);
    let root = fs.root().unwrap();

    // a fresh, empty file truncated up to 2M gets the large block hint
    let file = fs.create(&root, b"huge", S_IFREG | 0o644, 0).unwrap();
    fs.setattr(&file, &SetattrFields::size(2 * MB as u64)).unwrap();
    let pi = fs.inode_at(file.pi_off);
    assert_eq!(pi.i_blk_type, BlockType::Block2M as u8);
}

#[test]
fn mount_falls_back_to_redundant_super_block() {
    let len = 16 * MB;
    let (fs, _alloc) = fresh_fs(len);
    {
        let root = fs.root().unwrap();
        fs.create(&root, b"kept", S_IFREG | 0o644, 0).unwrap();
    }

    let mut bytes = fs.into_arena().into_backing().unwrap();
    // tear the primary super block
    bytes[0] ^= 0xFF;
    bytes[8] ^= 0xFF;

    let arena = PmArena::from_backing(bytes);
    let fs = PmfsState::mount(
        arena,
        Arc::new(RangeAllocator::empty()),
        Arc::new(LiteJournal::new()),
        MountOpts::empty(),
    )
    .unwrap();

    // the primary was restored from the redundant copy
    assert!(fs.get_super().is_valid());
    let root = fs.root().unwrap();
    assert!(fs.list_dir(&root).contains(&b"kept".to_vec()));

    // with both copies torn the mount refuses
    let mut bytes = fs.into_arena().into_backing().unwrap();
    bytes[0] ^= 0xFF;
    bytes[512] ^= 0xFF;
    let arena = PmArena::from_backing(bytes);
    assert!(PmfsState::mount(
        arena,
        Arc::new(RangeAllocator::empty()),
        Arc::new(LiteJournal::new()),
        MountOpts::empty(),
    )
    .is_err());
}

#[test]
fn inlined_inode_slots_are_skipped_on_rebuild() {
    let len = 16 * MB;
    let (fs, _alloc) = fresh_fs(len);
    {
        let root = fs.root().unwrap();
        let d = fs.create(&root, b"d", S_IFDIR | 0o755, 0).unwrap();

        // append a record carrying an inlined inode slot, as the
        // mkfs/recovery format allows
        let pidir = fs.arena().at_mut::<pmfs_common::PmfsInode>(d.pi_off);
        let (entry, new_tail, pi_addr) = fs
            .append_dir_entry(pidir, pidir.log_tail, 9, b"legacy", 0, true)
            .unwrap();
        let slot = pi_addr.unwrap();
        assert_eq!(slot % 64, 0, "inlined slot must be cacheline aligned");
        assert_eq!(new_tail, slot + 128);
        fs.update_tail(pidir, new_tail);

        let mut inner = d.inner.lock();
        inner.dir.insert(b"legacy", 9, entry).unwrap();
    }

    let bytes = fs.into_arena().into_backing().unwrap();
    let arena = PmArena::from_backing(bytes);
    let fs = PmfsState::mount(
        arena,
        Arc::new(RangeAllocator::empty()),
        Arc::new(LiteJournal::new()),
        MountOpts::empty(),
    )
    .unwrap();

    let root = fs.root().unwrap();
    let inner = root.inner.lock();
    let node = fs.find_dir_node(&inner, b"d").unwrap();
    drop(inner);
    let d = fs.iget(node.ino).unwrap();

    // the rebuild walked over the inlined slot without tripping on it
    let names = fs.list_dir(&d);
    assert!(names.contains(&b"legacy".to_vec()));
}
