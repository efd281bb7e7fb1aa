//! Storage engine scenarios across simulated restarts.

use std::sync::Arc;

use ferrocan_linux::stack::NodePersist;
use ferrocan_linux::storage::{new_region, Storage, StorageAttrs, StorageEntryConfig};
use tempfile::TempDir;

fn prefix(dir: &TempDir) -> String {
    format!("{}/node1_", dir.path().display())
}

fn entries(
    od_comm: &ferrocan_linux::storage::SharedRegion,
    persist: &ferrocan_linux::storage::SharedRegion,
) -> Vec<StorageEntryConfig> {
    vec![
        StorageEntryConfig {
            region: Arc::clone(od_comm),
            sub_index: 2,
            attrs: StorageAttrs::CMD_SAVE | StorageAttrs::RESTORE,
            filename: "od_comm.persist".into(),
        },
        StorageEntryConfig {
            region: Arc::clone(persist),
            sub_index: 4,
            attrs: StorageAttrs::CMD_SAVE | StorageAttrs::AUTO_SAVE | StorageAttrs::RESTORE,
            filename: "mainline.persist".into(),
        },
    ]
}

#[test]
fn save_then_restart_restores_both_entries() {
    let dir = TempDir::new().unwrap();

    let od_comm = new_region(32);
    let persist = new_region(NodePersist::LEN);
    let (mut storage, err) = Storage::init(entries(&od_comm, &persist), &prefix(&dir)).unwrap();
    // first boot: no files yet, both entries flagged
    assert_eq!(err, (1 << 2) | (1 << 4));

    od_comm.lock().unwrap()[..4].copy_from_slice(&[0xCA, 0xFE, 0xBA, 0xBE]);
    NodePersist {
        pending_bitrate: 250,
        pending_node_id: 42,
    }
    .store(&persist);

    storage.store(0).unwrap();
    storage.store(1).unwrap();
    drop(storage);

    // "restart": fresh regions, fresh engine, same files
    let od_comm2 = new_region(32);
    let persist2 = new_region(NodePersist::LEN);
    let (_s, err) = Storage::init(entries(&od_comm2, &persist2), &prefix(&dir)).unwrap();
    assert_eq!(err, 0);
    assert_eq!(&od_comm2.lock().unwrap()[..4], &[0xCA, 0xFE, 0xBA, 0xBE]);
    let restored = NodePersist::load(&persist2);
    assert_eq!(restored.pending_node_id, 42);
    assert_eq!(restored.pending_bitrate, 250);
}

#[test]
fn unsaved_mutation_is_lost_on_restart() {
    let dir = TempDir::new().unwrap();

    let od_comm = new_region(32);
    let persist = new_region(NodePersist::LEN);
    let (mut storage, _) = Storage::init(entries(&od_comm, &persist), &prefix(&dir)).unwrap();

    od_comm.lock().unwrap()[0] = 1;
    storage.store(0).unwrap();

    // mutate after the save, then "crash" without saving
    od_comm.lock().unwrap()[0] = 99;
    drop(storage);

    let od_comm2 = new_region(32);
    let persist2 = new_region(NodePersist::LEN);
    let (_s, _) = Storage::init(entries(&od_comm2, &persist2), &prefix(&dir)).unwrap();
    assert_eq!(od_comm2.lock().unwrap()[0], 1);
}

#[test]
fn shutdown_pass_flushes_auto_save_entries() {
    let dir = TempDir::new().unwrap();

    let od_comm = new_region(32);
    let persist = new_region(NodePersist::LEN);
    let (mut storage, _) = Storage::init(entries(&od_comm, &persist), &prefix(&dir)).unwrap();

    NodePersist {
        pending_bitrate: 0,
        pending_node_id: 17,
    }
    .store(&persist);

    // the forced shutdown pass persists the changed auto-save entry and
    // closes the handles
    assert_eq!(storage.auto_process(true), 0);
    drop(storage);

    let persist2 = new_region(NodePersist::LEN);
    let od_comm2 = new_region(32);
    let (_s, _) = Storage::init(entries(&od_comm2, &persist2), &prefix(&dir)).unwrap();
    assert_eq!(NodePersist::load(&persist2).pending_node_id, 17);
}

#[test]
fn restore_defaults_takes_effect_on_next_boot() {
    let dir = TempDir::new().unwrap();

    let od_comm = new_region(32);
    let persist = new_region(NodePersist::LEN);
    let (mut storage, _) = Storage::init(entries(&od_comm, &persist), &prefix(&dir)).unwrap();

    od_comm.lock().unwrap()[0] = 7;
    storage.store(0).unwrap();
    storage.restore_defaults(0).unwrap();
    drop(storage);

    // next boot: the marker file means "defaults, no restore, no error"
    let od_comm2 = new_region(32);
    let persist2 = new_region(NodePersist::LEN);
    let (_s, err) = Storage::init(entries(&od_comm2, &persist2), &prefix(&dir)).unwrap();
    assert_eq!(err & (1 << 2), 0);
    assert_eq!(od_comm2.lock().unwrap()[0], 0);
}
