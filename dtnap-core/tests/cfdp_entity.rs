//! CFDP entity behaviour over the loopback engine: transfers, event handlers, transaction
//! control and shutdown of the event monitor.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dtnap_core::admin::AdminDatabase;
use dtnap_core::cfdp::{
    CfdpEvent, CfdpEventKind, CfdpProxy, Condition, Entity, EntityOptions, FilestoreAction,
    FilestoreStatus,
};
use dtnap_core::loopback::{Fault, LoopbackCfdp};
use dtnap_core::{Error, LoopbackNode};

const WAIT: Option<Duration> = Some(Duration::from_secs(5));

fn scratch(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("dtnap-cfdp-{}-{name}", std::process::id()));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn entity(node: &LoopbackNode) -> (CfdpProxy<LoopbackCfdp>, Arc<Entity<LoopbackCfdp>>) {
    let proxy = CfdpProxy::attach(node.cfdp()).unwrap();
    let entity = proxy.open(node.number(), EntityOptions::default()).unwrap();
    (proxy, entity)
}

fn record(entity: &Entity<LoopbackCfdp>) -> Arc<Mutex<Vec<CfdpEvent>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    entity.on_all(move |ev| sink.lock().unwrap().push(ev.clone()));
    seen
}

#[test]
fn file_copied_to_self_with_event_sequence() {
    let dir = scratch("copy");
    let src = dir.join("src.bin");
    let dst = dir.join("out/dst.bin");
    let data: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
    fs::write(&src, &data).unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    node.set_cfdp_segment_size(1000).unwrap();
    let (_proxy, entity) = entity(&node);
    let seen = record(&entity);

    let tx = entity.send(&src, Some(&dst)).unwrap();
    assert_eq!(tx.source_entity, 5);
    assert_eq!(entity.current_transaction(), Some(tx));
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(true));
    assert_eq!(fs::read(&dst).unwrap(), data);

    let kinds: Vec<CfdpEventKind> = seen.lock().unwrap().iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        [
            CfdpEventKind::Transaction,
            CfdpEventKind::MetadataReceived,
            CfdpEventKind::FileSegmentReceived,
            CfdpEventKind::FileSegmentReceived,
            CfdpEventKind::FileSegmentReceived,
            CfdpEventKind::EofSent,
            CfdpEventKind::EofReceived,
            CfdpEventKind::TransactionFinished,
        ]
    );
    let segments: Vec<(u64, u32)> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|e| e.kind == CfdpEventKind::FileSegmentReceived)
        .map(|e| (e.offset, e.length))
        .collect();
    assert_eq!(segments, [(0, 1000), (1000, 1000), (2000, 500)]);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn per_kind_handler_sees_user_messages() {
    let dir = scratch("messages");
    let src = dir.join("note.txt");
    fs::write(&src, b"hi").unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    let (_proxy, entity) = entity(&node);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    entity.on(CfdpEventKind::MetadataReceived, move |ev| {
        sink.lock().unwrap().extend(ev.messages_to_user.iter().cloned());
    });

    entity.add_user_message("first").unwrap();
    entity.add_user_message("second").unwrap();
    entity.send(&src, Some(&dir.join("copy.txt"))).unwrap();
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(true));
    assert_eq!(*messages.lock().unwrap(), ["first", "second"]);

    // Pending messages belong to one request only.
    entity.send(&src, Some(&dir.join("again.txt"))).unwrap();
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(true));
    assert_eq!(messages.lock().unwrap().len(), 2);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn filestore_requests_run_at_the_receiver() {
    let dir = scratch("filestore");
    let src = dir.join("data.txt");
    fs::write(&src, b"payload").unwrap();
    fs::write(dir.join("stale.txt"), b"old").unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    let (_proxy, entity) = entity(&node);
    let seen = record(&entity);

    entity
        .add_filestore_request(FilestoreAction::CreateDirectory, dir.join("made"), None)
        .unwrap();
    entity
        .add_filestore_request(FilestoreAction::DenyFile, dir.join("stale.txt"), None)
        .unwrap();
    entity
        .add_filestore_request(FilestoreAction::DenyDirectory, dir.join("absent"), None)
        .unwrap();
    entity
        .add_filestore_request(FilestoreAction::RenameFile, dir.join("missing"), None)
        .unwrap();
    entity.send(&src, Some(&dir.join("copy.txt"))).unwrap();
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(true));
    assert!(dir.join("made").is_dir());
    assert!(!dir.join("stale.txt").exists());

    let finished = seen
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.kind == CfdpEventKind::TransactionFinished)
        .cloned()
        .unwrap();
    let statuses: Vec<FilestoreStatus> = finished.filestore_responses.iter().map(|r| r.status).collect();
    assert_eq!(
        statuses,
        [
            FilestoreStatus::Successful,
            FilestoreStatus::Successful,
            FilestoreStatus::Successful,
            FilestoreStatus::NotPerformed
        ]
    );
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn cancelled_transfer_ends_unsuccessfully() {
    let dir = scratch("cancel");
    let src = dir.join("big.bin");
    fs::write(&src, vec![1u8; 4096]).unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    node.hold_transfers(true);
    let (_proxy, entity) = entity(&node);
    let seen = record(&entity);

    entity.send(&src, Some(&dir.join("never.bin"))).unwrap();
    entity.cancel().unwrap();
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(false));
    assert!(!dir.join("never.bin").exists());
    let finished = seen
        .lock()
        .unwrap()
        .iter()
        .find(|e| e.kind == CfdpEventKind::TransactionFinished)
        .cloned()
        .unwrap();
    assert_eq!(finished.condition, Condition::CancelRequested);
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn suspend_report_resume() {
    let dir = scratch("suspend");
    let src = dir.join("f.txt");
    fs::write(&src, b"resumable").unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    node.hold_transfers(true);
    let (_proxy, entity) = entity(&node);
    let reports = Arc::new(Mutex::new(Vec::new()));
    let sink = reports.clone();
    entity.on(CfdpEventKind::Report, move |ev| {
        sink.lock().unwrap().push(ev.status_report.clone().unwrap_or_default());
    });

    entity.send(&src, Some(&dir.join("out.txt"))).unwrap();
    entity.suspend().unwrap();
    entity.report().unwrap();
    entity.resume().unwrap();
    entity.report().unwrap();
    assert_eq!(entity.wait_for_transaction_end(Some(Duration::from_millis(100))).unwrap(), None);

    node.hold_transfers(false);
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(true));
    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports[0].ends_with("suspended"));
    assert!(reports[1].ends_with("active"));
    assert_eq!(fs::read(dir.join("out.txt")).unwrap(), b"resumable");
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn unreachable_peer_is_abandoned() {
    let dir = scratch("unreachable");
    let src = dir.join("f.txt");
    fs::write(&src, b"x").unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    let proxy = CfdpProxy::attach(node.cfdp()).unwrap();
    let entity = proxy.open(42, EntityOptions::default()).unwrap();
    let seen = record(&entity);
    entity.send(&src, None).unwrap();
    assert_eq!(entity.wait_for_transaction_end(WAIT).unwrap(), Some(false));
    assert!(seen.lock().unwrap().iter().any(|e| e.kind == CfdpEventKind::Fault));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn request_errors() {
    let node = LoopbackNode::new(5, 1 << 16);
    let (_proxy, entity) = entity(&node);

    assert!(matches!(
        entity.wait_for_transaction_end(WAIT),
        Err(Error::NoTransaction { entity: 5 })
    ));
    assert!(matches!(entity.cancel(), Err(Error::NoTransaction { .. })));
    let missing = std::env::temp_dir().join("dtnap-cfdp-does-not-exist");
    assert!(matches!(entity.send(&missing, None), Err(Error::FileNotFound(_))));

    let dir = scratch("put-fault");
    let src = dir.join("f.txt");
    fs::write(&src, b"x").unwrap();
    node.inject_fault(Fault::Put);
    assert!(matches!(entity.send(&src, None), Err(Error::Engine { .. })));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn close_stops_monitor_and_wakes_waiters() {
    let dir = scratch("close");
    let src = dir.join("f.txt");
    fs::write(&src, b"held").unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    node.hold_transfers(true);
    let (_proxy, entity) = entity(&node);
    entity.send(&src, Some(&dir.join("out.txt"))).unwrap();

    let waiter = {
        let entity = entity.clone();
        std::thread::spawn(move || entity.wait_for_transaction_end(None))
    };
    std::thread::sleep(Duration::from_millis(20));
    entity.close();
    entity.close();
    assert!(!entity.is_open());
    assert_eq!(waiter.join().unwrap().unwrap(), Some(false));
    assert!(matches!(entity.add_user_message("late"), Err(Error::Closed { .. })));
    assert!(matches!(entity.send(&src, None), Err(Error::Closed { .. })));
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn handler_may_close_its_own_entity() {
    let dir = scratch("self-close");
    let src = dir.join("f.txt");
    fs::write(&src, b"bye").unwrap();

    let node = LoopbackNode::new(5, 1 << 16);
    let (_proxy, entity) = entity(&node);
    let weak = Arc::downgrade(&entity);
    entity.on(CfdpEventKind::TransactionFinished, move |_| {
        if let Some(entity) = weak.upgrade() {
            entity.close();
        }
    });
    entity.send(&src, Some(&dir.join("out.txt"))).unwrap();
    assert!(entity.wait_for_transaction_end(WAIT).unwrap().is_some());
    assert!(!entity.is_open());
    fs::remove_dir_all(&dir).unwrap();
}

#[test]
fn proxy_reuses_and_closes_entities() {
    let node = LoopbackNode::new(5, 1 << 16);
    let proxy = CfdpProxy::attach(node.cfdp()).unwrap();
    let a = proxy.open(5, EntityOptions::default()).unwrap();
    let b = proxy.open(5, EntityOptions::default()).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    proxy.close(5).unwrap();
    assert!(!a.is_open());
    assert!(matches!(proxy.close(5), Err(Error::Closed { .. })));

    let c = proxy.open(5, EntityOptions::default()).unwrap();
    assert!(!Arc::ptr_eq(&a, &c));
    drop(proxy);
    assert!(!c.is_open());
    let counters = node.counters();
    assert_eq!((counters.attaches, counters.detaches), (1, 1));
}
