use std::fs;
use std::path::Path;

use mirrorline_page::{ConnectionConfig, EnqueueOutcome, LossAction, QueueBackend};
use mirrorline_sim::scenarios::{client_frame, tagged_task, SimPage};

fn batch_files(dir: &Path) -> usize {
    fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(Result::ok)
                .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "batch"))
                .count()
        })
        .unwrap_or(0)
}

#[test]
fn disk_backed_connection_delivers_in_order_and_cleans_up() {
    let base = tempfile::tempdir().expect("tempdir");
    let page = SimPage::open(
        41,
        ConnectionConfig {
            queue_backend: QueueBackend::Disk {
                base_dir: base.path().to_path_buf(),
            },
            loss_action: Some(LossAction::with_recovery_task(b"reload".to_vec())),
            ..ConnectionConfig::default()
        },
    )
    .expect("page should open");
    let conn_dir = base.path().join("conn-41");
    let out_dir = conn_dir.join("out");

    let tasks: Vec<_> = (0..9).map(|seq| tagged_task(1, seq, 40)).collect();
    for chunk in tasks.chunks(3) {
        assert_eq!(page.connection.enqueue(chunk.to_vec()), EnqueueOutcome::Queued);
    }
    assert_eq!(batch_files(&out_dir), 3);

    page.connection.hold();
    assert_eq!(
        page.connection.enqueue(vec![tagged_task(1, 9, 40)]),
        EnqueueOutcome::Held
    );
    assert_eq!(batch_files(&conn_dir.join("held")), 1);

    page.attach();
    page.connection.unhold();

    let mut expected = tasks;
    expected.push(tagged_task(1, 9, 40));
    assert_eq!(page.delivered(), expected);
    assert_eq!(page.delivered_ids(), (1..=10).collect::<Vec<u32>>());
    assert_eq!(batch_files(&out_dir), 0);

    page.connection.close();
    assert!(!conn_dir.exists());
}

#[test]
fn reopening_purges_stale_batches() {
    let base = tempfile::tempdir().expect("tempdir");
    let stale_dir = base.path().join("conn-42").join("out");
    fs::create_dir_all(&stale_dir).expect("stale dir");
    fs::write(stale_dir.join("1.batch"), b"left over").expect("stale file");

    let page = SimPage::open(
        42,
        ConnectionConfig {
            queue_backend: QueueBackend::Disk {
                base_dir: base.path().to_path_buf(),
            },
            ..ConnectionConfig::default()
        },
    )
    .expect("page should open");
    assert_eq!(batch_files(&stale_dir), 0);
    assert_eq!(page.connection.queue_depth(), 0);

    page.attach();
    assert_eq!(
        page.connection.enqueue_and_push(vec![b"fresh".to_vec()]),
        EnqueueOutcome::Queued
    );
    assert_eq!(page.delivered(), vec![b"fresh".to_vec()]);
}

fn lossless_disk_page(id: u64, base: &Path) -> SimPage {
    SimPage::open(
        id,
        ConnectionConfig {
            queue_backend: QueueBackend::Disk {
                base_dir: base.to_path_buf(),
            },
            output_buffer_limit: 256,
            loss_action: Some(LossAction::with_recovery_task(b"reload".to_vec())),
            ..ConnectionConfig::default()
        },
    )
    .expect("page should open")
}

#[test]
fn recovery_replaces_queue_even_past_an_unreadable_entry() {
    let base = tempfile::tempdir().expect("tempdir");
    let page = lossless_disk_page(43, base.path());
    for seq in 0..3 {
        assert_eq!(
            page.connection.enqueue(vec![tagged_task(1, seq, 8)]),
            EnqueueOutcome::Queued
        );
    }
    let out_dir = base.path().join("conn-43").join("out");
    fs::write(out_dir.join("1.batch"), [0xFF, 0xFF]).expect("corrupt entry");

    page.connection.on_frame_received(client_frame(2, b"late"));
    assert!(page.connection.is_loss_failed());
    assert_eq!(batch_files(&out_dir), 1);

    page.attach();
    assert_eq!(page.delivered(), vec![b"reload".to_vec()]);
    assert_eq!(page.delivered_ids(), vec![1]);
    assert_eq!(page.connection.output_stats().outstanding_bytes(), 0);
}

#[test]
fn drain_skips_an_unreadable_entry_and_returns_its_bytes() {
    let base = tempfile::tempdir().expect("tempdir");
    let page = lossless_disk_page(44, base.path());
    let tasks: Vec<_> = (0..3).map(|seq| tagged_task(1, seq, 8)).collect();
    for task in &tasks {
        page.connection.enqueue(vec![task.clone()]);
    }
    let out_dir = base.path().join("conn-44").join("out");
    fs::write(out_dir.join("2.batch"), [0xFF]).expect("corrupt entry");

    page.attach();
    assert_eq!(page.delivered(), vec![tasks[0].clone(), tasks[2].clone()]);
    assert_eq!(page.delivered_ids(), vec![1, 2]);
    assert_eq!(page.connection.queue_depth(), 0);
    assert_eq!(page.connection.output_stats().outstanding_bytes(), 0);
    assert!(!page.connection.is_loss_failed());
}
