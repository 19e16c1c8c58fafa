use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mirrorline_core::{ConnectionId, InstanceId, SessionId};
use mirrorline_page::{
    ConnectionConfig, InboundOutcome, LossAction, PageConnection, Session, SessionDispatcher,
};
use mirrorline_transport::memory::RecordingSink;

fn xorshift64(state: &mut u64) -> u64 {
    *state ^= *state << 13;
    *state ^= *state >> 7;
    *state ^= *state << 17;
    *state
}

fn random_bytes(seed: u64, len: usize) -> Vec<u8> {
    let mut s = seed.max(1);
    let mut out = vec![0_u8; len];
    for b in &mut out {
        *b = (xorshift64(&mut s) & 0xFF) as u8;
    }
    out
}

fn connection(config: ConnectionConfig) -> Arc<PageConnection> {
    let conn = PageConnection::open(ConnectionId(1), InstanceId::from("tab"), config)
        .expect("connection should open");
    let conn = Arc::new(conn);
    let session = Arc::new(Session::new(SessionId::from("s")));
    session.add_page(conn.clone());
    conn.set_dispatcher(Arc::new(SessionDispatcher::new(
        session,
        InstanceId::from("tab"),
    )));
    conn
}

#[test]
fn arbitrary_inbound_frames_do_not_panic() {
    let conn = connection(ConnectionConfig::default());
    conn.attach_sink(Arc::new(RecordingSink::new()));

    for i in 0..1500_u64 {
        let len = ((i as usize) * 37) % 2048;
        let outcome = conn.on_frame_received(random_bytes(0xC0DEC0DE ^ i, len));
        assert_eq!(outcome, InboundOutcome::Accepted);
    }
    assert_eq!(conn.input_stats().outstanding_bytes(), 0);
}

#[test]
fn arbitrary_lossless_frames_fail_at_most_once() {
    let losses = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&losses);
    let conn = connection(ConnectionConfig {
        loss_action: Some(LossAction::with_recovery_task(b"reload".to_vec()).on_loss(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )),
        ..ConnectionConfig::default()
    });
    let sink = Arc::new(RecordingSink::new());
    conn.attach_sink(sink.clone());

    for i in 0..500_u64 {
        let len = ((i as usize) * 13) % 64;
        let _ = conn.on_frame_received(random_bytes(0xBADC0FFE ^ i, len));
    }
    assert!(losses.load(Ordering::SeqCst) <= 1);
    assert_eq!(conn.is_loss_failed(), losses.load(Ordering::SeqCst) == 1);
    assert!(sink.sent_count() <= 1);
}
