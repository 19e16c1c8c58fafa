#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use mirrorline_core::{ConnectionId, InstanceId, SessionId};
use mirrorline_page::{ConnectionConfig, LossAction, PageConnection, Session, SessionDispatcher};
use mirrorline_transport::memory::RecordingSink;

fuzz_target!(|data: &[u8]| {
    let config = ConnectionConfig {
        loss_action: Some(LossAction::with_recovery_task(b"reload".to_vec())),
        ..ConnectionConfig::default()
    };
    let Ok(connection) = PageConnection::open(ConnectionId(1), InstanceId::from("fuzz"), config)
    else {
        return;
    };
    let connection = Arc::new(connection);
    let session = Arc::new(Session::new(SessionId::from("fuzz")));
    session.add_page(connection.clone());
    connection.set_dispatcher(Arc::new(SessionDispatcher::new(
        Arc::clone(&session),
        InstanceId::from("fuzz"),
    )));
    connection.attach_sink(Arc::new(RecordingSink::new()));

    // First byte picks the split points of the remaining input.
    let Some((&stride, rest)) = data.split_first() else {
        return;
    };
    let stride = usize::from(stride).max(1);
    for frame in rest.chunks(stride) {
        connection.on_frame_received(frame.to_vec());
    }
    connection.close();
});
