use std::sync::Arc;
use std::thread;

use mirrorline_codec::message::{
    decode_storage_op, encode_client_message, ClientMessage, StorageOp, TokenWrite,
};
use mirrorline_core::{InstanceId, SessionId};
use mirrorline_page::storage::{TokenStore, TokenValue};
use mirrorline_page::{ConnectionConfig, Session, SessionDispatcher};
use mirrorline_sim::scenarios::{random_token_writes, SimPage};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

fn snapshot(store: &TokenStore) -> Vec<(String, TokenValue)> {
    let mut keys = store.keys();
    keys.sort();
    keys.into_iter()
        .filter_map(|key| store.get(&key).map(|value| (key, value)))
        .collect()
}

#[test]
fn stores_converge_regardless_of_write_order() {
    let writes = random_token_writes(0x70_4E, 4, 400);
    let mut rng = StdRng::seed_from_u64(0xC0FFEE);

    let reference = TokenStore::new();
    for (key, value, time, id) in &writes {
        reference.write(key, Some(value.clone()), *time, *id);
    }

    for _ in 0..8 {
        let mut shuffled = writes.clone();
        shuffled.shuffle(&mut rng);
        let store = TokenStore::new();
        for (key, value, time, id) in shuffled {
            store.write(&key, Some(value), time, id);
        }
        assert_eq!(snapshot(&store), snapshot(&reference));
    }
}

#[test]
fn concurrent_writers_converge() {
    let writes = random_token_writes(0xBEEF, 3, 600);
    let reference = TokenStore::new();
    for (key, value, time, id) in &writes {
        reference.write(key, Some(value.clone()), *time, *id);
    }

    let store = Arc::new(TokenStore::new());
    let handles: Vec<_> = writes
        .chunks(75)
        .map(|chunk| {
            let store = Arc::clone(&store);
            let mut chunk = chunk.to_vec();
            chunk.reverse();
            thread::spawn(move || {
                for (key, value, time, id) in chunk {
                    store.write(&key, Some(value), time, id);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().expect("writer thread");
    }

    assert_eq!(snapshot(&store), snapshot(&reference));
}

#[test]
fn page_token_write_reaches_the_other_page() {
    let session = Arc::new(Session::new(SessionId::from("s-conv")));
    let a = SimPage::open(31, ConnectionConfig::default()).expect("page a");
    let b = SimPage::open(32, ConnectionConfig::default()).expect("page b");
    for page in [&a, &b] {
        session.add_page(page.connection.clone());
        page.connection.set_dispatcher(Arc::new(SessionDispatcher::new(
            Arc::clone(&session),
            page.connection.instance_id().clone(),
        )));
        page.attach();
    }

    let write = |value: &str, time: i64| {
        encode_client_message(&ClientMessage::TokenWrite(TokenWrite {
            key: "csrf".to_string(),
            value: Some(value.to_string()),
            time,
            id: 1,
        }))
        .expect("encode token write")
    };
    a.connection.on_frame_received(write("new", 200));
    b.connection.on_frame_received(write("old", 100));

    assert_eq!(session.get_token("csrf").map(|token| token.value), Some("new".to_string()));
    assert!(a.sink.frames().is_empty());
    let relayed: Vec<StorageOp> = b
        .sink
        .frames()
        .iter()
        .map(|frame| decode_storage_op(frame).expect("storage op"))
        .collect();
    assert_eq!(relayed.len(), 1);
    assert!(matches!(
        &relayed[0],
        StorageOp::SetToken { value: Some(value), time: 200, .. } if value == "new"
    ));
    assert!(session.page(&InstanceId::from("page-31")).is_some());
}
