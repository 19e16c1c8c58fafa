use mirrorline_codec::batch_file::{decode_batch_file, encode_batch_file};
use mirrorline_codec::frame::{reserve_frame_id, split_frame_id, stamp_frame_id};
use mirrorline_codec::message::{decode_storage_op, encode_storage_op, StorageOp};
use mirrorline_core::TaskBatch;

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[test]
fn batch_file_golden_bytes() {
    let batch = TaskBatch::new(vec![b"b0".to_vec(), b"b1x".to_vec()]);
    let encoded = encode_batch_file(&batch).expect("batch should encode");
    assert_eq!(to_hex(&encoded), "0000000200000002623000000003623178");

    let decoded = decode_batch_file(&encoded).expect("batch should decode");
    assert_eq!(decoded, vec![b"b0".to_vec(), b"b1x".to_vec()]);
}

#[test]
fn empty_batch_file_is_just_a_zero_count() {
    let encoded = encode_batch_file(&TaskBatch::new(Vec::new())).expect("batch should encode");
    assert_eq!(to_hex(&encoded), "00000000");
    assert!(decode_batch_file(&encoded)
        .expect("batch should decode")
        .is_empty());
}

#[test]
fn stamped_frame_golden_bytes() {
    let mut frame = reserve_frame_id(&[0xAA, 0xBB]);
    stamp_frame_id(&mut frame, 258).expect("frame should stamp");
    assert_eq!(to_hex(&frame), "00000102aabb");

    let (id, payload) = split_frame_id(&frame).expect("frame should split");
    assert_eq!(id, 258);
    assert_eq!(payload, &[0xAA, 0xBB]);
}

#[test]
fn storage_op_is_stable_across_encodes() {
    let op = StorageOp::ClearItems {
        request_id: None,
        time: 1_234,
    };
    let first = encode_storage_op(&op).expect("op should encode");
    let second = encode_storage_op(&op).expect("op should encode");
    assert_eq!(first, second);
    assert_eq!(decode_storage_op(&first).expect("op should decode"), op);
}
