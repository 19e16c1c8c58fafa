#![no_main]

use libfuzzer_sys::fuzz_target;
use mirrorline_codec::batch_file::decode_batch_file;
use mirrorline_codec::frame::split_frame_id;
use mirrorline_codec::message::{decode_client_message, decode_storage_op};

fuzz_target!(|data: &[u8]| {
    let _ = decode_batch_file(data);
    let _ = decode_storage_op(data);
    let _ = decode_client_message(data);
    let _ = split_frame_id(data);
});
