use crate::error::CodecError;

/// Bytes reserved at the front of a lossless frame for its sequence id.
pub const FRAME_ID_LEN: usize = 4;
/// Smallest inbound frame that carries an id and at least one payload byte.
pub const MIN_ID_FRAME_LEN: usize = FRAME_ID_LEN + 1;

/// Copies `task` behind `FRAME_ID_LEN` zeroed bytes, to be stamped at send time.
pub fn reserve_frame_id(task: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_ID_LEN + task.len());
    frame.extend_from_slice(&[0_u8; FRAME_ID_LEN]);
    frame.extend_from_slice(task);
    frame
}

/// Writes `id` big-endian into the reserved prefix of `frame`.
pub fn stamp_frame_id(frame: &mut [u8], id: u32) -> Result<(), CodecError> {
    if frame.len() < FRAME_ID_LEN {
        return Err(CodecError::FrameTooShort { len: frame.len() });
    }
    frame[..FRAME_ID_LEN].copy_from_slice(&id.to_be_bytes());
    Ok(())
}

/// Splits an inbound lossless frame into `(id, payload)`.
///
/// Returns `None` for frames shorter than `MIN_ID_FRAME_LEN`.
pub fn split_frame_id(frame: &[u8]) -> Option<(u32, &[u8])> {
    if frame.len() < MIN_ID_FRAME_LEN {
        return None;
    }
    let (id_bytes, payload) = frame.split_at(FRAME_ID_LEN);
    let mut id = [0_u8; FRAME_ID_LEN];
    id.copy_from_slice(id_bytes);
    Some((u32::from_be_bytes(id), payload))
}
