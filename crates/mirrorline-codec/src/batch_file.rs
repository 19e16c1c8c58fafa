use bytes::{Buf, BufMut};
use mirrorline_core::TaskBatch;

use crate::error::CodecError;

/// Byte length of each count/length prefix in a batch file.
pub const BATCH_FILE_PREFIX_LEN: usize = 4;

/// Encodes the unsent blobs of `batch` as one batch file body.
///
/// Layout: `u32 BE count`, then per blob `u32 BE length` followed by the blob.
pub fn encode_batch_file(batch: &TaskBatch) -> Result<Vec<u8>, CodecError> {
    encode_task_blobs(batch.remaining())
}

/// Encodes blobs in order using the batch file layout.
pub fn encode_task_blobs<'a>(
    blobs: impl IntoIterator<Item = &'a [u8]>,
) -> Result<Vec<u8>, CodecError> {
    let blobs: Vec<&[u8]> = blobs.into_iter().collect();
    let count = u32::try_from(blobs.len())
        .map_err(|_| CodecError::InvalidBatchFile("too many blobs"))?;
    let body_len: usize = blobs
        .iter()
        .map(|blob| BATCH_FILE_PREFIX_LEN + blob.len())
        .sum();

    let mut out = Vec::with_capacity(BATCH_FILE_PREFIX_LEN + body_len);
    out.put_u32(count);
    for blob in blobs {
        let len =
            u32::try_from(blob.len()).map_err(|_| CodecError::InvalidBatchFile("blob too large"))?;
        out.put_u32(len);
        out.put_slice(blob);
    }
    Ok(out)
}

/// Decodes a batch file body into blobs in their original order.
pub fn decode_batch_file(mut bytes: &[u8]) -> Result<Vec<Vec<u8>>, CodecError> {
    if bytes.remaining() < BATCH_FILE_PREFIX_LEN {
        return Err(CodecError::InvalidBatchFile("missing blob count"));
    }
    let count = bytes.get_u32() as usize;

    // Every blob needs at least its length prefix.
    if count > bytes.remaining() / BATCH_FILE_PREFIX_LEN {
        return Err(CodecError::InvalidBatchFile("blob count exceeds body"));
    }

    let mut blobs = Vec::with_capacity(count);
    for _ in 0..count {
        if bytes.remaining() < BATCH_FILE_PREFIX_LEN {
            return Err(CodecError::InvalidBatchFile("truncated blob length"));
        }
        let len = bytes.get_u32() as usize;
        if bytes.remaining() < len {
            return Err(CodecError::InvalidBatchFile("truncated blob"));
        }
        blobs.push(bytes[..len].to_vec());
        bytes.advance(len);
    }

    if bytes.has_remaining() {
        return Err(CodecError::InvalidBatchFile("trailing bytes"));
    }
    Ok(blobs)
}
