use parking_lot::Mutex;

/// Receives inbound client payloads, in receipt order, one at a time per connection.
pub trait FrameDispatcher: Send + Sync {
    fn dispatch(&self, payload: &[u8]);
}

impl<F> FrameDispatcher for F
where
    F: Fn(&[u8]) + Send + Sync,
{
    fn dispatch(&self, payload: &[u8]) {
        self(payload)
    }
}

#[derive(Debug, Default)]
struct Parts {
    chunks: Vec<Vec<u8>>,
    len: usize,
}

/// Reassembles a frame delivered as several transport parts.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    parts: Mutex<Parts>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers `part`; returns the whole frame once `last` is seen.
    pub fn on_part(&self, part: Vec<u8>, last: bool) -> Option<Vec<u8>> {
        let mut parts = self.parts.lock();
        if !last {
            parts.len += part.len();
            parts.chunks.push(part);
            return None;
        }
        if parts.chunks.is_empty() {
            return Some(part);
        }
        let mut frame = Vec::with_capacity(parts.len + part.len());
        for chunk in parts.chunks.drain(..) {
            frame.extend_from_slice(&chunk);
        }
        frame.extend_from_slice(&part);
        parts.len = 0;
        Some(frame)
    }

    /// Bytes buffered for the frame currently being assembled.
    pub fn buffered_len(&self) -> usize {
        self.parts.lock().len
    }
}
