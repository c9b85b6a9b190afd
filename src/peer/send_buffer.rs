//! The peer session's outgoing byte queue.

use std::{collections::VecDeque, io::IoSlice};

use crate::CachedBlock;

/// A single backing buffer queued for sending. Control messages are owned
/// byte vectors; block payloads are shared views of cached block data, so
/// that serving a block to many peers does not copy it per peer.
enum Provider {
    Owned(Vec<u8>),
    Shared(CachedBlock),
}

impl Provider {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(bytes) => bytes,
            Self::Shared(block) => block,
        }
    }
}

/// Accrues outgoing messages until they are drained into the socket.
///
/// [`SendBuffer::get_send_buffers`] produces a scatter-gather list of at
/// most the requested number of bytes, suitable for a vectored write, and
/// [`SendBuffer::consume`] advances past however many bytes the write
/// managed to transfer, releasing fully sent providers. The consume cursor
/// may point into the middle of the first provider, which is then kept
/// alive until the rest of it is sent.
pub(super) struct SendBuffer {
    providers: VecDeque<Provider>,
    /// The offset into the first provider that marks the beginning of the
    /// unsent bytes.
    first_unsent_byte: usize,
    /// The total number of unsent bytes.
    size: usize,
}

impl SendBuffer {
    pub fn new() -> Self {
        Self {
            providers: VecDeque::new(),
            first_unsent_byte: 0,
            size: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// The number of unsent bytes in the buffer.
    pub fn len(&self) -> usize {
        self.size
    }

    /// Queues an owned message for sending.
    pub fn append_bytes(&mut self, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        self.size += bytes.len();
        self.providers.push_back(Provider::Owned(bytes));
    }

    /// Queues a shared view of a cached block for sending without copying.
    pub fn append_block(&mut self, block: CachedBlock) {
        if block.is_empty() {
            return;
        }
        self.size += block.len();
        self.providers.push_back(Provider::Shared(block));
    }

    /// Returns a scatter-gather list over the unsent bytes, totalling at
    /// most `max_len` bytes (less if not that many are queued). The last
    /// slice may be a partial view of its provider.
    pub fn get_send_buffers(&self, max_len: usize) -> Vec<IoSlice<'_>> {
        let mut bufs = Vec::new();
        let mut remaining = max_len.min(self.size);
        let mut first_unsent_byte = self.first_unsent_byte;
        for provider in self.providers.iter() {
            if remaining == 0 {
                break;
            }
            let bytes = &provider.as_slice()[first_unsent_byte..];
            // only the first provider can be partially sent
            first_unsent_byte = 0;
            let take = bytes.len().min(remaining);
            bufs.push(IoSlice::new(&bytes[..take]));
            remaining -= take;
        }
        bufs
    }

    /// Must be called after the buffer has been (partially) drained into
    /// the socket, so that fully sent providers may be released and the
    /// unsent cursor adjusted.
    pub fn consume(&mut self, mut num_sent_bytes: usize) {
        debug_assert!(num_sent_bytes <= self.size);
        self.size -= num_sent_bytes;
        while num_sent_bytes > 0 {
            let provider_len = self.providers[0].as_slice().len();
            let unsent = provider_len - self.first_unsent_byte;
            if num_sent_bytes >= unsent {
                // the first provider is fully sent and can be released
                self.providers.pop_front();
                self.first_unsent_byte = 0;
                num_sent_bytes -= unsent;
            } else {
                self.first_unsent_byte += num_sent_bytes;
                num_sent_bytes = 0;
            }
        }
    }
}
