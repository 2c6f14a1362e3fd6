//! Splitting messages into fixed-size frames and reassembling them
//!
//! The sending side is stateless apart from a message counter. The receiving
//! side keeps one partial message per `(sender, message id)` and accepts
//! frames only in offset order.

use crate::domain::{MessageId, Pid, ProtocolError};
use apm_agent_common::{FrameHeader, FRAME_HEADER_SIZE, FRAME_PAYLOAD_CAPACITY, FRAME_SIZE};
use log::{debug, trace, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

type SendFrame = Box<dyn Fn(&[u8]) -> bool + Send + Sync>;
type ProcessMessage = Box<dyn Fn(Vec<u8>) + Send + Sync>;

struct PartialMessage {
    total_size: u64,
    data: Vec<u8>,
    last_updated: Instant,
}

impl PartialMessage {
    fn new(total_size: u64) -> Self {
        Self { total_size, data: Vec::new(), last_updated: Instant::now() }
    }

    fn append(&mut self, header: &FrameHeader, chunk: &[u8]) -> Result<(), ProtocolError> {
        let sender = Pid(header.sender_pid);
        let message = MessageId(header.message_id);
        let received = self.data.len() as u64;

        if header.total_size != self.total_size {
            return Err(ProtocolError::TotalSizeChanged {
                sender,
                message,
                previous: self.total_size,
                total: header.total_size,
            });
        }
        if header.offset != received {
            return Err(ProtocolError::OffsetMismatch { sender, message, expected: received, offset: header.offset });
        }
        let end = header.offset + chunk.len() as u64;
        if end > self.total_size {
            return Err(ProtocolError::SizeExceeded { sender, message, end, total: self.total_size });
        }

        self.data.extend_from_slice(chunk);
        self.last_updated = Instant::now();
        Ok(())
    }

    fn is_complete(&self) -> bool {
        self.data.len() as u64 == self.total_size
    }
}

type PendingMessages = HashMap<Pid, HashMap<MessageId, PartialMessage>>;

pub struct ChunkedMessageProcessor {
    next_message_id: AtomicU64,
    send_frame: SendFrame,
    process_message: ProcessMessage,
    pending: Mutex<PendingMessages>,
}

impl ChunkedMessageProcessor {
    /// `send_frame` delivers one encoded frame and reports whether it was
    /// accepted; `process_message` receives every reassembled message.
    pub fn new<S, P>(send_frame: S, process_message: P) -> Self
    where
        S: Fn(&[u8]) -> bool + Send + Sync + 'static,
        P: Fn(Vec<u8>) + Send + Sync + 'static,
    {
        Self {
            next_message_id: AtomicU64::new(0),
            send_frame: Box::new(send_frame),
            process_message: Box::new(process_message),
            pending: Mutex::new(HashMap::new()),
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingMessages> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send `payload` as a new message, one frame per
    /// [`FRAME_PAYLOAD_CAPACITY`] bytes
    ///
    /// An empty payload is sent as a single header-only frame. Stops at the
    /// first frame the channel refuses and returns `false`.
    pub fn send_payload(&self, payload: &[u8]) -> bool {
        let message = MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed) + 1);
        let sender = Pid::current();
        let total_size = payload.len() as u64;

        let mut frame = [0u8; FRAME_SIZE];
        let mut offset = 0;
        loop {
            let len = (payload.len() - offset).min(FRAME_PAYLOAD_CAPACITY);
            let header = FrameHeader::new(sender.0, message.0, total_size, offset as u64);
            frame[..FRAME_HEADER_SIZE].copy_from_slice(&header.to_bytes());
            frame[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len].copy_from_slice(&payload[offset..offset + len]);

            trace!("[coordinator] Sending {message} offset {offset} chunk {len} of {total_size} bytes");
            if !(self.send_frame)(&frame[..FRAME_HEADER_SIZE + len]) {
                warn!("[coordinator] Failed to send {message} at offset {offset}");
                return false;
            }

            offset += len;
            if offset >= payload.len() {
                return true;
            }
        }
    }

    /// Feed one received frame
    ///
    /// When the frame completes its message, the message is removed from the
    /// pending table and handed to the message callback after the table lock
    /// is released.
    ///
    /// # Errors
    ///
    /// Returns a `ProtocolError` when the frame is too short or too long, does
    /// not continue its message contiguously, overflows the declared message
    /// size or declares a different size than earlier frames. The offending
    /// message is discarded; other pending messages are untouched.
    pub fn process_received_chunk(&self, frame: &[u8]) -> Result<(), ProtocolError> {
        if frame.len() > FRAME_SIZE {
            return Err(ProtocolError::TruncatedFrame(frame.len()));
        }
        let header = FrameHeader::from_bytes(frame).ok_or(ProtocolError::TruncatedFrame(frame.len()))?;
        let chunk = &frame[FRAME_HEADER_SIZE..];
        let sender = Pid(header.sender_pid);
        let message = MessageId(header.message_id);

        trace!(
            "[coordinator] Received {sender} {message} offset {} chunk {} of {} bytes",
            header.offset,
            chunk.len(),
            header.total_size
        );

        let completed = {
            let mut pending = self.pending();
            let messages = pending.entry(sender).or_default();
            let partial = messages.entry(message).or_insert_with(|| PartialMessage::new(header.total_size));

            if let Err(err) = partial.append(&header, chunk) {
                messages.remove(&message);
                if messages.is_empty() {
                    pending.remove(&sender);
                }
                return Err(err);
            }

            if partial.is_complete() {
                let data = messages.remove(&message).map(|partial| partial.data);
                if messages.is_empty() {
                    pending.remove(&sender);
                }
                data
            } else {
                None
            }
        };

        if let Some(data) = completed {
            trace!("[coordinator] {sender} {message} complete, {} bytes", data.len());
            (self.process_message)(data);
        }
        Ok(())
    }

    /// Drop partial messages not updated for longer than `max_age`
    ///
    /// Returns how many messages were dropped.
    pub fn cleanup_abandoned_messages(&self, now: Instant, max_age: Duration) -> usize {
        let mut removed = 0;
        let mut pending = self.pending();
        pending.retain(|sender, messages| {
            messages.retain(|message, partial| {
                let stale = now.saturating_duration_since(partial.last_updated) > max_age;
                if stale {
                    debug!(
                        "[coordinator] Dropping abandoned {sender} {message} after {} of {} bytes",
                        partial.data.len(),
                        partial.total_size
                    );
                    removed += 1;
                }
                !stale
            });
            !messages.is_empty()
        });
        removed
    }

    /// Number of partially received messages
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.pending().values().map(HashMap::len).sum()
    }
}
