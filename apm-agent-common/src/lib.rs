//! # Shared Wire Layouts (worker ↔ coordinator)
//!
//! Defines the fixed-size frame layout and constants shared between worker
//! processes and the coordinator process. Frames cross a process boundary
//! through a fixed-capacity message channel, so the header is described by a
//! `#[repr(C)]` struct with explicit padding and is always encoded field by
//! field in little-endian order. Nothing here depends on native struct padding.
//!
//! ## Frame Layout
//!
//! ```text
//! offset  size  field
//! ──────  ────  ──────────────────────────────
//!      0     4  sender_pid      (i32)
//!      4     4  padding         (zero)
//!      8     8  message_id      (u64)
//!     16     8  total_size      (u64)
//!     24     8  offset          (u64)
//!     32  4064  payload bytes   (last frame: only the remainder)
//! ```
//!
//! ## Key Types
//!
//! - [`FrameHeader`] - Header preceding every chunk of a message
//! - [`FRAME_SIZE`] / [`FRAME_PAYLOAD_CAPACITY`] - Channel-bound sizes

#![no_std]

// ============================================================================
// Frame Size Constants
// ============================================================================

/// Size of one frame as accepted by the coordinator message channel
///
/// Every datagram on the channel is at most this many bytes. The coordinator
/// receive buffer is exactly this large.
pub const FRAME_SIZE: usize = 4096;

/// Encoded size of [`FrameHeader`]
pub const FRAME_HEADER_SIZE: usize = 32;

/// Payload bytes carried by a full frame
///
/// The last frame of a message carries `total_size - offset` bytes and is
/// therefore `FRAME_HEADER_SIZE + remaining` long.
pub const FRAME_PAYLOAD_CAPACITY: usize = FRAME_SIZE - FRAME_HEADER_SIZE;

/// Number of frames the coordinator channel buffers before `try_send` fails
pub const COORDINATOR_QUEUE_CAPACITY: usize = 100;

// ============================================================================
// Command Tags
// ============================================================================

/// **Envelope tag**: register or update an endpoint in the coordinator transport
pub const COMMAND_ESTABLISH_CONNECTION: u32 = 1;

/// **Envelope tag**: enqueue a payload for an already established endpoint
pub const COMMAND_SEND_ENDPOINT_PAYLOAD: u32 = 2;

// ============================================================================
// Shared Data Structures
// ============================================================================

/// Header written at the start of every frame
///
/// A message of `total_size` bytes is split into frames with contiguous
/// `offset` values `0, 4064, 8128, ...`. The receiver keys partial messages by
/// `(sender_pid, message_id)`.
///
/// **Memory Layout**: `#[repr(C)]` with the 4 padding bytes spelled out, so
/// `size_of::<FrameHeader>() == FRAME_HEADER_SIZE` on every target. Sizes are
/// carried as `u64` rather than `usize` to keep the layout width-independent.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct FrameHeader {
    /// Process ID of the sending worker
    pub sender_pid: i32,

    /// Always zero on the wire
    #[allow(clippy::pub_underscore_fields)]
    pub _padding: u32,

    /// Per-sender message counter, starts at 1
    pub message_id: u64,

    /// Size of the whole reassembled message in bytes
    pub total_size: u64,

    /// Position of this frame's payload inside the message
    pub offset: u64,
}

const _: () = assert!(core::mem::size_of::<FrameHeader>() == FRAME_HEADER_SIZE);

impl FrameHeader {
    #[must_use]
    pub const fn new(sender_pid: i32, message_id: u64, total_size: u64, offset: u64) -> Self {
        Self { sender_pid, _padding: 0, message_id, total_size, offset }
    }

    /// Encode into the little-endian wire representation
    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.sender_pid.to_le_bytes());
        // bytes 4..8 stay zero
        out[8..16].copy_from_slice(&self.message_id.to_le_bytes());
        out[16..24].copy_from_slice(&self.total_size.to_le_bytes());
        out[24..32].copy_from_slice(&self.offset.to_le_bytes());
        out
    }

    /// Decode a header from the start of `frame`
    ///
    /// Returns `None` when `frame` is shorter than [`FRAME_HEADER_SIZE`].
    #[must_use]
    pub fn from_bytes(frame: &[u8]) -> Option<Self> {
        let header = frame.get(..FRAME_HEADER_SIZE)?;
        Some(Self {
            sender_pid: i32::from_le_bytes(le_array(&header[0..4])),
            _padding: 0,
            message_id: u64::from_le_bytes(le_array(&header[8..16])),
            total_size: u64::from_le_bytes(le_array(&header[16..24])),
            offset: u64::from_le_bytes(le_array(&header[24..32])),
        })
    }
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}
