//! Fixed-capacity frame channels between workers and the coordinator

use apm_agent_common::FRAME_SIZE;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, trace};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixDatagram;
use std::time::Duration;

/// Carries whole frames, one per message, with a bounded backlog
pub trait MessageChannel: Send + Sync {
    /// Queue one frame without blocking; `false` when full or failed
    fn try_send(&self, frame: &[u8]) -> bool;

    /// Wait up to `timeout` for one frame and copy it into `buffer`
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; a timeout is `Ok(None)`.
    fn timed_receive(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;
}

/// Connected `AF_UNIX` datagram socket pair, created before the coordinator fork
///
/// Workers write to one end, the coordinator reads from the other. Each
/// datagram is exactly one frame.
pub struct DatagramChannel {
    sender: UnixDatagram,
    receiver: UnixDatagram,
}

impl DatagramChannel {
    /// # Errors
    ///
    /// Returns an error when the socket pair cannot be created or configured.
    pub fn new(capacity: usize) -> io::Result<Self> {
        let (sender, receiver) = UnixDatagram::pair()?;
        sender.set_nonblocking(true)?;
        set_send_buffer(&sender, capacity.saturating_mul(FRAME_SIZE))?;
        debug!("[coordinator] Datagram channel for {capacity} frames created");
        Ok(Self { sender, receiver })
    }
}

#[allow(unsafe_code)]
fn set_send_buffer(socket: &UnixDatagram, bytes: usize) -> io::Result<()> {
    let size = libc::c_int::try_from(bytes).unwrap_or(libc::c_int::MAX);
    // SAFETY: the fd is owned by `socket` for the duration of the call and
    // the option value points to a live c_int of the advertised length.
    let result = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            std::ptr::addr_of!(size).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if result == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

impl MessageChannel for DatagramChannel {
    fn try_send(&self, frame: &[u8]) -> bool {
        match self.sender.send(frame) {
            Ok(sent) => sent == frame.len(),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                trace!("[coordinator] Channel full, frame of {} bytes refused", frame.len());
                false
            }
            Err(err) => {
                debug!("[coordinator] Channel send failed: {err}");
                false
            }
        }
    }

    fn timed_receive(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        // a zero timeout would mean "block forever"
        self.receiver.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        match self.receiver.recv(buffer) {
            Ok(len) => Ok(Some(len)),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

/// Bounded in-process channel for a coordinator running on a thread
pub struct InProcessChannel {
    sender: Sender<Vec<u8>>,
    receiver: Receiver<Vec<u8>>,
}

impl InProcessChannel {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self { sender, receiver }
    }
}

impl MessageChannel for InProcessChannel {
    fn try_send(&self, frame: &[u8]) -> bool {
        match self.sender.try_send(frame.to_vec()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                trace!("[coordinator] Channel full, frame of {} bytes refused", frame.len());
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn timed_receive(&self, buffer: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        match self.receiver.recv_timeout(timeout) {
            Ok(frame) => {
                let target = buffer.get_mut(..frame.len()).ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidData, format!("frame of {} bytes does not fit", frame.len()))
                })?;
                target.copy_from_slice(&frame);
                Ok(Some(frame.len()))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(io::Error::from(io::ErrorKind::BrokenPipe)),
        }
    }
}
