use std::io::{self, Read, Write};
use std::marker::PhantomData;
use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;

use nix::sys::signal::{SigSet, Signal};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Result, SupervisorError};

const HEADER_LEN: usize = 4;

/// The outcome of a `receive`: either a decoded message, or an orderly close
/// of the peer's end of the stream (a zero-length read on the header).
pub enum Received<T> {
    Message(T),
    Closed,
}

/// One end of a length-prefixed duplex byte-stream channel between the
/// parent and exactly one child.
///
/// Frames are `u32` big-endian length followed by that many payload bytes,
/// serialized with `bincode`. The encoding is private to this process
/// family; it does not need to round-trip across language boundaries.
pub struct FramedChannel<T> {
    stream: UnixStream,
    _marker: PhantomData<T>,
}

impl<T> FramedChannel<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(stream: UnixStream) -> Self {
        FramedChannel {
            stream,
            _marker: PhantomData,
        }
    }

    pub fn from_owned_fd(fd: OwnedFd) -> Self {
        Self::new(UnixStream::from(fd))
    }

    /// Create a connected pair of channel endpoints, for a parent/child
    /// socketpair handoff. The returned pair shares no state; each side owns
    /// its own `UnixStream`.
    pub fn pair() -> Result<(FramedChannel<T>, FramedChannel<T>)> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
        let (a, b) = socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
            .map_err(|e| SupervisorError::Transport(io::Error::from(e)))?;
        Ok((Self::from_owned_fd(a), Self::from_owned_fd(b)))
    }

    pub fn try_clone(&self) -> Result<Self> {
        let stream = self
            .stream
            .try_clone()
            .map_err(SupervisorError::Transport)?;
        Ok(Self::new(stream))
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.stream
            .set_nonblocking(nonblocking)
            .map_err(SupervisorError::Transport)
    }

    /// True if the socket has bytes buffered that haven't been read yet.
    /// Used by `ChildTable::count_pending` to decide whether a STOPPED
    /// child's channel still needs draining.
    pub fn has_pending_bytes(&self) -> bool {
        use std::os::fd::AsRawFd;
        let mut available: libc::c_int = 0;
        let rc = unsafe { libc::ioctl(self.stream.as_raw_fd(), libc::FIONREAD, &mut available) };
        rc == 0 && available > 0
    }

    /// Serialize `msg`, prefix it with its big-endian length, and write it
    /// in full. Async signal delivery (SIGCHLD) is masked for the duration
    /// so a reap triggered mid-write can't observe a half-written frame.
    pub fn send(&mut self, msg: &T) -> Result<()> {
        let payload = bincode::serialize(msg).map_err(SupervisorError::Encode)?;
        let len = payload.len() as u32;

        let _guard = SigchldGuard::block();
        self.stream
            .write_all(&len.to_be_bytes())
            .map_err(SupervisorError::Transport)?;
        self.stream
            .write_all(&payload)
            .map_err(SupervisorError::Transport)?;
        self.stream.flush().map_err(SupervisorError::Transport)
    }

    /// Read one frame. A zero-length read on the 4-byte header means the
    /// peer closed its end in an orderly fashion.
    pub fn receive(&mut self) -> Result<Received<T>> {
        let _guard = SigchldGuard::block();

        let mut header = [0u8; HEADER_LEN];
        match read_fully(&mut self.stream, &mut header)? {
            0 => return Ok(Received::Closed),
            n if n < HEADER_LEN => {
                return Err(SupervisorError::Decode(Box::new(bincode::ErrorKind::Custom(
                    format!("truncated frame header: {} of {} bytes", n, HEADER_LEN),
                ))))
            }
            _ => {}
        }
        let len = u32::from_be_bytes(header) as usize;

        let mut payload = vec![0u8; len];
        let got = read_fully(&mut self.stream, &mut payload)?;
        if got != len {
            return Err(SupervisorError::Decode(Box::new(bincode::ErrorKind::Custom(
                format!("truncated frame payload: {} of {} bytes", got, len),
            ))));
        }

        let msg = bincode::deserialize(&payload).map_err(SupervisorError::Decode)?;
        Ok(Received::Message(msg))
    }

    /// Non-blocking variant used by the reaper to opportunistically drain a
    /// child's channel: `Ok(None)` means no frame is available right now,
    /// as opposed to `Ok(Some(Received::Closed))` which means the peer is
    /// gone. Once a header starts arriving, the rest of that one frame is
    /// waited for with ordinary blocking reads — a writer that started a
    /// frame finishes it promptly, and a stalled peer is still bounded by
    /// the caller reaping and invalidating the channel.
    pub fn try_receive(&mut self) -> Result<Option<Received<T>>> {
        let _guard = SigchldGuard::block();
        self.stream
            .set_nonblocking(true)
            .map_err(SupervisorError::Transport)?;

        let mut header = [0u8; HEADER_LEN];
        let first = match self.stream.read(&mut header) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                let _ = self.stream.set_nonblocking(false);
                return Ok(None);
            }
            Err(e) => {
                let _ = self.stream.set_nonblocking(false);
                return Err(SupervisorError::Transport(e));
            }
        };
        self.stream
            .set_nonblocking(false)
            .map_err(SupervisorError::Transport)?;

        if first == 0 {
            return Ok(Some(Received::Closed));
        }
        if first < HEADER_LEN {
            let got = read_fully(&mut self.stream, &mut header[first..])?;
            if got != HEADER_LEN - first {
                return Err(SupervisorError::Decode(Box::new(bincode::ErrorKind::Custom(
                    "truncated frame header".into(),
                ))));
            }
        }
        let len = u32::from_be_bytes(header) as usize;

        let mut payload = vec![0u8; len];
        let got = read_fully(&mut self.stream, &mut payload)?;
        if got != len {
            return Err(SupervisorError::Decode(Box::new(bincode::ErrorKind::Custom(
                format!("truncated frame payload: {} of {} bytes", got, len),
            ))));
        }

        let msg = bincode::deserialize(&payload).map_err(SupervisorError::Decode)?;
        Ok(Some(Received::Message(msg)))
    }
}

/// Reads until `buf` is full or the stream is closed, returning the number
/// of bytes actually read (which is `buf.len()` unless the peer closed).
fn read_fully(stream: &mut UnixStream, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(SupervisorError::Transport(e)),
        }
    }
    Ok(filled)
}

/// Blocks `SIGCHLD` for the lifetime of the guard, restoring the previous
/// mask on drop. Prevents a reaper invocation from interleaving with a
/// partially-written or partially-read frame.
struct SigchldGuard {
    previous: SigSet,
}

impl SigchldGuard {
    fn block() -> Self {
        // Best-effort: if the mask can't be read/set we still proceed: a
        // missed mask restore is far less harmful than blocking forever.
        let previous = SigSet::thread_get_mask().unwrap_or_else(|_| SigSet::empty());
        let mut set = SigSet::empty();
        set.add(Signal::SIGCHLD);
        let _ = set.thread_block();
        SigchldGuard { previous }
    }
}

impl Drop for SigchldGuard {
    fn drop(&mut self) {
        let _ = self.previous.thread_set_mask();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
    struct Sample {
        id: u32,
        name: String,
        payload: Vec<u8>,
    }

    #[test]
    fn frame_round_trips() {
        let (mut a, mut b): (FramedChannel<Sample>, FramedChannel<Sample>) =
            FramedChannel::pair().unwrap();
        let msg = Sample {
            id: 7,
            name: "batch".into(),
            payload: vec![1, 2, 3, 4, 5],
        };
        a.send(&msg).unwrap();
        match b.receive().unwrap() {
            Received::Message(got) => assert_eq!(got, msg),
            Received::Closed => panic!("unexpected close"),
        }
    }

    #[test]
    fn multiple_frames_preserve_boundaries() {
        let (mut a, mut b): (FramedChannel<Sample>, FramedChannel<Sample>) =
            FramedChannel::pair().unwrap();
        for i in 0..5u32 {
            a.send(&Sample {
                id: i,
                name: format!("msg-{}", i),
                payload: vec![i as u8; i as usize],
            })
            .unwrap();
        }
        for i in 0..5u32 {
            match b.receive().unwrap() {
                Received::Message(got) => assert_eq!(got.id, i),
                Received::Closed => panic!("unexpected close"),
            }
        }
    }

    #[test]
    fn closing_peer_yields_closed() {
        let (a, mut b): (FramedChannel<Sample>, FramedChannel<Sample>) =
            FramedChannel::pair().unwrap();
        drop(a);
        match b.receive().unwrap() {
            Received::Closed => {}
            Received::Message(_) => panic!("expected orderly close"),
        }
    }
}
