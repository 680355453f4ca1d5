//! Private master↔worker control channel.
//!
//! A `SOCK_STREAM` socketpair created by the master at fork time. The master keeps
//! one end; the other end is moved to [`INHERITED_FD`] in the child before exec.

use std::io;
use std::os::fd::{BorrowedFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;

use futures::SinkExt;
use nix::fcntl::{FcntlArg, fcntl};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::codec::{CodecError, ControlCodec};
use super::protocol::ControlMessage;

/// Descriptor slot where a worker finds its end of the control channel.
pub const INHERITED_FD: RawFd = 3;

pub type ControlReader = FramedRead<OwnedReadHalf, ControlCodec>;
pub type ControlWriter = FramedWrite<OwnedWriteHalf, ControlCodec>;

/// One endpoint of a control channel.
#[derive(Debug)]
pub struct ControlChannel {
    stream: UnixStream,
}

impl ControlChannel {
    /// Connected in-process pair. Requires a running tokio runtime.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self { stream: a }, Self { stream: b }))
    }

    /// Blocking socketpair for handing one end to a child process.
    ///
    /// Both ends are created close-on-exec; the launcher re-enables inheritance for the
    /// child's end only.
    pub fn std_pair() -> io::Result<(StdUnixStream, StdUnixStream)> {
        StdUnixStream::pair()
    }

    pub fn from_std(stream: StdUnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(stream)?,
        })
    }

    /// Adopt the endpoint inherited from the master at [`INHERITED_FD`].
    pub fn inherit() -> io::Result<Self> {
        // SAFETY: the borrow only lives for the F_GETFD probe, which reports EBADF
        // for an empty slot before anything takes ownership.
        let slot = unsafe { BorrowedFd::borrow_raw(INHERITED_FD) };
        fcntl(slot, FcntlArg::F_GETFD).map_err(|errno| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("no control channel at fd {INHERITED_FD}: {errno}"),
            )
        })?;

        // SAFETY: the master placed one end of a socketpair at this slot and nothing
        // else in the worker claims it; we become its sole owner here.
        let stream = unsafe { StdUnixStream::from_raw_fd(INHERITED_FD) };
        stream.peer_addr()?;
        Self::from_std(stream)
    }

    pub fn split(self) -> (ControlReader, ControlWriter) {
        let (read_half, write_half) = self.stream.into_split();
        (
            FramedRead::new(read_half, ControlCodec::new()),
            FramedWrite::new(write_half, ControlCodec::new()),
        )
    }
}

/// Write one message and flush it.
pub async fn send(writer: &mut ControlWriter, msg: ControlMessage) -> Result<(), CodecError> {
    writer.send(msg).await
}
