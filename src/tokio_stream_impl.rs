use core::{
    pin::Pin,
    task::{Context, Poll, ready},
};
use std::io::{ErrorKind, Read, Write};

use pin_project_lite::pin_project;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{
    binding::{ConnectionBinding, ResolveBinding, Role},
    config::Config,
    error::Error,
    read_engine::ActivityTracker,
    state_machine::Vision,
};

pin_project! {
    /// Asynchronous shaped stream based on `Tokio` runtime.
    ///
    /// [`SegaroStream`] implements the [`AsyncRead`] and [`AsyncWrite`] traits,
    /// allowing it to be used similarly to a [`TcpStream`].
    ///
    /// Writes that must wait for the first round drive the read side of the
    /// carrier, so a task that only writes still completes the handshake.
    ///
    /// [`TcpStream`]: tokio::net::TcpStream
    #[derive(Debug)]
    pub struct SegaroStream<IO> {
        stream: IO,
        vision: Vision,
        write_state: WriteState,
    }
}

/// State Transition Diagram
/// ```text
///
///    |
///    V
///  WaitData <---+
///    |          |
///    V          |
///   Write ------+
/// ```
#[derive(Copy, Clone, Debug)]
enum WriteState {
    WaitData,
    Write { written: usize },
}

impl<IO> SegaroStream<IO> {
    /// Creates a new [`SegaroStream`] for the endpoint playing `role` over
    /// the underlying `stream`.
    ///
    /// For details on constructing and configuring `config`, refer to
    /// the [`config`] module.
    ///
    /// [`config`]: crate::config
    pub fn new_in(config: Config, binding: ConnectionBinding, role: Role, stream: IO) -> Self {
        Self::from_vision(Vision::new(config, binding, role), stream)
    }

    /// Creates a new [`SegaroStream`] with a 64-byte random seed.
    ///
    /// **Warning**: The `random` parameter must be sourced from a
    /// high-quality, cryptographically secure entropy source.
    /// For general use cases, the `new_in` method is recommended.
    pub fn with_random_in(
        config: Config,
        binding: ConnectionBinding,
        role: Role,
        random: [u8; 64],
        stream: IO,
    ) -> Self {
        Self::from_vision(Vision::with_random(config, binding, role, random), stream)
    }

    /// Wraps an already constructed [`Vision`].
    pub fn from_vision(vision: Vision, stream: IO) -> Self {
        Self {
            stream,
            vision,
            write_state: WriteState::WaitData,
        }
    }

    /// Sets the request header the initiator sends with its first payload.
    pub fn set_request_header(&mut self, header: &[u8]) {
        self.vision.set_request_header(header);
    }

    /// The request header received from the initiator, on a responder.
    pub fn request_header(&self) -> Option<&[u8]> {
        self.vision.request_header()
    }

    /// Installs a hook notified on every non-empty inbound segment.
    pub fn set_activity_tracker(&mut self, tracker: impl ActivityTracker + 'static) {
        self.vision.set_activity_tracker(tracker);
    }

    /// Returns a reference to the internal stream.
    pub fn inner_stream(&self) -> &IO {
        &self.stream
    }

    /// Returns a mutable reference to the inner stream.
    pub fn inner_stream_mut(&mut self) -> &mut IO {
        &mut self.stream
    }
}

impl<IO: ResolveBinding> SegaroStream<IO> {
    /// Creates a new [`SegaroStream`], resolving the binding from the
    /// underlying `stream` itself.
    pub fn resolve_in(config: Config, role: Role, stream: IO) -> Result<Self, Error> {
        let vision = Vision::resolve(config, &stream, role)?;
        Ok(Self::from_vision(vision, stream))
    }
}

/// Writes everything the engines have queued.
///
/// Bytes held back by the first round make this function read from the
/// carrier until the round finishes.
fn poll_wire_out<IO>(
    vision: &mut Vision,
    stream: &mut IO,
    cx: &mut Context<'_>,
) -> Poll<std::io::Result<()>>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut writer = SyncWriteAdapter {
            io: &mut *stream,
            cx,
        };
        match vision.write_wire(&mut writer) {
            Ok(_) if !vision.wants_write() => return Poll::Ready(Ok(())),
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                if !vision.is_gated() {
                    return Poll::Pending;
                }
                match vision.poll_first_round(cx) {
                    Poll::Ready(Ok(())) => continue,
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into())),
                    Poll::Pending => {}
                }
                // The first round finishes on the read side, drive it.
                let mut reader = SyncReadAdapter {
                    io: &mut *stream,
                    cx,
                };
                match vision.read_wire(&mut reader) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }
            Err(e) => return Poll::Ready(Err(e)),
        }
    }
}

impl<IO> AsyncRead for SegaroStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let me = self.project();
        loop {
            // Bytes the read side owes the peer (decoy burst, handoff) go
            // out first. A full carrier is retried on the next poll.
            if me.vision.read_engine_mut().wants_write() {
                let mut writer = SyncWriteAdapter {
                    io: &mut *me.stream,
                    cx,
                };
                match me.vision.read_engine_mut().write_wire(&mut writer) {
                    Ok(_) => {}
                    Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                    Err(e) => return Poll::Ready(Err(e)),
                }
            }

            match me.vision.reader().read(buf.initialize_unfilled()) {
                // Deliver buffered data, or EOF when `n` is zero.
                Ok(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) => return Poll::Ready(Err(e)),
            }

            let mut reader = SyncReadAdapter {
                io: &mut *me.stream,
                cx,
            };
            match me.vision.read_wire(&mut reader) {
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Poll::Pending,
                Err(e) => return Poll::Ready(Err(e)),
            }
        }
    }
}

impl<IO> AsyncWrite for SegaroStream<IO>
where
    IO: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        let me = self.project();
        loop {
            match me.write_state {
                WriteState::WaitData => match me.vision.writer().write(buf) {
                    Ok(written) => {
                        *me.write_state = WriteState::Write { written };
                    }
                    Err(e) => {
                        return Poll::Ready(Err(e));
                    }
                },
                WriteState::Write { written } => {
                    let written = *written;
                    return match poll_wire_out(me.vision, me.stream, cx) {
                        Poll::Ready(Ok(())) => {
                            *me.write_state = WriteState::WaitData;
                            Poll::Ready(Ok(written))
                        }
                        Poll::Ready(Err(e)) => {
                            *me.write_state = WriteState::WaitData;
                            Poll::Ready(Err(e))
                        }
                        Poll::Pending => Poll::Pending,
                    };
                }
            }
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        let me = self.project();
        ready!(poll_wire_out(me.vision, me.stream, cx))?;
        *me.write_state = WriteState::WaitData;
        Pin::new(me.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// An adapter that implements a [`Read`] interface for [`AsyncRead`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
///
/// The credit goes to the [futures-rustls](https://github.com/rustls/futures-rustls)
/// project for this adapter.
struct SyncReadAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncRead + Unpin> Read for SyncReadAdapter<'_, '_, T> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut buf = ReadBuf::new(buf);
        match Pin::new(&mut self.io).poll_read(self.cx, &mut buf) {
            Poll::Ready(Ok(())) => Ok(buf.filled().len()),
            Poll::Ready(Err(err)) => Err(err),
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}

/// An adapter that implements a [`Write`] interface for [`AsyncWrite`] types and an
/// associated [`Context`].
///
/// Turns `Poll::Pending` into `WouldBlock`.
///
/// The credit goes to the [futures-rustls](https://github.com/rustls/futures-rustls)
/// project for this adapter.
struct SyncWriteAdapter<'a, 'b, T> {
    io: &'a mut T,
    cx: &'a mut Context<'b>,
}

impl<T: AsyncWrite + Unpin> Write for SyncWriteAdapter<'_, '_, T> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match Pin::new(&mut self.io).poll_write(self.cx, buf) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match Pin::new(&mut self.io).poll_flush(self.cx) {
            Poll::Ready(result) => result,
            Poll::Pending => Err(ErrorKind::WouldBlock.into()),
        }
    }
}
