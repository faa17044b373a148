//-
// Copyright (c) 2026, the berth authors
//
// This file is part of berth.
//
// berth is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// berth is distributed  in the hope that  it will be  useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// berth. If not, see <http://www.gnu.org/licenses/>.

//! Async IO over a client socket that can switch from cleartext to TLS
//! mid-stream (STARTTLS).
//!
//! Clones of a `ServerIo` share the same underlying socket and mode, so
//! the session's reader and writer tasks can operate simultaneously.
//! The mode lock is only ever held inside a synchronous poll body, never
//! across an await point.

use std::io;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task;

use openssl::ssl::{SslAcceptor, SslStream};
use tokio::io::{unix::AsyncFd, AsyncRead, AsyncWrite, ReadBuf};

use crate::support::error::Error;

#[derive(Clone)]
pub struct ServerIo {
    inner: Arc<Inner>,
}

struct Inner {
    fd: AsyncFd<RawFd>,
    mode: Mutex<Mode>,
}

enum Mode {
    Cleartext(SocketRw),
    Ssl(SslStream<SocketRw>),
    /// The STARTTLS handshake owns the stream; concurrent IO is a bug.
    Handshaking,
}

impl ServerIo {
    /// Takes ownership of the socket; it is closed when the last clone is
    /// dropped.
    pub fn new(socket: impl IntoRawFd) -> Result<Self, Error> {
        let fd = socket.into_raw_fd();
        nix::fcntl::fcntl(
            fd,
            nix::fcntl::FcntlArg::F_SETFL(nix::fcntl::OFlag::O_NONBLOCK),
        )?;

        let async_fd = AsyncFd::with_interest(
            fd,
            tokio::io::Interest::READABLE | tokio::io::Interest::WRITABLE,
        )?;

        Ok(ServerIo {
            inner: Arc::new(Inner {
                fd: async_fd,
                mode: Mutex::new(Mode::Cleartext(SocketRw(fd))),
            }),
        })
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.inner.mode.lock().unwrap(), Mode::Ssl(..))
    }

    /// Performs the server-side TLS handshake, switching the stream into
    /// TLS mode on success.
    ///
    /// The caller must guarantee no concurrent reads or writes; any that
    /// happen during the handshake fail.
    pub async fn ssl_accept(
        &self,
        acceptor: &SslAcceptor,
    ) -> Result<(), Error> {
        let rw = {
            let mut mode = self.inner.mode.lock().unwrap();
            match std::mem::replace(&mut *mode, Mode::Handshaking) {
                Mode::Cleartext(rw) => rw,
                other => {
                    *mode = other;
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "TLS already active",
                    )));
                },
            }
        };

        let mut result = acceptor.accept(rw);

        // There is no way to know which readiness OpenSSL needs without
        // running a pass of the handshake, and no way to tell Tokio "I
        // just saw it's not ready" without a guard from a previous
        // readiness check. So: hold the last guard, clear it only when
        // OpenSSL reports the same direction blocked again.
        let mut read_guard: Option<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>> = None;
        let mut write_guard: Option<tokio::io::unix::AsyncFdReadyGuard<'_, RawFd>> = None;

        loop {
            match result {
                Ok(stream) => {
                    *self.inner.mode.lock().unwrap() = Mode::Ssl(stream);
                    return Ok(());
                },

                Err(openssl::ssl::HandshakeError::SetupFailure(e)) => {
                    return Err(e.into());
                },

                Err(openssl::ssl::HandshakeError::Failure(mhss)) => {
                    return Err(mhss_to_error(mhss));
                },

                Err(openssl::ssl::HandshakeError::WouldBlock(mhss)) => {
                    match mhss.error().code() {
                        openssl::ssl::ErrorCode::WANT_READ => {
                            if let Some(mut guard) = read_guard.take() {
                                guard.clear_ready();
                            }
                            read_guard =
                                Some(self.inner.fd.readable().await?);
                            result = mhss.handshake();
                        },

                        openssl::ssl::ErrorCode::WANT_WRITE => {
                            if let Some(mut guard) = write_guard.take() {
                                guard.clear_ready();
                            }
                            write_guard =
                                Some(self.inner.fd.writable().await?);
                            result = mhss.handshake();
                        },

                        _ => return Err(mhss_to_error(mhss)),
                    }
                },
            }
        }
    }

    /// Arranges wakeups after OpenSSL reported `WANT_READ`/`WANT_WRITE`
    /// from `ssl_read`/`ssl_write`. Must be called immediately after the
    /// failing call, with no await in between.
    fn on_rw_ssl_error(
        &self,
        ctx: &mut task::Context<'_>,
        e: openssl::ssl::Error,
    ) -> task::Poll<io::Result<()>> {
        match e.code() {
            openssl::ssl::ErrorCode::WANT_READ => {
                futures::ready!(self.inner.fd.poll_read_ready(ctx))?
                    .clear_ready();
                futures::ready!(self.inner.fd.poll_read_ready(ctx))?
                    .retain_ready();
                task::Poll::Ready(Ok(()))
            },

            openssl::ssl::ErrorCode::WANT_WRITE => {
                futures::ready!(self.inner.fd.poll_write_ready(ctx))?
                    .clear_ready();
                futures::ready!(self.inner.fd.poll_write_ready(ctx))?
                    .retain_ready();
                task::Poll::Ready(Ok(()))
            },

            // EOF surfaces as SYSCALL with no inner IO error.
            openssl::ssl::ErrorCode::SYSCALL => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|_| io::ErrorKind::UnexpectedEof.into()))),

            _ => task::Poll::Ready(Err(e
                .into_io_error()
                .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e)))),
        }
    }
}

impl AsyncRead for ServerIo {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.inner.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext(ref mut rw) => {
                let rw = *rw;
                drop(mode);
                loop {
                    let mut guard = futures::ready!(
                        self.inner.fd.poll_read_ready(ctx)
                    )?;

                    match guard.try_io(|_| {
                        read_fd(rw.0, buf.initialize_unfilled())
                    }) {
                        Ok(Ok(n)) => {
                            buf.advance(n);
                            return task::Poll::Ready(Ok(()));
                        },
                        Ok(Err(e)) => return task::Poll::Ready(Err(e)),
                        Err(_would_block) => continue,
                    }
                }
            },

            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_read(buf.initialize_unfilled()) {
                    Ok(n) => {
                        buf.advance(n);
                        return task::Poll::Ready(Ok(()));
                    },
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },

            Mode::Handshaking => task::Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "read during TLS handshake",
            ))),
        }
    }
}

impl AsyncWrite for ServerIo {
    fn poll_write(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &[u8],
    ) -> task::Poll<io::Result<usize>> {
        let mut mode = self.inner.mode.lock().unwrap();
        match *mode {
            Mode::Cleartext(ref mut rw) => {
                let rw = *rw;
                drop(mode);
                loop {
                    let mut guard = futures::ready!(
                        self.inner.fd.poll_write_ready(ctx)
                    )?;

                    if let Ok(result) =
                        guard.try_io(|_| write_fd(rw.0, buf))
                    {
                        return task::Poll::Ready(result);
                    }
                }
            },

            Mode::Ssl(ref mut ssl) => loop {
                match ssl.ssl_write(buf) {
                    Ok(n) => return task::Poll::Ready(Ok(n)),
                    Err(e) => futures::ready!(self.on_rw_ssl_error(ctx, e))?,
                }
            },

            Mode::Handshaking => task::Poll::Ready(Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                "write during TLS handshake",
            ))),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        _ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        // Neither OpenSSL nor the raw socket buffers on our side.
        task::Poll::Ready(Ok(()))
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
    ) -> task::Poll<io::Result<()>> {
        let mut mode = self.inner.mode.lock().unwrap();
        let done = if let Mode::Ssl(ref mut ssl) = *mode {
            loop {
                match ssl.shutdown() {
                    Ok(openssl::ssl::ShutdownResult::Received) => break,
                    Ok(openssl::ssl::ShutdownResult::Sent) => {
                        return task::Poll::Pending;
                    },
                    Err(e) => {
                        futures::ready!(self.on_rw_ssl_error(ctx, e))?
                    },
                }
            }
            true
        } else {
            false
        };

        if done {
            *mode = Mode::Cleartext(SocketRw(*self.inner.fd.get_ref()));
        }

        task::Poll::Ready(Ok(()))
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let _ = nix::unistd::close(*self.fd.get_ref());
    }
}

/// Synchronous read/write over the raw fd, used both directly in
/// cleartext mode and as the transport under the OpenSSL stream.
#[derive(Clone, Copy)]
struct SocketRw(RawFd);

impl io::Read for SocketRw {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        read_fd(self.0, dst)
    }
}

impl io::Write for SocketRw {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        write_fd(self.0, src)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn read_fd(fd: RawFd, dst: &mut [u8]) -> io::Result<usize> {
    nix::unistd::read(fd, dst).map_err(nix_to_io)
}

fn write_fd(fd: RawFd, src: &[u8]) -> io::Result<usize> {
    nix::unistd::write(fd, src).map_err(nix_to_io)
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e as i32)
}

fn mhss_to_error(
    mhss: openssl::ssl::MidHandshakeSslStream<SocketRw>,
) -> Error {
    let e = mhss.into_error();
    if let Some(es) = e.ssl_error() {
        Error::Ssl(es.clone())
    } else {
        match e.into_io_error() {
            Ok(io) => Error::Io(io),
            Err(e) if e.code() == openssl::ssl::ErrorCode::SYSCALL => {
                Error::Io(io::ErrorKind::UnexpectedEof.into())
            },
            Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
        }
    }
}
