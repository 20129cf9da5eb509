//! Managed IPv4 socket wrappers with cooperative teardown.
//!
//! Tokio gives every socket non-blocking `async` I/O already, so the
//! "blocking IPv4 TCP/UDP" socket of the reference design becomes an
//! `.await` point here; what still needs modelling explicitly is the
//! teardown contract: a task parked in `recv`/`recv_any`/`accept` must
//! unblock with a recognizable error once another task calls `shutdown()`
//! or `close()` on the same connection, without the two ever racing on a
//! reused file descriptor. We get that by racing every blocking operation
//! against the connection's `Trigger` in `tokio::select!`, and by holding
//! the underlying socket behind a `tokio::sync::RwLock`: `close()` takes
//! the lock exclusively to drop the socket, every I/O method takes it
//! shared.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::RwLock;

use crate::errors::{ErrorKind, classify_io_error};
use crate::sync::Trigger;

fn io_result<T>(result: std::io::Result<T>) -> Result<T, ErrorKind> {
    result.map_err(|e| classify_io_error(&e))
}

/// A managed TCP listener: `accept()` races against `shutdown()`.
pub struct TcpListenerConn {
    listener: RwLock<Option<TcpListener>>,
    stop: Trigger,
}

impl TcpListenerConn {
    pub async fn listen(addr: SocketAddr) -> Result<Self, ErrorKind> {
        let listener = io_result(TcpListener::bind(addr).await)?;
        Ok(TcpListenerConn {
            listener: RwLock::new(Some(listener)),
            stop: Trigger::new(),
        })
    }

    /// Blocks until an inbound connection arrives, `shutdown()` is called,
    /// or the listener is closed.
    pub async fn accept(&self) -> Result<(TcpStreamConn, SocketAddr), ErrorKind> {
        loop {
            let guard = self.listener.read().await;
            let Some(listener) = guard.as_ref() else {
                return Err(ErrorKind::BrokenPipe);
            };
            tokio::select! {
                biased;
                _ = self.stop.wait_async() => return Err(ErrorKind::Interrupted),
                result = listener.accept() => {
                    let (stream, addr) = io_result(result)?;
                    return Ok((TcpStreamConn::from_stream(stream), addr));
                }
            }
        }
    }

    /// Unblocks `accept()` without closing the listening socket.
    pub fn shutdown(&self) {
        self.stop.trigger();
    }

    pub async fn close(&self) {
        self.stop.trigger();
        *self.listener.write().await = None;
    }

    pub async fn is_open(&self) -> bool {
        self.listener.read().await.is_some()
    }

    pub async fn local_addr(&self) -> Result<SocketAddr, ErrorKind> {
        let guard = self.listener.read().await;
        let Some(listener) = guard.as_ref() else {
            return Err(ErrorKind::BrokenPipe);
        };
        io_result(listener.local_addr())
    }
}

/// A managed TCP stream, either from `accept()` or `connect()`.
pub struct TcpStreamConn {
    stream: RwLock<Option<TcpStream>>,
    stop: Trigger,
}

impl TcpStreamConn {
    fn from_stream(stream: TcpStream) -> Self {
        TcpStreamConn {
            stream: RwLock::new(Some(stream)),
            stop: Trigger::new(),
        }
    }

    /// Wraps an already-connected `TcpStream`. Exposed for tests that need
    /// a managed connection without going through `listen()`/`connect()`.
    #[cfg(test)]
    pub(crate) fn from_raw(stream: TcpStream) -> Self {
        Self::from_stream(stream)
    }

    pub async fn connect(bind_addr: Ipv4Addr, host: Ipv4Addr, port: u16) -> Result<Self, ErrorKind> {
        let socket = io_result(tokio::net::TcpSocket::new_v4())?;
        io_result(socket.bind(SocketAddr::V4(SocketAddrV4::new(bind_addr, 0))))?;
        let stream = io_result(socket.connect(SocketAddr::V4(SocketAddrV4::new(host, port))).await)?;
        Ok(TcpStreamConn::from_stream(stream))
    }

    pub fn stop_trigger(&self) -> Trigger {
        self.stop.clone()
    }

    /// Fills `buf` completely, looping over partial reads. `BrokenPipe` on
    /// clean EOF.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<(), ErrorKind> {
        let mut filled = 0;
        while filled < buf.len() {
            let guard = self.stream.read().await;
            let Some(stream) = guard.as_ref() else {
                return Err(ErrorKind::BrokenPipe);
            };
            tokio::select! {
                biased;
                _ = self.stop.wait_async() => return Err(ErrorKind::Interrupted),
                result = stream.readable() => {
                    io_result(result)?;
                    match stream.try_read(&mut buf[filled..]) {
                        Ok(0) => return Err(ErrorKind::BrokenPipe),
                        Ok(n) => filled += n,
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(classify_io_error(&e)),
                    }
                }
            }
        }
        Ok(())
    }

    /// Reads a single chunk, up to `buf.len()` bytes.
    pub async fn recv_any(&self, buf: &mut [u8]) -> Result<usize, ErrorKind> {
        let guard = self.stream.read().await;
        let Some(stream) = guard.as_ref() else {
            return Err(ErrorKind::BrokenPipe);
        };
        loop {
            tokio::select! {
                biased;
                _ = self.stop.wait_async() => return Err(ErrorKind::Interrupted),
                result = stream.readable() => {
                    io_result(result)?;
                    match stream.try_read(buf) {
                        Ok(0) => return Err(ErrorKind::BrokenPipe),
                        Ok(n) => return Ok(n),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                        Err(e) => return Err(classify_io_error(&e)),
                    }
                }
            }
        }
    }

    pub async fn send(&self, buf: &[u8]) -> Result<(), ErrorKind> {
        use tokio::io::AsyncWriteExt;
        let guard = self.stream.read().await;
        let Some(stream) = guard.as_ref() else {
            return Err(ErrorKind::BrokenPipe);
        };
        let mut stream = stream;
        io_result(stream.write_all(buf).await)
    }

    pub fn shutdown(&self) {
        self.stop.trigger();
    }

    pub async fn close(&self) {
        self.stop.trigger();
        *self.stream.write().await = None;
    }

    pub async fn is_open(&self) -> bool {
        self.stream.read().await.is_some()
    }
}

/// A managed UDP socket bound to a single local address.
pub struct UdpConn {
    socket: UdpSocket,
    stop: Trigger,
}

impl UdpConn {
    pub async fn bind(addr: SocketAddr) -> Result<Self, ErrorKind> {
        let socket = io_result(UdpSocket::bind(addr).await)?;
        Ok(UdpConn {
            socket,
            stop: Trigger::new(),
        })
    }

    /// Receives a single datagram, returning its sender's address.
    pub async fn recv_any(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), ErrorKind> {
        tokio::select! {
            biased;
            _ = self.stop.wait_async() => Err(ErrorKind::Interrupted),
            result = self.socket.recv_from(buf) => io_result(result),
        }
    }

    pub async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<(), ErrorKind> {
        io_result(self.socket.send_to(buf, addr).await).map(|_| ())
    }

    pub fn shutdown(&self) {
        self.stop.trigger();
    }

    pub fn is_open(&self) -> bool {
        !self.stop.is_triggered()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    // Property 5: socket teardown unblocks blocked reads.
    #[tokio::test]
    async fn shutdown_unblocks_blocked_udp_recv() {
        let conn = std::sync::Arc::new(
            UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap(),
        );
        let reader = conn.clone();
        let handle = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.recv_any(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        conn.shutdown();
        let result = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("recv_any did not unblock")
            .unwrap();
        assert_eq!(result.unwrap_err(), ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn tcp_listener_accept_unblocks_on_shutdown() {
        let listener = std::sync::Arc::new(
            TcpListenerConn::listen("127.0.0.1:0".parse().unwrap())
                .await
                .unwrap(),
        );
        let l = listener.clone();
        let handle = tokio::spawn(async move { l.accept().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        listener.shutdown();
        let result = tokio::time::timeout(Duration::from_millis(200), handle)
            .await
            .expect("accept did not unblock")
            .unwrap();
        assert_eq!(result.unwrap_err(), ErrorKind::Interrupted);
    }

    #[tokio::test]
    async fn udp_send_and_receive_round_trip() {
        let a = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b = UdpConn::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let b_addr = b.socket.local_addr().unwrap();
        a.send_to(b"hello", b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _addr) = b.recv_any(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
    }
}
