//! Local TCP peers standing in for the echo workload.
//!
//! # Example
//!
//! ```rust,ignore
//! use smoke_test_utils::{EchoBehavior, EchoPeer};
//!
//! let peer = EchoPeer::start(EchoBehavior::Uppercase)?;
//! let reply = verify(&peer.address(), &exchange, &settings).await?;
//! ```

use std::net::{Ipv4Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

/// How the peer answers each received chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchoBehavior {
    /// Reply with the input upper-cased, like the real workload.
    Uppercase,
    /// Reply with the input unchanged.
    Verbatim,
    /// Reply with these bytes regardless of input.
    Fixed(Vec<u8>),
    /// Accept, then close without reading or replying.
    CloseImmediately,
    /// Read but never reply.
    Silent,
    /// Upper-cased reply written in `chunk`-byte pieces, `delay` apart.
    Fragmented { chunk: usize, delay: Duration },
}

/// A TCP peer on 127.0.0.1. Stops accepting when dropped.
#[derive(Debug)]
pub struct EchoPeer {
    addr: SocketAddr,
    connections: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl EchoPeer {
    /// Start on an ephemeral port. Must be called inside a tokio runtime.
    pub fn start(behavior: EchoBehavior) -> std::io::Result<Self> {
        Self::start_on(0, behavior)
    }

    /// Start on `port`. Synchronous so it can run inside a spawn hook.
    pub fn start_on(port: u16, behavior: EchoBehavior) -> std::io::Result<Self> {
        let listener = StdTcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        let addr = listener.local_addr()?;

        let connections = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&connections);

        let handle = tokio::spawn(async move {
            loop {
                let Ok((stream, remote)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                debug!(target: "smoke.test_utils", %addr, %remote, "Echo peer accepted connection");
                tokio::spawn(serve(stream, behavior.clone()));
            }
        });

        Ok(Self {
            addr,
            connections,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// `127.0.0.1:<port>`.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Connections accepted so far, including readiness probes.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }
}

impl Drop for EchoPeer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(mut stream: TcpStream, behavior: EchoBehavior) {
    if behavior == EchoBehavior::CloseImmediately {
        return;
    }

    let mut buf = vec![0u8; 4096];
    loop {
        let n = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let received = &buf[..n];

        let result = match &behavior {
            EchoBehavior::Uppercase => stream.write_all(&received.to_ascii_uppercase()).await,
            EchoBehavior::Verbatim => stream.write_all(received).await,
            EchoBehavior::Fixed(reply) => stream.write_all(reply).await,
            EchoBehavior::Silent | EchoBehavior::CloseImmediately => Ok(()),
            EchoBehavior::Fragmented { chunk, delay } => {
                write_fragmented(&mut stream, &received.to_ascii_uppercase(), *chunk, *delay).await
            }
        };
        if result.is_err() {
            return;
        }
    }
}

async fn write_fragmented(
    stream: &mut TcpStream,
    reply: &[u8],
    chunk: usize,
    delay: Duration,
) -> std::io::Result<()> {
    for piece in reply.chunks(chunk.max(1)) {
        stream.write_all(piece).await?;
        stream.flush().await?;
        tokio::time::sleep(delay).await;
    }
    Ok(())
}

/// A port on 127.0.0.1 that was free a moment ago.
pub fn free_port() -> u16 {
    StdTcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .and_then(|listener| listener.local_addr())
        .map(|addr| addr.port())
        .expect("failed to allocate a local port")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_uppercase_peer_echoes() {
        let peer = EchoPeer::start(EchoBehavior::Uppercase).unwrap();
        let mut stream = TcpStream::connect(peer.addr()).await.unwrap();
        stream.write_all(b"Halo").await.unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"HALO");
        assert_eq!(peer.connections(), 1);
    }

    #[test]
    fn test_free_port_is_nonzero() {
        assert_ne!(free_port(), 0);
    }
}
