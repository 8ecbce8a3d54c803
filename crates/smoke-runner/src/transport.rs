//! Transport verifier.
//!
//! Sends a probe payload over a plain TCP stream and checks the reply. The
//! echo workload upper-cases what it receives, so the default expectation is
//! that the reply contains the upper-cased payload.
//!
//! # Reply framing
//!
//! There is no framing: one write, then at most `MAX_REPLY_BYTES` read back.
//! `ReadStrategy::SingleRead` takes whatever the first receive returns, which
//! is enough for the short echo replies this harness deals with but can miss
//! a reply the peer writes in several segments. `ReadStrategy::Accumulate`
//! keeps reading until the expectation matches, the peer closes, the buffer
//! is full, or the read timeout expires.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, info};

use crate::config::{DEFAULT_CONNECT_TIMEOUT_SECONDS, DEFAULT_READ_TIMEOUT_SECONDS};
use crate::errors::VerificationError;

/// Largest reply the verifier reads.
pub const MAX_REPLY_BYTES: usize = 1024;

/// How the reply is read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStrategy {
    /// One receive call, best effort.
    SingleRead,
    /// Read until the expectation matches or the reply ends.
    Accumulate,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    /// Overall budget for reading the reply.
    pub read_timeout: Duration,
    pub read_strategy: ReadStrategy,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECONDS),
            read_timeout: Duration::from_secs(DEFAULT_READ_TIMEOUT_SECONDS),
            read_strategy: ReadStrategy::SingleRead,
        }
    }
}

/// A probe payload and the substring its reply must contain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeExchange {
    payload: String,
    expected: String,
}

impl ProbeExchange {
    /// Expect the reply to contain `payload` upper-cased.
    pub fn uppercase_echo(payload: impl Into<String>) -> Self {
        let payload = payload.into();
        let expected = payload.to_uppercase();
        Self { payload, expected }
    }

    /// Expect the reply to contain `expected`.
    pub fn expecting(payload: impl Into<String>, expected: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            expected: expected.into(),
        }
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn expected(&self) -> &str {
        &self.expected
    }

    pub fn matches(&self, reply: &[u8]) -> bool {
        String::from_utf8_lossy(reply).contains(&self.expected)
    }
}

/// Bytes received from the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    bytes: Vec<u8>,
}

impl Reply {
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.bytes)
    }
}

/// Exchange `exchange` with the peer at `address` (`host:port`).
///
/// The connection is closed before this returns, on every path.
pub async fn verify(
    address: &str,
    exchange: &ProbeExchange,
    settings: &TransportSettings,
) -> Result<Reply, VerificationError> {
    let addr = resolve(address).await?;

    let mut stream = match timeout(settings.connect_timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(VerificationError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(VerificationError::Connect {
                address: address.to_string(),
                reason: format!("timed out after {:?}", settings.connect_timeout),
            })
        }
    };

    stream
        .write_all(exchange.payload().as_bytes())
        .await
        .map_err(|source| VerificationError::Write {
            address: address.to_string(),
            source,
        })?;
    debug!(target: "smoke.transport", address = %address, payload = %exchange.payload(), "Probe sent");

    let bytes = read_reply(&mut stream, exchange, settings)
        .await
        .map_err(|reason| VerificationError::Read {
            address: address.to_string(),
            reason,
        })?;

    // Best effort; the stream is dropped right after either way
    let _ = stream.shutdown().await;
    drop(stream);

    let reply = Reply { bytes };
    info!(
        target: "smoke.transport",
        address = %address,
        sent = %exchange.payload(),
        reply = %reply.text(),
        "Reply received"
    );

    if !exchange.matches(reply.as_bytes()) {
        return Err(VerificationError::UnexpectedResponse {
            got: reply.text().into_owned(),
            want: exchange.expected().to_string(),
        });
    }

    Ok(reply)
}

async fn resolve(address: &str) -> Result<SocketAddr, VerificationError> {
    let mut addrs = lookup_host(address)
        .await
        .map_err(|e| VerificationError::AddressResolution {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

    addrs
        .next()
        .ok_or_else(|| VerificationError::AddressResolution {
            address: address.to_string(),
            reason: "no addresses found".to_string(),
        })
}

/// Read the reply. Errors are only reported when nothing was received.
async fn read_reply(
    stream: &mut TcpStream,
    exchange: &ProbeExchange,
    settings: &TransportSettings,
) -> Result<Vec<u8>, String> {
    let deadline = Instant::now()
        .checked_add(settings.read_timeout)
        .ok_or_else(|| format!("read timeout {:?} is out of range", settings.read_timeout))?;
    let mut buf = vec![0u8; MAX_REPLY_BYTES];
    let mut filled = 0;

    while let Some(rest) = buf.get_mut(filled..).filter(|rest| !rest.is_empty()) {
        let outcome = timeout_at(deadline, stream.read(rest)).await;

        let n = match outcome {
            Ok(Ok(0)) if filled == 0 => {
                return Err("connection closed before any reply".to_string())
            }
            Ok(Err(e)) if filled == 0 => return Err(e.to_string()),
            Err(_) if filled == 0 => {
                return Err(format!("no reply within {:?}", settings.read_timeout))
            }
            Ok(Ok(n)) if n > 0 => n,
            // Partial reply followed by close, error or timeout: judge what arrived
            _ => break,
        };
        filled += n;

        let received = buf.get(..filled).unwrap_or_default();
        match settings.read_strategy {
            ReadStrategy::SingleRead => break,
            ReadStrategy::Accumulate if exchange.matches(received) => break,
            ReadStrategy::Accumulate => {}
        }
    }

    buf.truncate(filled);
    Ok(buf)
}
