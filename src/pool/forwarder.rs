//! Moving client connections to workers.
//!
//! The forwarder never parses HTTP. It picks nothing itself either: the
//! event loop chooses the worker, and this module only copies bytes, holds
//! connections while no worker is free, and turns them away.
//!
//! Each forwarded connection starts with a PROXY protocol v1 line so the
//! worker knows the client address:
//!
//! ```text
//! PROXY TCP4 203.0.113.9 127.0.0.1 51234 5500\r\n
//! PROXY UNKNOWN\r\n
//! ```

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

/// Longest PROXY v1 line, CRLF included.
pub const MAX_PREAMBLE_BYTES: usize = 107;

const COPY_BUFFER_BYTES: usize = 8 * 1024;

/// Response sent when no worker can take a connection.
pub const SERVICE_UNAVAILABLE: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Content-Type: text/plain\r\n\
Content-Length: 20\r\n\
Connection: close\r\n\
\r\n\
No worker available\n";

/// What to do with a connection that arrives while every worker is busy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Answer 503 immediately.
    Reject,
    /// Hold up to `capacity` connections, each for at most `timeout`.
    Queue { capacity: usize, timeout: Duration },
}

/// FIFO of connections waiting for a worker, each with a deadline.
#[derive(Debug)]
pub struct PendingQueue<T> {
    items: VecDeque<(Instant, T)>,
    capacity: usize,
}

impl<T> PendingQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
        }
    }

    /// Enqueue `item` until `deadline`. Hands it back if the queue is full.
    pub fn push(&mut self, item: T, deadline: Instant) -> Result<(), T> {
        if self.items.len() >= self.capacity {
            return Err(item);
        }
        self.items.push_back((deadline, item));
        Ok(())
    }

    /// Oldest waiting item that has not expired by `now`.
    ///
    /// Expired items in front of it are returned separately so the caller
    /// can reject them.
    pub fn pop_live(&mut self, now: Instant) -> (Option<T>, Vec<T>) {
        let mut expired = Vec::new();
        while let Some((deadline, item)) = self.items.pop_front() {
            if deadline <= now {
                expired.push(item);
            } else {
                return (Some(item), expired);
            }
        }
        (None, expired)
    }

    /// Remove every item whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<T> {
        let mut expired = Vec::new();
        let mut kept = VecDeque::with_capacity(self.items.len());
        for (deadline, item) in self.items.drain(..) {
            if deadline <= now {
                expired.push(item);
            } else {
                kept.push_back((deadline, item));
            }
        }
        self.items = kept;
        expired
    }

    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).map(|(_, item)| item).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// PROXY v1 line announcing `peer` as the client of a connection accepted
/// on `local`.
pub fn preamble(peer: Option<SocketAddr>, local: Option<SocketAddr>) -> String {
    match (peer, local) {
        (Some(SocketAddr::V4(src)), Some(SocketAddr::V4(dst))) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        ),
        (Some(SocketAddr::V6(src)), Some(SocketAddr::V6(dst))) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            src.ip(),
            dst.ip(),
            src.port(),
            dst.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    }
}

/// Parse a PROXY v1 line. `Some(None)` is a valid line with no address.
pub fn parse_preamble(line: &str) -> Option<Option<SocketAddr>> {
    let line = line.strip_suffix('\n')?;
    let line = line.strip_suffix('\r').unwrap_or(line);
    let mut fields = line.split(' ');
    if fields.next()? != "PROXY" {
        return None;
    }
    match fields.next()? {
        "UNKNOWN" => Some(None),
        "TCP4" | "TCP6" => {
            let ip: IpAddr = fields.next()?.parse().ok()?;
            let _destination = fields.next()?;
            let port: u16 = fields.next()?.parse().ok()?;
            Some(Some(SocketAddr::new(ip, port)))
        }
        _ => None,
    }
}

/// Consume the PROXY line at the start of `reader` and return the client
/// address it carries. Nothing past the line is read.
pub async fn read_preamble<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<SocketAddr>> {
    let mut line = Vec::with_capacity(MAX_PREAMBLE_BYTES);
    (&mut *reader)
        .take(MAX_PREAMBLE_BYTES as u64)
        .read_until(b'\n', &mut line)
        .await?;
    std::str::from_utf8(&line)
        .ok()
        .and_then(parse_preamble)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "missing PROXY preamble"))
}

/// Forward `client` to the worker listening on `socket`.
///
/// The exchange ends when the worker closes its side: whatever the client
/// still holds open is shut down. A client that half-closes first has the
/// close passed on, and the worker's answer is still delivered. Returns
/// bytes sent to and received from the worker, preamble excluded.
pub async fn proxy(mut client: TcpStream, socket: &Path) -> io::Result<(u64, u64)> {
    let mut upstream = UnixStream::connect(socket).await?;
    let header = preamble(client.peer_addr().ok(), client.local_addr().ok());
    upstream.write_all(header.as_bytes()).await?;

    let (mut client_read, mut client_write) = client.split();
    let (mut upstream_read, mut upstream_write) = upstream.split();
    let sent = AtomicU64::new(0);

    let request = async {
        let mut buf = vec![0u8; COPY_BUFFER_BYTES];
        loop {
            let n = client_read.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            upstream_write.write_all(&buf[..n]).await?;
            sent.fetch_add(n as u64, Ordering::Relaxed);
        }
        let _ = upstream_write.shutdown().await;
        Ok::<_, io::Error>(())
    };
    let response = async {
        let received = tokio::io::copy(&mut upstream_read, &mut client_write).await?;
        let _ = client_write.shutdown().await;
        Ok::<_, io::Error>(received)
    };
    tokio::pin!(request, response);

    let received = tokio::select! {
        received = &mut response => received?,
        forwarded = &mut request => {
            forwarded?;
            response.await?
        }
    };
    Ok((sent.load(Ordering::Relaxed), received))
}

/// Answer with `503 Service Unavailable` and close.
pub async fn reject<S: AsyncWrite + Unpin>(mut stream: S) {
    if let Err(e) = stream.write_all(SERVICE_UNAVAILABLE).await {
        tracing::debug!(error = %e, "Failed to send 503");
    }
    let _ = stream.shutdown().await;
}
