//! Connected UDP socket shared by the status-query codecs

use crate::error::QueryError;
use log::debug;
use std::net::SocketAddr;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout, Duration, Instant};

/// Receive deadline for the first datagram of a reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Deadline for each follow-up datagram of a multi-packet reply
pub const DEFAULT_FOLLOW_UP_TIMEOUT: Duration = Duration::from_millis(10);

/// Upper bound on datagrams gathered for one reply
pub const MAX_FRAGMENTS: usize = 64;

const MAX_DATAGRAM: usize = 65_536;

pub struct UdpTransport {
    socket: UdpSocket,
    timeout: Duration,
    follow_up_timeout: Duration,
}

impl UdpTransport {
    /// Resolves `addr` and connects an ephemeral socket of the matching family.
    pub async fn connect(addr: &str) -> Result<Self, QueryError> {
        let target = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| QueryError::Malformed(format!("no address for {}", addr)))?;
        let bind_addr = if target.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(target).await?;
        debug!("Query socket {} connected to {}", socket.local_addr()?, target);

        Ok(Self {
            socket,
            timeout: DEFAULT_TIMEOUT,
            follow_up_timeout: DEFAULT_FOLLOW_UP_TIMEOUT,
        })
    }

    pub fn with_timeouts(mut self, timeout: Duration, follow_up_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.follow_up_timeout = follow_up_timeout;
        self
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, QueryError> {
        Ok(self.socket.peer_addr()?)
    }

    /// Sends `request` and waits for one reply datagram.
    ///
    /// Returns `Ok(None)` when nothing arrives before the receive deadline.
    pub async fn exchange(&self, request: &[u8]) -> Result<Option<Vec<u8>>, QueryError> {
        self.discard_stale();
        self.socket.send(request).await?;
        self.receive(self.timeout).await
    }

    /// Sends `request` and gathers every datagram of the reply.
    ///
    /// Waits up to the full deadline for the first datagram, then keeps reading
    /// until the line stays quiet for the follow-up deadline. Gathering stops
    /// after [`MAX_FRAGMENTS`] datagrams or twice the receive deadline, so a
    /// chatty server cannot hold the poll. An empty vector means the server
    /// never answered.
    pub async fn collect(&self, request: &[u8]) -> Result<Vec<Vec<u8>>, QueryError> {
        self.discard_stale();
        self.socket.send(request).await?;

        let cutoff = Instant::now() + self.timeout * 2;
        let mut datagrams = Vec::new();
        let mut deadline = self.timeout;
        while datagrams.len() < MAX_FRAGMENTS {
            let remaining = cutoff.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(
                    "Reply still arriving after {:?}, using {} datagram(s)",
                    self.timeout * 2,
                    datagrams.len()
                );
                break;
            }
            match self.receive(deadline.min(remaining)).await? {
                Some(datagram) => datagrams.push(datagram),
                None => break,
            }
            deadline = self.follow_up_timeout;
        }
        Ok(datagrams)
    }

    async fn receive(&self, deadline: Duration) -> Result<Option<Vec<u8>>, QueryError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        match timeout(deadline, self.socket.recv(&mut buf)).await {
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(Some(buf))
            }
            Ok(Err(e)) => Err(QueryError::Io(e)),
            Err(_) => Ok(None),
        }
    }

    /// Drops late replies to an earlier request still queued on the socket.
    fn discard_stale(&self) {
        let mut buf = [0u8; 2048];
        while let Ok(len) = self.socket.try_recv(&mut buf) {
            debug!("Discarding {} stale bytes", len);
        }
    }
}
