//! Remote console client for Battlefield 1942 style servers
//!
//! The connection is a plain TCP stream. On connect the server sends a 10-byte
//! XOR key; the client answers with the username and password, each XORed
//! with the key and framed as `[i32 length][bytes][NUL]`, and the server
//! replies with a single byte that is `1` on success.
//!
//! Commands are sent as `[i32 2]["ConsoleMessage 0"]["<command>\r"]` using the
//! same string framing without obfuscation. The reply is an `i32` block size
//! followed by one framed string.
//!
//! Every failure drops the connection. The next command performs a fresh
//! handshake, so callers never have to manage reconnects.

use crate::error::RconError;
use log::{debug, error, info};
use shared::wire::{latin1_decode, latin1_encode, put_i32_le, put_prefixed_string};
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};

pub const KEY_LEN: usize = 10;
const COMMAND_OPCODE: i32 = 2;
const COMMAND_CHANNEL: &str = "ConsoleMessage 0";
const LOGIN_ACCEPTED: u8 = 1;
/// Upper bound on a single response string
const MAX_RESPONSE_LEN: i32 = 1 << 20;

/// XORs `data` with a repeating `key`; an empty key leaves the data as is.
pub fn xor_encode(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

/// Username and password frames, obfuscated with `key`.
pub fn encode_login(user: &str, password: &str, key: &[u8; KEY_LEN]) -> Vec<u8> {
    let mut frame = Vec::new();
    for credential in [user, password] {
        let encoded = xor_encode(&latin1_encode(credential), key);
        put_prefixed_string(&mut frame, &encoded);
    }
    frame
}

pub fn encode_command(command: &str) -> Vec<u8> {
    let mut frame = Vec::new();
    put_i32_le(&mut frame, COMMAND_OPCODE);
    put_prefixed_string(&mut frame, &latin1_encode(COMMAND_CHANNEL));
    put_prefixed_string(&mut frame, &latin1_encode(&format!("{}\r", command)));
    frame
}

/// Runs the key exchange and login on a freshly opened stream.
pub async fn login<S>(stream: &mut S, user: &str, password: &str) -> Result<(), RconError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut key = [0u8; KEY_LEN];
    let mut filled = 0;
    while filled < KEY_LEN {
        let n = stream.read(&mut key[filled..]).await?;
        if n == 0 {
            return Err(RconError::ShortKey(filled));
        }
        filled += n;
    }

    stream.write_all(&encode_login(user, password, &key)).await?;
    stream.flush().await?;

    match stream.read_u8().await? {
        LOGIN_ACCEPTED => Ok(()),
        other => Err(RconError::LoginFailed(other)),
    }
}

async fn read_string<S>(stream: &mut S) -> Result<String, RconError>
where
    S: AsyncRead + Unpin,
{
    let size = stream.read_i32_le().await?;
    if !(0..=MAX_RESPONSE_LEN).contains(&size) {
        return Err(RconError::BadLength(size));
    }

    let mut bytes = vec![0u8; size as usize];
    stream.read_exact(&mut bytes).await?;
    if bytes.last() == Some(&0) {
        bytes.pop();
    }
    Ok(latin1_decode(&bytes))
}

/// Sends one command on an authenticated stream and reads the reply.
pub async fn exchange_command<S>(stream: &mut S, command: &str) -> Result<String, RconError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_command(command)).await?;
    stream.flush().await?;

    // Block size, redundant with the string length
    let _ = stream.read_i32_le().await?;
    read_string(stream).await
}

async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> Result<T, RconError>
where
    F: Future<Output = Result<T, RconError>>,
{
    match deadline {
        Some(limit) => timeout(limit, fut).await.map_err(|_| RconError::Timeout)?,
        None => fut.await,
    }
}

pub struct RconClient {
    addr: String,
    user: String,
    password: String,
    stream: Option<TcpStream>,
    timeout: Option<Duration>,
}

impl RconClient {
    pub fn new(addr: &str, user: &str, password: &str) -> Self {
        Self {
            addr: addr.to_string(),
            user: user.to_string(),
            password: password.to_string(),
            stream: None,
            timeout: None,
        }
    }

    /// Bounds connect, handshake and each command exchange.
    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Sends a console command, connecting first if needed.
    ///
    /// Returns `None` on any failure; the connection is closed and the next
    /// call starts over with a new handshake.
    pub async fn send_command(&mut self, command: &str) -> Option<String> {
        match self.try_send(command).await {
            Ok(response) => Some(response),
            Err(e) => {
                match &e {
                    RconError::Io(io) if io.kind() == std::io::ErrorKind::UnexpectedEof => {
                        debug!("RCON connection to {} closed by server", self.addr);
                    }
                    _ => error!("RCON command to {} failed: {}", self.addr, e),
                }
                None
            }
        }
    }

    /// Closes the connection if one is open.
    pub async fn disconnect(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                debug!("Error closing RCON connection: {}", e);
            }
        }
    }

    async fn try_send(&mut self, command: &str) -> Result<String, RconError> {
        let mut stream = match self.stream.take() {
            Some(stream) => stream,
            None => self.connect().await?,
        };

        // On error the stream is dropped here, closing the socket
        let response = with_deadline(self.timeout, exchange_command(&mut stream, command)).await?;
        self.stream = Some(stream);
        Ok(response)
    }

    async fn connect(&self) -> Result<TcpStream, RconError> {
        let handshake = async {
            let mut stream = TcpStream::connect(&self.addr).await?;
            login(&mut stream, &self.user, &self.password).await?;
            Ok::<_, RconError>(stream)
        };
        let stream = with_deadline(self.timeout, handshake).await?;
        info!("RCON connection to {} successful", self.addr);
        Ok(stream)
    }
}
