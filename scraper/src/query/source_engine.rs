//! Source-engine (A2S) binary status protocol
//!
//! Every datagram starts with `FF FF FF FF` and a one-byte request or reply
//! code. Three query kinds are supported:
//!
//! | kind      | request | reply |
//! |-----------|---------|-------|
//! | `info`    | `'T'`   | `'I'` |
//! | `rules`   | `'V'`   | `'E'` |
//! | `players` | `'U'`   | `'D'` |
//!
//! Rules and players are challenge-protected: the server may answer with an
//! `'A'` reply carrying a 4-byte challenge which must be sent back with the
//! real request. Challenges are cached per request code.

use super::transport::UdpTransport;
use super::{settle, QueryCodec};
use crate::error::QueryError;
use log::{debug, warn};
use shared::wire::ByteReader;
use shared::{Alias, QueryResultBundle, Round, Score, ServerMetadata};

pub const HEADER: [u8; 4] = [0xFF; 4];

pub const INFO_REQUEST: u8 = b'T';
pub const INFO_REPLY: u8 = b'I';
pub const RULES_REQUEST: u8 = b'V';
pub const RULES_REPLY: u8 = b'E';
pub const PLAYERS_REQUEST: u8 = b'U';
pub const PLAYERS_REPLY: u8 = b'D';
pub const CHALLENGE_REPLY: u8 = b'A';

const INFO_PAYLOAD: &[u8] = b"Source Engine Query\0";
const NO_CHALLENGE: [u8; 4] = [0xFF; 4];
const KNOWN_PROTOCOLS: [u8; 2] = [3, 17];

/// Out-of-band request with `code` and its argument bytes.
pub fn build_request(code: u8, extra: &[u8]) -> Vec<u8> {
    let mut request = Vec::with_capacity(5 + extra.len());
    request.extend_from_slice(&HEADER);
    request.push(code);
    request.extend_from_slice(extra);
    request
}

/// Splits a reply into its code byte and payload, or `None` if the header is wrong.
pub fn split_reply(data: &[u8]) -> Option<(u8, &[u8])> {
    let body = data.strip_prefix(&HEADER[..])?;
    let (&code, payload) = body.split_first()?;
    Some((code, payload))
}

fn flag(value: u8) -> String {
    (value != 0).to_string()
}

/// Decodes an `I` info reply into server metadata and the current map.
pub fn parse_info(payload: &[u8]) -> Result<QueryResultBundle, QueryError> {
    let mut reader = ByteReader::new(payload);
    let mut metadata = ServerMetadata::default();

    let protocol = reader.read_u8()?;
    if !KNOWN_PROTOCOLS.contains(&protocol) {
        warn!("Unfamiliar protocol version {}, parsing anyway", protocol);
    }
    metadata.insert("protocolVersion", protocol.to_string());

    metadata.server_name = Some(reader.read_cstring()?);
    let map = reader.read_cstring()?;
    metadata.insert("mapName", map.clone());
    metadata.insert("gameDirectory", reader.read_cstring()?);
    metadata.insert("gameDescription", reader.read_cstring()?);
    metadata.insert("steamApplicationID", reader.read_i32_le()?.to_string());
    metadata.insert("playerCount", reader.read_u8()?.to_string());
    metadata.insert("maxPlayers", reader.read_u8()?.to_string());
    metadata.insert("botCount", reader.read_u8()?.to_string());
    metadata.insert("serverType", (reader.read_u8()? as char).to_string());
    metadata.insert("serverOS", (reader.read_u8()? as char).to_string());
    metadata.insert("passworded", flag(reader.read_u8()?));
    metadata.insert("secureServer", flag(reader.read_u8()?));

    Ok(QueryResultBundle {
        server_metadata: Some(metadata),
        round: Some(Round::with_map(&map)),
        ..QueryResultBundle::default()
    })
}

/// Decodes an `E` rules reply; every rule becomes a metadata entry.
pub fn parse_rules(payload: &[u8]) -> Result<QueryResultBundle, QueryError> {
    let mut reader = ByteReader::new(payload);
    let mut metadata = ServerMetadata::default();

    let count = reader.read_i16_le()?;
    for _ in 0..count.max(0) {
        let key = reader.read_cstring()?;
        let value = reader.read_cstring()?;
        metadata.insert(&key, value);
    }

    Ok(QueryResultBundle {
        server_metadata: Some(metadata),
        ..QueryResultBundle::default()
    })
}

/// Decodes a `D` player reply.
///
/// Players carry no usable id, so they are identified by name.
pub fn parse_players(payload: &[u8]) -> Result<QueryResultBundle, QueryError> {
    let mut reader = ByteReader::new(payload);
    let mut bundle = QueryResultBundle::default();

    let count = reader.read_u8()?;
    for _ in 0..count {
        // Chunk index, zero for every player on most servers
        reader.skip(1)?;
        let name = reader.read_cstring()?;
        let score = reader.read_i32_le()?;
        // Connection time is not tracked
        reader.read_f32_le()?;

        let alias = Alias::named(&name);
        bundle.scores.push(Score::new(alias.clone(), score as f32));
        bundle.players.push(alias);
    }

    Ok(bundle)
}

pub struct SourceEngineCodec {
    transport: UdpTransport,
    players_challenge: Option<[u8; 4]>,
    rules_challenge: Option<[u8; 4]>,
}

impl SourceEngineCodec {
    pub fn new(transport: UdpTransport) -> Self {
        Self {
            transport,
            players_challenge: None,
            rules_challenge: None,
        }
    }

    /// Resolves `addr` and connects a codec with no cached challenges.
    pub async fn connect(addr: &str) -> Result<Self, QueryError> {
        Ok(Self::new(UdpTransport::connect(addr).await?))
    }

    /// Sends `code` and returns the payload of a reply carrying `expected`.
    ///
    /// Replies with a wrong header or code are dropped without error.
    async fn make_request(
        &self,
        code: u8,
        expected: u8,
        extra: &[u8],
    ) -> Result<Option<Vec<u8>>, QueryError> {
        let Some(reply) = self.transport.exchange(&build_request(code, extra)).await? else {
            return Ok(None);
        };

        match split_reply(&reply) {
            Some((actual, payload)) if actual == expected => Ok(Some(payload.to_vec())),
            Some((actual, _)) => {
                debug!(
                    "Dropping reply {:#04x} to request {:#04x}",
                    actual, code
                );
                Ok(None)
            }
            None => {
                debug!("Dropping reply with bad header to request {:#04x}", code);
                Ok(None)
            }
        }
    }

    /// Runs a challenge-protected request, refreshing the cached challenge
    /// once if the server asks for a new one.
    async fn challenged_request(
        &mut self,
        code: u8,
        expected: u8,
    ) -> Result<Option<Vec<u8>>, QueryError> {
        for _ in 0..2 {
            let challenge = self.cached_challenge(code).unwrap_or(NO_CHALLENGE);
            let Some(reply) = self
                .transport
                .exchange(&build_request(code, &challenge))
                .await?
            else {
                return Ok(None);
            };

            match split_reply(&reply) {
                Some((CHALLENGE_REPLY, payload)) => {
                    let mut reader = ByteReader::new(payload);
                    let bytes = reader.read_bytes(4)?;
                    let fresh = [bytes[0], bytes[1], bytes[2], bytes[3]];
                    debug!("Received challenge {:02x?} for {:#04x}", fresh, code);
                    self.store_challenge(code, fresh);
                }
                Some((actual, payload)) if actual == expected => {
                    return Ok(Some(payload.to_vec()));
                }
                _ => {
                    debug!("Dropping unexpected reply to request {:#04x}", code);
                    return Ok(None);
                }
            }
        }
        Ok(None)
    }

    fn cached_challenge(&self, code: u8) -> Option<[u8; 4]> {
        if code == PLAYERS_REQUEST {
            self.players_challenge
        } else {
            self.rules_challenge
        }
    }

    fn store_challenge(&mut self, code: u8, challenge: [u8; 4]) {
        if code == PLAYERS_REQUEST {
            self.players_challenge = Some(challenge);
        } else {
            self.rules_challenge = Some(challenge);
        }
    }

    async fn fetch(&mut self, kind: &str) -> Result<Option<QueryResultBundle>, QueryError> {
        match kind {
            "info" => match self.make_request(INFO_REQUEST, INFO_REPLY, INFO_PAYLOAD).await? {
                Some(payload) => parse_info(&payload).map(Some),
                None => Ok(None),
            },
            "rules" => match self.challenged_request(RULES_REQUEST, RULES_REPLY).await? {
                Some(payload) => parse_rules(&payload).map(Some),
                None => Ok(None),
            },
            "players" => match self.challenged_request(PLAYERS_REQUEST, PLAYERS_REPLY).await? {
                Some(payload) => parse_players(&payload).map(Some),
                None => Ok(None),
            },
            other => {
                warn!("Cannot query source engine server for '{}'", other);
                Ok(None)
            }
        }
    }
}

impl QueryCodec for SourceEngineCodec {
    async fn query(&mut self, kind: &str) -> Option<QueryResultBundle> {
        settle("source", kind, self.fetch(kind).await)
    }
}
