//! idTech4 (Enemy Territory: Quake Wars style) binary status protocol
//!
//! Requests carry an 8-byte challenge that the server must echo back; a reply
//! with a different challenge is rejected so stale or spoofed datagrams never
//! reach the listeners.

use super::transport::UdpTransport;
use super::{settle, QueryCodec};
use crate::error::QueryError;
use log::warn;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared::wire::ByteReader;
use shared::{Alias, QueryResultBundle, Round, Score, ServerMetadata, Team};
use std::collections::BTreeMap;

pub const MARKER: [u8; 2] = [0xFF, 0xFF];
pub const CHALLENGE_LEN: usize = 8;
/// Player id that terminates the player table
pub const END_OF_PLAYERS: u8 = 32;
pub const EXTENDED_KIND: &str = "infoEx";

const KNOWN_VERSION: (i16, i16) = (21, 10);

/// Statistic reported as a player's score for extended info queries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
pub enum ScoreMode {
    Experience,
    #[default]
    Kills,
    KillsMinusDeaths,
}

impl ScoreMode {
    /// Score for one player under this mode.
    pub fn score(self, experience: f32, kills: i32, deaths: i32) -> f32 {
        match self {
            ScoreMode::Experience => experience,
            ScoreMode::Kills => kills as f32,
            ScoreMode::KillsMinusDeaths => (kills - deaths) as f32,
        }
    }
}

fn capitalize(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// `get<Kind>` request followed by the challenge the reply must echo.
pub fn build_request(kind: &str, challenge: &[u8; CHALLENGE_LEN]) -> Vec<u8> {
    let mut request = MARKER.to_vec();
    request.extend_from_slice(format!("get{}\0", capitalize(kind)).as_bytes());
    request.extend_from_slice(challenge);
    request
}

fn expect_bytes(reader: &mut ByteReader<'_>, expected: &[u8]) -> Result<bool, QueryError> {
    Ok(reader.read_bytes(expected.len())? == expected)
}

/// Decodes a `<kind>Response` bound to `challenge`.
///
/// Extended info replies also carry team, experience and kill counts, which
/// `score_mode` turns into one score per player.
pub fn parse_response(
    kind: &str,
    challenge: &[u8; CHALLENGE_LEN],
    score_mode: ScoreMode,
    data: &[u8],
) -> Result<QueryResultBundle, QueryError> {
    let mut reader = ByteReader::new(data);

    if !expect_bytes(&mut reader, &MARKER)? {
        return Err(QueryError::BadHeader);
    }

    let expected_name = format!("{}Response", kind);
    let name = reader.read_cstring()?;
    if name != expected_name {
        return Err(QueryError::BadResponseName {
            expected: expected_name,
            actual: name,
        });
    }

    if !expect_bytes(&mut reader, challenge)? {
        return Err(QueryError::ChallengeMismatch);
    }

    let version = (reader.read_i16_be()?, reader.read_i16_be()?);
    if version != KNOWN_VERSION {
        warn!(
            "Unfamiliar protocol version {}.{}, parsing anyway",
            version.0, version.1
        );
    }
    // Payload size
    reader.skip(4)?;

    let mut bundle = QueryResultBundle::default();
    let mut metadata = ServerMetadata::default();
    // Pairs are always read whole; the block ends with an empty key or value
    loop {
        let key = reader.read_cstring()?;
        let value = reader.read_cstring()?;
        if key.is_empty() {
            break;
        }
        let last = value.is_empty();
        match key.as_str() {
            "si_name" => metadata.server_name = Some(value),
            "si_map" => {
                bundle.round = Some(Round::with_map(&value));
                metadata.insert(&key, value);
            }
            _ => metadata.insert(&key, value),
        }
        if last {
            break;
        }
    }
    bundle.server_metadata = Some(metadata);

    let mut players: BTreeMap<u8, Alias> = BTreeMap::new();
    loop {
        let id = reader.read_u8()?;
        if id == END_OF_PLAYERS {
            break;
        }
        // Ping and rate
        reader.skip(2)?;

        let mut name = reader.read_cstring()?;
        let tag_is_suffix = reader.read_u8()? == 1;
        let clan_tag = reader.read_cstring()?;
        let is_bot = reader.read_u8()? == 1;

        if !clan_tag.is_empty() {
            name = if tag_is_suffix {
                format!("{} {}", name, clan_tag)
            } else {
                format!("{} {}", clan_tag, name)
            };
        }

        let mut alias = Alias::new(&id.to_string(), &name);
        alias.bot = Some(is_bot);
        players.insert(id, alias);
    }

    if kind == EXTENDED_KIND {
        // OS mask, ranked flag, time left and game state
        reader.skip(10)?;
        let server_type = reader.read_u8()?;
        reader.skip(if server_type == 0 { 1 } else { 8 })?;

        for _ in 0..players.len() {
            let id = reader.read_u8()?;
            let experience = reader.read_f32_le()?;
            let team = reader.read_cstring()?;
            let kills = reader.read_i32_le()?;
            let deaths = reader.read_i32_le()?;

            if let Some(alias) = players.get_mut(&id) {
                if !team.is_empty() {
                    alias.team = Some(Team::new(&team));
                }
                bundle.scores.push(Score::new(
                    alias.clone(),
                    score_mode.score(experience, kills, deaths),
                ));
            }
        }
    }

    bundle.players = players.into_values().collect();
    Ok(bundle)
}

pub struct IdTech4Codec {
    transport: UdpTransport,
    score_mode: ScoreMode,
}

impl IdTech4Codec {
    pub fn new(transport: UdpTransport) -> Self {
        Self {
            transport,
            score_mode: ScoreMode::default(),
        }
    }

    /// Connects a codec scoring players by kills.
    pub async fn connect(addr: &str) -> Result<Self, QueryError> {
        Ok(Self::new(UdpTransport::connect(addr).await?))
    }

    pub fn with_score_mode(mut self, score_mode: ScoreMode) -> Self {
        self.score_mode = score_mode;
        self
    }

    pub fn score_mode(&self) -> ScoreMode {
        self.score_mode
    }

    async fn fetch(&self, kind: &str) -> Result<Option<QueryResultBundle>, QueryError> {
        let mut challenge = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut challenge);

        match self.transport.exchange(&build_request(kind, &challenge)).await? {
            Some(reply) => parse_response(kind, &challenge, self.score_mode, &reply).map(Some),
            None => Ok(None),
        }
    }
}

impl QueryCodec for IdTech4Codec {
    async fn query(&mut self, kind: &str) -> Option<QueryResultBundle> {
        settle("idtech4", kind, self.fetch(kind).await)
    }
}
