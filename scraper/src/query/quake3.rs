//! Quake3-style text status protocol
//!
//! Requests are `FF FF FF FF get<kind>\n`. Replies carry the same 4-byte
//! header followed by newline-separated text: the response name, a
//! backslash-delimited info string, then one `<score> <ping> "<name>"` line
//! per connected player.

use super::transport::UdpTransport;
use super::{settle, QueryCodec};
use crate::error::QueryError;
use log::debug;
use shared::{Alias, QueryResultBundle, Round, Score, ServerMetadata};

pub const HEADER: [u8; 4] = [0xFF; 4];

/// Out-of-band `get<kind>` request.
pub fn build_request(kind: &str) -> Vec<u8> {
    let mut request = HEADER.to_vec();
    request.extend_from_slice(format!("get{}\n", kind).as_bytes());
    request
}

/// Splits `\key\value\key\value` into ordered pairs.
///
/// A dangling key without a value gets an empty value.
pub fn parse_info_string(text: &str) -> Vec<(String, String)> {
    let trimmed = text.strip_prefix('\\').unwrap_or(text);
    if trimmed.is_empty() {
        return Vec::new();
    }

    let parts: Vec<&str> = trimmed.split('\\').collect();
    parts
        .chunks(2)
        .map(|pair| {
            let value = pair.get(1).copied().unwrap_or_default();
            (pair[0].to_string(), value.to_string())
        })
        .collect()
}

fn parse_player_line(line: &str) -> Option<(String, f32)> {
    let score = line.split_whitespace().next()?.parse::<f32>().ok()?;

    let name = match (line.find('"'), line.rfind('"')) {
        (Some(open), Some(close)) if close > open => &line[open + 1..close],
        _ => line.split_whitespace().last()?,
    };
    Some((name.to_string(), score))
}

/// Decodes a `<kind>Response` with its info string and player lines.
pub fn parse_response(kind: &str, data: &[u8]) -> Result<QueryResultBundle, QueryError> {
    let body = data.strip_prefix(&HEADER[..]).ok_or(QueryError::BadHeader)?;
    let text = String::from_utf8_lossy(body);
    let text = text.trim_end_matches('\0');

    let lines: Vec<&str> = text.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    if lines.len() < 2 {
        return Err(QueryError::Malformed(format!(
            "{} response has {} line(s)",
            kind,
            lines.len()
        )));
    }

    let expected = format!("{}Response", kind);
    if lines[0] != expected {
        return Err(QueryError::BadResponseName {
            expected,
            actual: lines[0].to_string(),
        });
    }

    let mut bundle = QueryResultBundle::default();
    let mut metadata = ServerMetadata::default();
    for (key, value) in parse_info_string(lines[1]) {
        match key.as_str() {
            "sv_hostname" => metadata.server_name = Some(value.clone()),
            "mapname" => bundle.round = Some(Round::with_map(&value)),
            _ => {}
        }
        metadata.insert(&key, value);
    }
    bundle.server_metadata = Some(metadata);

    for line in lines[2..].iter().filter(|l| !l.trim().is_empty()) {
        match parse_player_line(line) {
            Some((name, score)) => {
                let alias = Alias::named(&name);
                bundle.scores.push(Score::new(alias.clone(), score));
                bundle.players.push(alias);
            }
            None => debug!("Skipping unparsable player line '{}'", line),
        }
    }

    Ok(bundle)
}

pub struct Quake3Codec {
    transport: UdpTransport,
}

impl Quake3Codec {
    pub fn new(transport: UdpTransport) -> Self {
        Self { transport }
    }

    /// Resolves `addr` and connects a codec to it.
    pub async fn connect(addr: &str) -> Result<Self, QueryError> {
        Ok(Self::new(UdpTransport::connect(addr).await?))
    }

    async fn fetch(&self, kind: &str) -> Result<Option<QueryResultBundle>, QueryError> {
        match self.transport.exchange(&build_request(kind)).await? {
            Some(reply) => parse_response(kind, &reply).map(Some),
            None => Ok(None),
        }
    }
}

impl QueryCodec for Quake3Codec {
    async fn query(&mut self, kind: &str) -> Option<QueryResultBundle> {
        settle("quake3", kind, self.fetch(kind).await)
    }
}
