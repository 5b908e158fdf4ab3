//! GameSpy backslash key/value status protocol
//!
//! A single `\<kind>\` request may be answered by several datagrams that can
//! arrive in any order. Each fragment carries a `\queryid\<n>\` tag; fragments
//! are sorted by that tag, compared as a number so `29.1` sorts before `29.2`,
//! and concatenated before the combined `\key\value` stream is interpreted.

use super::quake3::parse_info_string;
use super::transport::UdpTransport;
use super::{settle, QueryCodec};
use crate::error::QueryError;
use log::debug;
use shared::wire::latin1_decode;
use shared::{Alias, QueryResultBundle, Round, Score, ServerMetadata, Team};
use std::collections::{BTreeMap, HashMap};

const QUERY_ID_TAG: &str = "\\queryid\\";

/// Status request for `kind`, e.g. `\info\`.
pub fn build_request(kind: &str) -> Vec<u8> {
    format!("\\{}\\", kind).into_bytes()
}

/// Numeric value of a fragment's `\queryid\` tag, if it has one.
pub fn fragment_order(fragment: &str) -> Option<f64> {
    let start = fragment.find(QUERY_ID_TAG)? + QUERY_ID_TAG.len();
    let rest = &fragment[start..];
    let end = rest.find('\\').unwrap_or(rest.len());
    rest[..end].trim().parse::<f64>().ok()
}

/// Orders fragments by query id and joins them into one response.
///
/// Untagged fragments keep their arrival order after all tagged ones.
pub fn reassemble(fragments: &[Vec<u8>]) -> String {
    let mut ordered: Vec<(f64, String)> = fragments
        .iter()
        .map(|bytes| {
            let text = latin1_decode(bytes);
            (fragment_order(&text).unwrap_or(f64::INFINITY), text)
        })
        .collect();
    ordered.sort_by(|a, b| a.0.total_cmp(&b.0));

    ordered.into_iter().map(|(_, text)| text).collect()
}

/// Turns the combined key/value pairs into a result bundle
pub trait ResponseSplitter: Send + Sync {
    fn split(&self, kind: &str, pairs: &[(String, String)]) -> QueryResultBundle;
}

/// Handles the keys common to GameSpy titles
///
/// `hostname` names the server, `mapname` the round's map and every
/// `<field>_<n>` key describes player `n`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardSplitter;

fn player_key(key: &str) -> Option<(&str, u32)> {
    let (field, index) = key.rsplit_once('_')?;
    if field.is_empty() || index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((field, index.parse().ok()?))
}

impl ResponseSplitter for StandardSplitter {
    fn split(&self, _kind: &str, pairs: &[(String, String)]) -> QueryResultBundle {
        let mut bundle = QueryResultBundle::default();
        let mut metadata = ServerMetadata::default();
        let mut players: BTreeMap<u32, HashMap<&str, &str>> = BTreeMap::new();

        for (key, value) in pairs {
            if key.is_empty() || key == "queryid" || key == "final" {
                continue;
            }
            if let Some((field, index)) = player_key(key) {
                players.entry(index).or_default().insert(field, value);
                continue;
            }
            match key.as_str() {
                "hostname" => metadata.server_name = Some(value.clone()),
                "mapname" => bundle.round = Some(Round::with_map(value)),
                _ => {}
            }
            metadata.insert(key, value.clone());
        }

        for (index, fields) in players {
            let name = fields
                .get("player")
                .or_else(|| fields.get("playername"))
                .copied()
                .unwrap_or_default();
            let mut alias = Alias::new(&index.to_string(), name);
            if let Some(team) = fields.get("team") {
                alias.team = Some(Team::new(team));
            }

            let score = fields
                .get("frags")
                .or_else(|| fields.get("score"))
                .and_then(|s| s.trim().parse::<f32>().ok());
            if let Some(score) = score {
                bundle.scores.push(Score::new(alias.clone(), score));
            }
            bundle.players.push(alias);
        }

        bundle.server_metadata = Some(metadata);
        bundle
    }
}

/// Reassembles `fragments` and splits the combined pairs into a bundle.
pub fn parse_response(
    kind: &str,
    fragments: &[Vec<u8>],
    splitter: &dyn ResponseSplitter,
) -> Result<QueryResultBundle, QueryError> {
    let combined = reassemble(fragments);
    if !combined.starts_with('\\') {
        return Err(QueryError::Malformed(format!(
            "{} response does not start with a backslash",
            kind
        )));
    }

    let pairs = parse_info_string(&combined);
    let mut bundle = splitter.split(kind, &pairs);
    bundle.raw_response = Some(combined);
    Ok(bundle)
}

pub struct GameSpyCodec {
    transport: UdpTransport,
    splitter: Box<dyn ResponseSplitter>,
}

impl GameSpyCodec {
    pub fn new(transport: UdpTransport) -> Self {
        Self {
            transport,
            splitter: Box::new(StandardSplitter),
        }
    }

    /// Connects a codec using the standard key interpretation.
    pub async fn connect(addr: &str) -> Result<Self, QueryError> {
        Ok(Self::new(UdpTransport::connect(addr).await?))
    }

    /// Replaces the key interpretation for titles with their own conventions.
    pub fn with_splitter(mut self, splitter: impl ResponseSplitter + 'static) -> Self {
        self.splitter = Box::new(splitter);
        self
    }

    async fn fetch(&self, kind: &str) -> Result<Option<QueryResultBundle>, QueryError> {
        let fragments = self.transport.collect(&build_request(kind)).await?;
        if fragments.is_empty() {
            return Ok(None);
        }
        debug!("Reassembling {} fragment(s) for {}", fragments.len(), kind);
        parse_response(kind, &fragments, self.splitter.as_ref()).map(Some)
    }
}

impl QueryCodec for GameSpyCodec {
    async fn query(&mut self, kind: &str) -> Option<QueryResultBundle> {
        settle("gamespy", kind, self.fetch(kind).await)
    }
}
