//! Shared data model for the scoreboard feed
//!
//! Every component of the workspace speaks in terms of these records: the
//! protocol codecs produce them, the data manager merges them, and the update
//! sinks serialize them. All records are plain values; cloning one yields an
//! independent snapshot.

pub mod wire;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Separator between a round id and a raw player id inside the data manager.
pub const NAMESPACE_SEPARATOR: char = ':';

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Person {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Game {
    pub name: Option<String>,
    pub game_type: Option<String>,
    pub mod_name: Option<String>,
}

impl Game {
    pub fn named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct Team {
    pub name: String,
    pub score: Option<f32>,
}

impl Team {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            score: None,
        }
    }
}

/// A player as seen by one game server during one round
///
/// Empty `id`/`name` and `None` fields mean "not supplied" when an alias is
/// handed to the data manager as a partial update.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Alias {
    pub id: String,
    pub name: String,
    pub bot: Option<bool>,
    pub present: bool,
    pub team: Option<Team>,
    pub person: Option<Person>,
    pub game: Option<Game>,
}

impl Default for Alias {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            bot: None,
            present: true,
            team: None,
            person: None,
            game: None,
        }
    }
}

impl Alias {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Alias identified only by its display name.
    pub fn named(name: &str) -> Self {
        Self::new("", name)
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }

    pub fn has_name(&self) -> bool {
        !self.name.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Round {
    pub id: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub game: Option<Game>,
    pub map: Option<String>,
}

impl Round {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            start: None,
            end: None,
            game: None,
            map: None,
        }
    }

    /// Round carrying only a map name; the id is left for the receiver to keep.
    pub fn with_map(map: &str) -> Self {
        Self {
            map: Some(map.to_string()),
            ..Self::new("")
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Score {
    pub alias: Alias,
    pub score: f32,
}

impl Score {
    pub fn new(alias: Alias, score: f32) -> Self {
        Self { alias, score }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct ServerMetadata {
    pub server_name: Option<String>,
    pub metadata: HashMap<String, String>,
}

impl ServerMetadata {
    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Normalized output of one poll of one query kind
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct QueryResultBundle {
    pub server_metadata: Option<ServerMetadata>,
    pub round: Option<Round>,
    pub players: Vec<Alias>,
    pub scores: Vec<Score>,
    /// Combined response text, kept by text protocols that reassemble fragments
    pub raw_response: Option<String>,
}

impl QueryResultBundle {
    pub fn is_empty(&self) -> bool {
        self.server_metadata.is_none()
            && self.round.is_none()
            && self.players.is_empty()
            && self.scores.is_empty()
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum UpdateContent {
    ServerMetadata(ServerMetadata),
    Round(Round),
    Alias(Alias),
    Score(Score),
    Team(Team),
}

/// Change event published to the downstream sink
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct UpdateMessage {
    pub id: Option<String>,
    /// Id of the round the change belongs to
    pub session_id: Option<String>,
    pub content: UpdateContent,
}

impl UpdateMessage {
    pub fn new(id: Option<String>, session_id: Option<String>, content: UpdateContent) -> Self {
        Self {
            id,
            session_id,
            content,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Short tag naming the content variant, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self.content {
            UpdateContent::ServerMetadata(_) => "serverMetadata",
            UpdateContent::Round(_) => "round",
            UpdateContent::Alias(_) => "alias",
            UpdateContent::Score(_) => "score",
            UpdateContent::Team(_) => "team",
        }
    }
}
