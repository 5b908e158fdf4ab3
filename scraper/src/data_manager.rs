//! Canonical scoreboard state and change detection
//!
//! The [`DataManager`] is the single store every producer writes into: query
//! clients, the RCON client and log parsers all call its `provide_*` methods
//! with partial records. Each call merges the supplied fields into the stored
//! record and, only when something observable changed, publishes an
//! [`UpdateMessage`] to the configured sink.
//!
//! ## Identity
//!
//! Player ids coming from game servers are only unique within a round, so
//! every stored id is namespaced as `<roundId>:<rawId>`. Lookups accept either
//! form. When the round id changes the namespace rotates: players are either
//! wiped (the default) or rewritten into the new namespace.
//!
//! ## Locking
//!
//! All state sits behind one mutex and every public method is one critical
//! section. The sink is called while the lock is held so the order of emitted
//! messages always matches the order of mutations.

use crate::error::MergeError;
use crate::sink::UpdateSink;
use chrono::Utc;
use log::{debug, error};
use parking_lot::Mutex;
use shared::{
    Alias, Game, QueryResultBundle, Round, Score, ServerMetadata, Team, UpdateContent,
    UpdateMessage, NAMESPACE_SEPARATOR,
};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataManagerConfig {
    /// Drop all players when a new round starts instead of carrying them over
    pub wipe_players_on_new_round: bool,
}

impl Default for DataManagerConfig {
    fn default() -> Self {
        Self {
            wipe_players_on_new_round: true,
        }
    }
}

fn fresh_round_id() -> String {
    Uuid::new_v4().to_string()
}

/// Copies `incoming` into `current` when supplied and different.
fn merge_option<T: Clone + PartialEq>(current: &mut Option<T>, incoming: &Option<T>) -> bool {
    match incoming {
        Some(value) if current.as_ref() != Some(value) => {
            *current = Some(value.clone());
            true
        }
        _ => false,
    }
}

fn merge_text(current: &mut String, incoming: &str) -> bool {
    if !incoming.is_empty() && current != incoming {
        *current = incoming.to_string();
        true
    } else {
        false
    }
}

struct State {
    round: Round,
    prefix: String,
    game: Option<Game>,
    players: HashMap<String, Alias>,
    teams: HashMap<String, Team>,
    scores: Vec<Score>,
    server_metadata: ServerMetadata,
    wipe_players: bool,
}

impl State {
    fn new(config: DataManagerConfig) -> Self {
        Self {
            round: Round::new(""),
            prefix: String::new(),
            game: None,
            players: HashMap::new(),
            teams: HashMap::new(),
            scores: Vec::new(),
            server_metadata: ServerMetadata::default(),
            wipe_players: config.wipe_players_on_new_round,
        }
    }

    fn emit(&self, sink: &dyn UpdateSink, id: Option<String>, content: UpdateContent) {
        let message = UpdateMessage::new(id, Some(self.round.id.clone()), content);
        debug!("Emitting {} update", message.kind());
        sink.send_update(message);
    }

    fn emit_round(&self, sink: &dyn UpdateSink) {
        self.emit(
            sink,
            Some(self.round.id.clone()),
            UpdateContent::Round(self.round.clone()),
        );
    }

    /// Maps a raw or already namespaced id into the current round.
    fn internal_id(&self, id: &str) -> String {
        if id.starts_with(&self.prefix) {
            id.to_string()
        } else {
            format!("{}{}", self.prefix, id)
        }
    }

    /// Switches to `round_id`, moving surviving players into its namespace.
    fn rotate_namespace(&mut self, round_id: &str) {
        let old_prefix = std::mem::replace(
            &mut self.prefix,
            format!("{}{}", round_id, NAMESPACE_SEPARATOR),
        );
        let rekey = |id: &str, prefix: &str| -> String {
            let raw = id.strip_prefix(old_prefix.as_str()).unwrap_or(id);
            format!("{}{}", prefix, raw)
        };

        let players = std::mem::take(&mut self.players);
        for (_, mut alias) in players {
            alias.id = rekey(&alias.id, &self.prefix);
            self.players.insert(alias.id.clone(), alias);
        }
        for score in &mut self.scores {
            if score.alias.has_id() {
                score.alias.id = rekey(&score.alias.id, &self.prefix);
            }
        }
        debug!("Player namespace is now '{}'", self.prefix);
    }

    fn merge_player(&mut self, sink: &dyn UpdateSink, incoming: &Alias) -> Result<Alias, MergeError> {
        let mut changed = false;

        let key = if incoming.has_id() {
            let key = self.internal_id(&incoming.id);
            if !self.players.contains_key(&key) {
                self.players
                    .insert(key.clone(), Alias::new(&key, ""));
                changed = true;
            }
            key
        } else if incoming.has_name() {
            self.players
                .iter()
                .find(|(_, alias)| alias.name == incoming.name)
                .map(|(key, _)| key.clone())
                .ok_or_else(|| MergeError::PlayerNotFound(incoming.name.clone()))?
        } else {
            return Err(MergeError::UnresolvablePlayer);
        };

        let Some(stored) = self.players.get_mut(&key) else {
            return Err(MergeError::UnresolvablePlayer);
        };
        changed |= merge_text(&mut stored.name, &incoming.name);
        changed |= merge_option(&mut stored.bot, &incoming.bot);
        changed |= merge_option(&mut stored.team, &incoming.team);
        changed |= merge_option(&mut stored.person, &incoming.person);
        changed |= merge_option(&mut stored.game, &incoming.game);
        if stored.present != incoming.present {
            stored.present = incoming.present;
            changed = true;
        }

        let snapshot = stored.clone();
        if changed {
            self.emit(
                sink,
                Some(snapshot.id.clone()),
                UpdateContent::Alias(snapshot.clone()),
            );
        }
        Ok(snapshot)
    }

    fn find_player_by_name(&self, name: &str) -> Option<&Alias> {
        self.players.values().find(|alias| alias.name == name)
    }

    fn merge_round(&mut self, sink: &dyn UpdateSink, incoming: &Round) -> Round {
        let mut changed = false;

        if !incoming.id.is_empty() && incoming.id != self.round.id {
            self.round.id = incoming.id.clone();
            if self.wipe_players {
                // Raw ids are reused by the server; nothing carries over
                self.players.clear();
                self.scores.clear();
            }
            self.rotate_namespace(&incoming.id);
            changed = true;
        }
        changed |= merge_option(&mut self.round.game, &incoming.game);
        changed |= merge_option(&mut self.round.map, &incoming.map);
        changed |= merge_option(&mut self.round.start, &incoming.start);
        changed |= merge_option(&mut self.round.end, &incoming.end);

        if changed {
            self.emit_round(sink);
        }
        self.round.clone()
    }

    fn start_round(&mut self, sink: &dyn UpdateSink, supplied: Option<&Round>) -> Round {
        if self.wipe_players {
            self.players.clear();
        }
        self.teams.clear();
        self.scores.clear();

        let mut next = match supplied {
            Some(round) => round.clone(),
            None => {
                let mut round = Round::new(&fresh_round_id());
                round.game = self.game.clone();
                round.start = Some(Utc::now());
                round
            }
        };
        if next.id.is_empty() {
            next.id = fresh_round_id();
        }

        if next.id != self.round.id {
            self.rotate_namespace(&next.id);
        }
        self.round = next;
        self.emit_round(sink);
        self.round.clone()
    }

    fn merge_game(&mut self, sink: &dyn UpdateSink, incoming: &Game) -> Game {
        let changed = match self.game.as_mut() {
            None => {
                self.game = Some(incoming.clone());
                true
            }
            Some(current) => {
                let mut changed = merge_option(&mut current.name, &incoming.name);
                changed |= merge_option(&mut current.game_type, &incoming.game_type);
                changed |= merge_option(&mut current.mod_name, &incoming.mod_name);
                changed
            }
        };

        if changed {
            self.round.game = self.game.clone();
            self.emit_round(sink);
        }
        self.game.clone().unwrap_or_default()
    }

    fn merge_team(&mut self, sink: &dyn UpdateSink, key: &str, incoming: &Team) -> Team {
        let existing = if self.teams.contains_key(key) {
            Some(key.to_string())
        } else {
            let wanted = incoming.name.to_lowercase();
            self.teams
                .iter()
                .find(|(_, team)| team.name.to_lowercase() == wanted)
                .map(|(key, _)| key.clone())
        };

        let (team_key, changed) = match existing.and_then(|k| self.teams.get_mut(&k).map(|t| (k, t))) {
            Some((team_key, team)) => {
                let mut changed = merge_text(&mut team.name, &incoming.name);
                changed |= merge_option(&mut team.score, &incoming.score);
                (team_key, changed)
            }
            None => {
                self.teams.insert(key.to_string(), incoming.clone());
                (key.to_string(), true)
            }
        };

        let snapshot = self.teams.get(&team_key).cloned().unwrap_or_else(|| incoming.clone());
        if changed {
            self.emit(sink, Some(team_key), UpdateContent::Team(snapshot.clone()));
        }
        snapshot
    }

    /// Position of the score belonging to `alias`: raw id, then namespaced id, then name.
    fn score_index(&self, alias: &Alias) -> Option<usize> {
        let by_id = || {
            alias
                .has_id()
                .then(|| self.scores.iter().position(|s| s.alias.id == alias.id))
                .flatten()
        };
        let by_internal_id = || {
            alias
                .has_id()
                .then(|| {
                    let wanted = self.internal_id(&alias.id);
                    self.scores
                        .iter()
                        .position(|s| s.alias.has_id() && self.internal_id(&s.alias.id) == wanted)
                })
                .flatten()
        };
        let by_name = || {
            alias
                .has_name()
                .then(|| self.scores.iter().position(|s| s.alias.name == alias.name))
                .flatten()
        };
        by_id().or_else(by_internal_id).or_else(by_name)
    }

    fn merge_score(&mut self, sink: &dyn UpdateSink, incoming: &Score) -> Result<Score, MergeError> {
        let alias = self.merge_player(sink, &incoming.alias)?;

        let (index, changed) = match self.score_index(&alias) {
            Some(index) => {
                let stored = &mut self.scores[index];
                let changed = stored.score != incoming.score;
                stored.score = incoming.score;
                stored.alias = alias;
                (index, changed)
            }
            None => {
                self.scores.push(Score::new(alias, incoming.score));
                (self.scores.len() - 1, true)
            }
        };

        let snapshot = self.scores[index].clone();
        if changed {
            self.emit(
                sink,
                Some(snapshot.alias.id.clone()),
                UpdateContent::Score(snapshot.clone()),
            );
        }
        Ok(snapshot)
    }

    fn increment_score(
        &mut self,
        sink: &dyn UpdateSink,
        alias: &Alias,
        delta: f32,
    ) -> Result<Score, MergeError> {
        let alias = self.merge_player(sink, alias)?;

        let index = match self.score_index(&alias) {
            Some(index) => {
                let stored = &mut self.scores[index];
                stored.score += delta;
                stored.alias = alias;
                index
            }
            None => {
                self.scores.push(Score::new(alias, delta));
                self.scores.len() - 1
            }
        };

        let snapshot = self.scores[index].clone();
        self.emit(
            sink,
            Some(snapshot.alias.id.clone()),
            UpdateContent::Score(snapshot.clone()),
        );
        Ok(snapshot)
    }

    fn merge_server_metadata(&mut self, sink: &dyn UpdateSink, incoming: &ServerMetadata) -> ServerMetadata {
        let mut changed = merge_option(&mut self.server_metadata.server_name, &incoming.server_name);
        for (key, value) in &incoming.metadata {
            if self.server_metadata.metadata.get(key) != Some(value) {
                self.server_metadata.metadata.insert(key.clone(), value.clone());
                changed = true;
            }
        }

        if changed {
            self.emit(
                sink,
                None,
                UpdateContent::ServerMetadata(self.server_metadata.clone()),
            );
        }
        self.server_metadata.clone()
    }
}

/// Thread-safe store merging partial records into canonical state
pub struct DataManager {
    state: Mutex<State>,
    sink: Arc<dyn UpdateSink>,
}

impl DataManager {
    /// Creates a manager and starts the initial round.
    pub fn new(sink: Arc<dyn UpdateSink>) -> Self {
        Self::with_config(sink, DataManagerConfig::default())
    }

    pub fn with_config(sink: Arc<dyn UpdateSink>, config: DataManagerConfig) -> Self {
        let mut state = State::new(config);
        state.start_round(sink.as_ref(), None);
        Self {
            state: Mutex::new(state),
            sink,
        }
    }

    pub fn set_wipe_players_on_new_round(&self, wipe: bool) {
        self.state.lock().wipe_players = wipe;
    }

    pub fn wipe_players_on_new_round(&self) -> bool {
        self.state.lock().wipe_players
    }

    /// Merges a partial player record.
    ///
    /// The player is located by id (created if unknown) or, when no id is
    /// given, by exact name. Supplied fields overwrite stored ones; empty or
    /// `None` fields are left alone. Returns the stored player after the merge.
    pub fn provide_player_record(&self, alias: &Alias) -> Result<Alias, MergeError> {
        let mut state = self.state.lock();
        state.merge_player(self.sink.as_ref(), alias).map_err(|e| {
            error!("Rejected player record {:?}: {}", alias.name, e);
            e
        })
    }

    /// Looks up a player by raw or namespaced id in the current round.
    pub fn get_player(&self, id: &str) -> Option<Alias> {
        let state = self.state.lock();
        let key = state.internal_id(id);
        state.players.get(&key).cloned()
    }

    pub fn get_player_by_name(&self, name: &str) -> Option<Alias> {
        self.state.lock().find_player_by_name(name).cloned()
    }

    /// Snapshot of all players, ordered by id.
    pub fn players(&self) -> Vec<Alias> {
        let mut players: Vec<Alias> = self.state.lock().players.values().cloned().collect();
        players.sort_by(|a, b| a.id.cmp(&b.id));
        players
    }

    /// Starts a new round.
    ///
    /// With `None` a round with a fresh id is created, unless nothing has been
    /// recorded since the last round started. Teams and scores are always
    /// reset; players are wiped or carried into the new namespace depending on
    /// configuration.
    pub fn new_round(&self, round: Option<&Round>) -> Round {
        let mut state = self.state.lock();
        let idle = state.players.is_empty() && state.teams.is_empty() && state.scores.is_empty();
        if round.is_none() && idle {
            return state.round.clone();
        }
        state.start_round(self.sink.as_ref(), round)
    }

    /// Merges round details.
    ///
    /// A different id starts a new player namespace. Players and scores are
    /// dropped unless wiping is disabled, in which case players are rekeyed.
    pub fn provide_round_record(&self, round: &Round) -> Round {
        self.state.lock().merge_round(self.sink.as_ref(), round)
    }

    pub fn current_round(&self) -> Round {
        self.state.lock().round.clone()
    }

    pub fn provide_game_record(&self, game: &Game) -> Game {
        self.state.lock().merge_game(self.sink.as_ref(), game)
    }

    pub fn current_game(&self) -> Option<Game> {
        self.state.lock().game.clone()
    }

    /// Merges a team found by `key`, or failing that by case-insensitive name.
    pub fn provide_team_record(&self, key: &str, team: &Team) -> Team {
        self.state.lock().merge_team(self.sink.as_ref(), key, team)
    }

    pub fn team_by_key(&self, key: &str) -> Option<Team> {
        self.state.lock().teams.get(key).cloned()
    }

    pub fn team_by_name(&self, name: &str) -> Option<Team> {
        let wanted = name.to_lowercase();
        self.state
            .lock()
            .teams
            .values()
            .find(|team| team.name.to_lowercase() == wanted)
            .cloned()
    }

    pub fn teams(&self) -> HashMap<String, Team> {
        self.state.lock().teams.clone()
    }

    /// Merges a score after resolving its player through the player merge.
    ///
    /// A score whose player cannot be resolved is rejected and nothing is stored.
    pub fn provide_score_record(&self, score: &Score) -> Result<Score, MergeError> {
        let mut state = self.state.lock();
        state.merge_score(self.sink.as_ref(), score).map_err(|e| {
            error!("Rejected score record: {}", e);
            e
        })
    }

    pub fn score_for_player(&self, alias: &Alias) -> Option<Score> {
        let state = self.state.lock();
        state
            .score_index(alias)
            .map(|index| state.scores[index].clone())
    }

    pub fn scores(&self) -> Vec<Score> {
        self.state.lock().scores.clone()
    }

    /// Adds `delta` to a player's score, creating it at `delta`. Always emits.
    pub fn increment_score(&self, alias: &Alias, delta: f32) -> Result<Score, MergeError> {
        let mut state = self.state.lock();
        state
            .increment_score(self.sink.as_ref(), alias, delta)
            .map_err(|e| {
                error!("Rejected score increment: {}", e);
                e
            })
    }

    /// Adds supplied metadata to the stored server description.
    pub fn provide_server_metadata(&self, metadata: &ServerMetadata) -> ServerMetadata {
        self.state
            .lock()
            .merge_server_metadata(self.sink.as_ref(), metadata)
    }

    pub fn server_metadata(&self) -> ServerMetadata {
        self.state.lock().server_metadata.clone()
    }

    /// Feeds one query result into the store under a single lock.
    ///
    /// Players without an id are keyed by their name, which is how text
    /// protocols that only report names stay stable across polls.
    pub fn apply_bundle(&self, bundle: &QueryResultBundle) {
        let sink = self.sink.as_ref();
        let mut state = self.state.lock();

        if let Some(metadata) = &bundle.server_metadata {
            state.merge_server_metadata(sink, metadata);
        }
        if let Some(round) = &bundle.round {
            state.merge_round(sink, round);
        }

        let keyed = |alias: &Alias| -> Alias {
            let mut alias = alias.clone();
            if !alias.has_id() {
                alias.id = alias.name.clone();
            }
            alias
        };

        for player in &bundle.players {
            if let Some(team) = &player.team {
                state.merge_team(sink, &team.name, team);
            }
            if let Err(e) = state.merge_player(sink, &keyed(player)) {
                error!("Skipping player from query result: {}", e);
            }
        }
        for score in &bundle.scores {
            let score = Score::new(keyed(&score.alias), score.score);
            if let Err(e) = state.merge_score(sink, &score) {
                error!("Skipping score from query result: {}", e);
            }
        }
    }
}
