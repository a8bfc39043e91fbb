//! Game lifecycle: start, moves, per-player listings and stats.
//!
//! Every write goes through [`crate::protocol`]; there is no unguarded
//! game write in this module.

use arena_store::{Kv, KvEntry, ListOptions, ListSelector};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};

use crate::error::{GameResult, Precondition};
use crate::index;
use crate::protocol::{self, VersionedRecord};
use crate::types::{Choice, Game, Outcome, PlayerResult, User};

/// Aggregates over every game a player took part in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStats {
    /// Finished games.
    pub played: usize,
    pub wins: usize,
    pub losses: usize,
    pub draws: usize,
    pub in_progress: usize,
}

/// Game operations over a shared [`Kv`] handle.
#[derive(Clone)]
pub struct GameStore {
    kv: Kv,
}

impl GameStore {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Create a game between two distinct users.
    #[instrument(skip_all, fields(initiator = %initiator.id, opponent = %opponent.id))]
    pub async fn start(&self, initiator: User, opponent: User) -> GameResult<Game> {
        if initiator.id == opponent.id {
            return Err(Precondition::SelfGame.into());
        }
        let game = Game::new(uuid::Uuid::now_v7().to_string(), initiator, opponent, Utc::now());
        let created = protocol::create_record(&self.kv, game).await?;
        info!(game_id = %created.value.id, "game started");
        Ok(created.value)
    }

    pub async fn get(&self, game_id: &str) -> GameResult<Option<Game>> {
        Ok(self.get_with_versionstamp(game_id).await?.map(|e| e.value))
    }

    /// The game and the versionstamp to guard a follow-up write with.
    pub async fn get_with_versionstamp(&self, game_id: &str) -> GameResult<Option<KvEntry<Game>>> {
        Ok(self.kv.get::<Game>(&Game::primary_key(game_id)).await?)
    }

    /// Record `user_id`'s move, resolving the game if it is the second one.
    #[instrument(skip(self, choice), fields(choice = %choice))]
    pub async fn make_move(&self, game_id: &str, user_id: &str, choice: Choice) -> GameResult<Game> {
        let written = protocol::read_modify_write(&self.kv, game_id, |game: &Game| {
            apply_move(game, user_id, choice)
        })
        .await?;
        log_move(&written.value, user_id);
        Ok(written.value)
    }

    /// Like [`GameStore::make_move`], but against a snapshot the caller
    /// already read. A snapshot that is no longer current yields `Conflict`.
    pub async fn submit_move(
        &self,
        snapshot: &KvEntry<Game>,
        user_id: &str,
        choice: Choice,
    ) -> GameResult<Game> {
        let next = apply_move(&snapshot.value, user_id, choice)?;
        let written = protocol::guarded_write(&self.kv, snapshot, next).await?;
        log_move(&written.value, user_id);
        Ok(written.value)
    }

    /// Play a uniformly random move on behalf of `user_id` (a bot seat).
    #[instrument(skip(self))]
    pub async fn make_random_move(&self, game_id: &str, user_id: &str) -> GameResult<Game> {
        let written = protocol::read_modify_write(&self.kv, game_id, |game: &Game| {
            let choice = Choice::ALL[rand::rng().random_range(0..Choice::ALL.len())];
            apply_move(game, user_id, choice)
        })
        .await?;
        log_move(&written.value, user_id);
        Ok(written.value)
    }

    // ── per-player listings ──────────────────────────────────────────

    /// Every game `user_id` plays in, ordered by game id.
    pub async fn list_all_by_player(&self, user_id: &str) -> GameResult<Vec<Game>> {
        let games = self
            .kv
            .list::<Game>(
                ListSelector::Prefix(index::games_by_user_prefix(user_id)),
                ListOptions::default(),
            )?
            .values()
            .await?;
        Ok(games)
    }

    /// Games of `user_id` still waiting for a move.
    pub async fn list_in_progress_by_player(&self, user_id: &str) -> GameResult<Vec<Game>> {
        let mut games = self.list_all_by_player(user_id).await?;
        games.retain(|g| !g.is_finished());
        Ok(games)
    }

    /// Distinct users `user_id` has finished a game against, first
    /// encounter first.
    pub async fn previous_opponents(&self, user_id: &str) -> GameResult<Vec<User>> {
        let mut opponents: Vec<User> = Vec::new();
        for game in self.list_all_by_player(user_id).await? {
            if !game.is_finished() {
                continue;
            }
            if let Some(other) = game.opponent_of(user_id)
                && !opponents.iter().any(|u| u.id == other.id)
            {
                opponents.push(other.clone());
            }
        }
        Ok(opponents)
    }

    pub async fn stats(&self, user_id: &str) -> GameResult<PlayerStats> {
        let mut stats = PlayerStats::default();
        for game in self.list_all_by_player(user_id).await? {
            match Outcome::for_player(&game, user_id) {
                Some(result) => {
                    stats.played += 1;
                    match result {
                        PlayerResult::Won => stats.wins += 1,
                        PlayerResult::Lost => stats.losses += 1,
                        PlayerResult::Draw => stats.draws += 1,
                    }
                }
                None => stats.in_progress += 1,
            }
        }
        Ok(stats)
    }
}

/// Validate a move against `game` and produce the next record.
///
/// Checks run in a fixed order: game over, participant, already moved.
fn apply_move(game: &Game, user_id: &str, choice: Choice) -> GameResult<Game> {
    if game.is_finished() {
        return Err(Precondition::GameOver.into());
    }
    let role = game.role_of(user_id).ok_or(Precondition::NotAPlayer)?;
    if game.choice(role).is_some() {
        return Err(Precondition::AlreadyMoved.into());
    }
    Ok(game.with_move(role, choice, Utc::now()))
}

fn log_move(game: &Game, user_id: &str) {
    match game.result {
        Some(result) => info!(game_id = %game.id, user_id, ?result, "game finished"),
        None => info!(game_id = %game.id, user_id, "move recorded"),
    }
}
