//! Key layout and secondary index derivation.
//!
//! A game lives at `["games", id]` and is mirrored for each participant at
//! `["games_by_user", user, id]`. `["games_by_user_updated", user]` holds
//! the game's `lastMoveAt` in epoch millis and exists only so a watcher
//! learns that one of the user's games changed.
//!
//! [`game_mutations`] is the single place these entries are derived; the
//! result is ridden along with the guarded primary write.

use arena_store::{Key, Mutation, StoreResult};

use crate::types::Game;

pub const GAMES: &str = "games";
pub const GAMES_BY_USER: &str = "games_by_user";
pub const GAMES_BY_USER_UPDATED: &str = "games_by_user_updated";
pub const USERS: &str = "users";
pub const USERS_BY_LOGIN: &str = "users_by_login";
pub const USERS_BY_SESSION: &str = "users_by_session";
pub const USERS_BY_LAST_SIGNIN: &str = "users_by_last_signin";

// ── keys ─────────────────────────────────────────────────────────────

pub fn game_key(game_id: &str) -> Key {
    Key::from([GAMES, game_id])
}

pub fn games_by_user_key(user_id: &str, game_id: &str) -> Key {
    Key::from([GAMES_BY_USER, user_id, game_id])
}

/// Prefix covering every game of `user_id`.
pub fn games_by_user_prefix(user_id: &str) -> Key {
    Key::from([GAMES_BY_USER, user_id])
}

/// The change marker watched by per-user game list subscriptions.
pub fn games_updated_key(user_id: &str) -> Key {
    Key::from([GAMES_BY_USER_UPDATED, user_id])
}

pub fn user_key(user_id: &str) -> Key {
    Key::from([USERS, user_id])
}

pub fn user_by_login_key(login: &str) -> Key {
    Key::from([USERS_BY_LOGIN, login])
}

pub fn user_by_session_key(session: &str) -> Key {
    Key::from([USERS_BY_SESSION, session])
}

pub fn user_by_last_signin_key(signed_in_at: &str, user_id: &str) -> Key {
    Key::from([USERS_BY_LAST_SIGNIN, signed_in_at, user_id])
}

// ── derivation ───────────────────────────────────────────────────────

/// Every mutation a write of `game` consists of: the primary record, one
/// by-participant copy and one change marker per distinct participant.
///
/// Deterministic in `game`, so replaying a write yields the same batch.
pub fn game_mutations(game: &Game) -> StoreResult<Vec<Mutation>> {
    let marker = game.last_move_at.timestamp_millis();
    let mut mutations = vec![Mutation::set(game_key(&game.id), game)?];

    let mut seen: Vec<&str> = Vec::with_capacity(2);
    for user in game.participants() {
        if seen.contains(&user.id.as_str()) {
            continue;
        }
        seen.push(&user.id);
        mutations.push(Mutation::set(games_by_user_key(&user.id, &game.id), game)?);
        mutations.push(Mutation::set(games_updated_key(&user.id), &marker)?);
    }
    Ok(mutations)
}
