//! # arena-game
//!
//! Rock/paper/scissors on top of [`arena_store`].
//!
//! - [`types`]: users, games, moves and the winner rule
//! - [`index`]: key layout and the index entries every game write carries
//! - [`protocol`]: the guarded read-modify-write path all game writes take
//! - [`games`] / [`users`]: the operations an HTTP layer or CLI calls
//! - [`broker`]: push-style live views with one store watch per topic
//!
//! ```ignore
//! use arena_game::{GameStore, LiveUpdates, Choice};
//!
//! let games = GameStore::new(kv.clone());
//! let live = LiveUpdates::new(kv.clone(), Duration::from_millis(50));
//!
//! let mut lobby = live.subscribe_player_games(&alice.id)?;
//! let game = games.start(alice.clone(), bob.clone()).await?;
//! games.make_move(&game.id, &alice.id, Choice::Rock).await?;
//! while let Some(view) = lobby.next().await {
//!     println!("{} games in progress", view?.len());
//! }
//! ```

pub mod broker;
pub mod error;
pub mod games;
pub mod index;
pub mod protocol;
pub mod types;
pub mod users;

// ── re-exports ───────────────────────────────────────────────────────

pub use broker::{Broker, GameSource, LiveUpdates, PlayerGamesSource, Subscription, ViewSource};
pub use error::{GameError, GameResult, Precondition};
pub use games::{GameStore, PlayerStats};
pub use protocol::{create_record, guarded_write, read_modify_write, VersionedRecord};
pub use types::{
    determine_winner, validate_game_id, Choice, Game, GameState, GameStatus, Outcome,
    PlayerResult, Role, User,
};
pub use users::UserStore;
