//! CLI argument definitions for the arena.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use arena_game::Choice;
use clap::{Parser, Subcommand};

/// Rock/paper/scissors over a versioned key-value store.
#[derive(Parser)]
#[command(
    name = "arena",
    version,
    about = "Rock/paper/scissors arena",
    long_about = "Start games, submit moves and follow live game views, all backed by a \
                  versioned key-value store with optimistic concurrency."
)]
pub struct Cli {
    /// Path to the TOML configuration file. A missing file means defaults.
    #[arg(long, short, global = true, default_value = "config/arena.toml")]
    pub config: PathBuf,

    /// Override the database path from the configuration.
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage users and sign-in sessions.
    User {
        #[command(subcommand)]
        action: UserAction,
    },

    /// Start games, play moves and inspect results.
    Game {
        #[command(subcommand)]
        action: GameAction,
    },

    /// Follow a live view, printing one JSON line per update until Ctrl-C.
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },
}

/// Actions on users.
#[derive(Subcommand)]
pub enum UserAction {
    /// Sign a user in, creating or replacing its record. Prints the session token.
    SignIn {
        /// Stable user id.
        id: String,
        /// Login handle.
        #[arg(long, short)]
        login: String,
        /// Display name; defaults to the login.
        #[arg(long, short)]
        name: Option<String>,
        /// Avatar URL.
        #[arg(long, default_value = "")]
        avatar: String,
    },
    /// Show a user by id, login or session token.
    Show {
        /// User id.
        #[arg(long, conflicts_with_all = ["login", "session"])]
        id: Option<String>,
        /// Login handle.
        #[arg(long, conflicts_with = "session")]
        login: Option<String>,
        /// Session token.
        #[arg(long)]
        session: Option<String>,
    },
    /// Sign a session out.
    SignOut {
        /// Session token to delete.
        session: String,
    },
    /// List users by most recent sign-in.
    Recent {
        /// Maximum number of users to print.
        #[arg(long, short, default_value_t = 10)]
        limit: usize,
    },
}

/// Actions on games.
#[derive(Subcommand)]
pub enum GameAction {
    /// Start a game between two signed-in users.
    Start {
        /// Id of the initiating user.
        initiator: String,
        /// Id of the opponent.
        opponent: String,
    },
    /// Submit a move for a player.
    Move {
        /// Game id.
        game: String,
        /// Id of the moving player.
        player: String,
        /// One of rock, paper, scissors.
        choice: Choice,
    },
    /// Submit a uniformly random move for a player.
    BotMove {
        /// Game id.
        game: String,
        /// Id of the player the bot moves for.
        player: String,
    },
    /// Show a game with its versionstamp.
    Show {
        /// Game id.
        game: String,
    },
    /// List a player's games.
    List {
        /// User id.
        user: String,
        /// Only games still in progress.
        #[arg(long)]
        in_progress: bool,
    },
    /// Everyone a player has played against.
    Opponents {
        /// User id.
        user: String,
    },
    /// Win/loss/draw totals for a player.
    Stats {
        /// User id.
        user: String,
    },
}

/// Live views to follow.
#[derive(Subcommand)]
pub enum WatchAction {
    /// A player's in-progress games.
    Games {
        /// User id.
        user: String,
    },
    /// A single game.
    Game {
        /// Game id.
        game: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_move_choice() {
        let cli = Cli::parse_from(["arena", "game", "move", "g-123456", "alice", "paper"]);
        match cli.command {
            Commands::Game {
                action: GameAction::Move { game, player, choice },
            } => {
                assert_eq!(game, "g-123456");
                assert_eq!(player, "alice");
                assert_eq!(choice, Choice::Paper);
            }
            _ => panic!("expected game move"),
        }
        assert_eq!(cli.config, PathBuf::from("config/arena.toml"));
    }

    #[test]
    fn rejects_unknown_choice() {
        let parsed = Cli::try_parse_from(["arena", "game", "move", "g-123456", "alice", "lizard"]);
        assert!(parsed.is_err());
    }

    #[test]
    fn global_database_override() {
        let cli = Cli::parse_from(["arena", "watch", "games", "bob", "--database", "/tmp/x.db"]);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/x.db")));
    }
}
