//! CLI entry point for the arena.
//!
//! This binary provides the `arena` command with subcommands for managing
//! users, playing games and following live views.

mod cli;
mod config;
mod helpers;

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use arena_game::{GameError, GameStore, LiveUpdates, Subscription, User, UserStore};
use arena_store::Kv;
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

use cli::{Cli, Commands, GameAction, UserAction, WatchAction};
use config::ArenaConfig;
use helpers::{init_tracing, print_json, print_json_line};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = ArenaConfig::load(&cli.config)?;
    if let Some(path) = cli.database {
        config.store.path = path;
    }
    init_tracing(&config.log.level);

    let app = App::open(&config).await?;
    let result = match cli.command {
        Commands::User { action } => cmd_user(&app, action).await,
        Commands::Game { action } => cmd_game(&app, action).await,
        Commands::Watch { action } => cmd_watch(&app, action).await,
    };
    app.kv.close();
    result
}

/// Handles shared by every subcommand.
struct App {
    kv: Kv,
    users: UserStore,
    games: GameStore,
    live: LiveUpdates,
}

impl App {
    async fn open(config: &ArenaConfig) -> Result<Self> {
        let path = &config.store.path;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let kv = Kv::open(path, config.kv_options())
            .await
            .with_context(|| format!("failed to open store at {}", path.display()))?;
        debug!(path = %path.display(), "store opened");

        Ok(Self {
            users: UserStore::with_session_cache(
                kv.clone(),
                config.cache.capacity,
                config.session_ttl(),
            ),
            games: GameStore::new(kv.clone()),
            live: LiveUpdates::new(kv.clone(), config.debounce()),
            kv,
        })
    }

    async fn require_user(&self, user_id: &str) -> Result<User> {
        self.users
            .get_by_id(user_id)
            .await?
            .ok_or_else(|| anyhow!("unknown user '{user_id}', sign in first"))
    }
}

// ---------------------------------------------------------------------------
// Subcommand: user
// ---------------------------------------------------------------------------

async fn cmd_user(app: &App, action: UserAction) -> Result<()> {
    match action {
        UserAction::SignIn {
            id,
            login,
            name,
            avatar,
        } => {
            let user = User {
                name: name.unwrap_or_else(|| login.clone()),
                id,
                login,
                avatar_url: avatar,
            };
            let session = app.users.sign_in(&user).await?;
            print_json(&json!({ "user": user, "session": session }))
        }
        UserAction::Show { id, login, session } => {
            let user = match (id, login, session) {
                (Some(id), _, _) => app.users.get_by_id(&id).await?,
                (_, Some(login), _) => app.users.get_by_login(&login).await?,
                (_, _, Some(session)) => app.users.get_by_session(&session).await?,
                _ => return Err(anyhow!("one of --id, --login or --session is required")),
            };
            let user = user.ok_or_else(|| anyhow!("user not found"))?;
            print_json(&user)
        }
        UserAction::SignOut { session } => {
            app.users.delete_session(&session).await?;
            println!("Session signed out.");
            Ok(())
        }
        UserAction::Recent { limit } => {
            let users = app.users.list_recently_signed_in(limit).await?;
            if users.is_empty() {
                println!("No users have signed in yet.");
                return Ok(());
            }
            for user in users {
                println!("{:<24} {:<20} {}", user.id, user.login, user.name);
            }
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Subcommand: game
// ---------------------------------------------------------------------------

async fn cmd_game(app: &App, action: GameAction) -> Result<()> {
    match action {
        GameAction::Start {
            initiator,
            opponent,
        } => {
            let initiator = app.require_user(&initiator).await?;
            let opponent = app.require_user(&opponent).await?;
            let game = app.games.start(initiator, opponent).await?;
            info!(game_id = %game.id, "game started");
            print_json(&game)
        }
        GameAction::Move {
            game,
            player,
            choice,
        } => {
            let updated = app
                .games
                .make_move(&game, &player, choice)
                .await
                .map_err(describe)?;
            print_json(&updated)
        }
        GameAction::BotMove { game, player } => {
            let updated = app
                .games
                .make_random_move(&game, &player)
                .await
                .map_err(describe)?;
            print_json(&updated)
        }
        GameAction::Show { game } => {
            let entry = app
                .games
                .get_with_versionstamp(&game)
                .await?
                .ok_or_else(|| anyhow!("game '{game}' not found"))?;
            print_json(&json!({
                "versionstamp": entry.versionstamp.to_string(),
                "game": entry.value,
            }))
        }
        GameAction::List { user, in_progress } => {
            let games = if in_progress {
                app.games.list_in_progress_by_player(&user).await?
            } else {
                app.games.list_all_by_player(&user).await?
            };
            print_json(&games)
        }
        GameAction::Opponents { user } => {
            let opponents = app.games.previous_opponents(&user).await?;
            print_json(&opponents)
        }
        GameAction::Stats { user } => {
            let stats = app.games.stats(&user).await?;
            print_json(&stats)
        }
    }
}

/// Attach the HTTP-style status a web layer would answer with.
fn describe(err: GameError) -> anyhow::Error {
    let status = err.http_status();
    anyhow::Error::new(err).context(format!("move rejected ({status})"))
}

// ---------------------------------------------------------------------------
// Subcommand: watch
// ---------------------------------------------------------------------------

async fn cmd_watch(app: &App, action: WatchAction) -> Result<()> {
    match action {
        WatchAction::Games { user } => follow(app.live.subscribe_player_games(&user)?).await,
        WatchAction::Game { game } => follow(app.live.subscribe_game(&game)?).await,
    }
}

/// Print every view from `subscription` until Ctrl-C or the topic ends.
async fn follow<V: Serialize>(mut subscription: Subscription<V>) -> Result<()> {
    loop {
        let view: Option<Result<Arc<V>, GameError>> = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                debug!("interrupted, releasing subscription");
                return Ok(());
            }
            view = subscription.next() => view,
        };
        match view {
            Some(Ok(view)) => print_json_line(view.as_ref())?,
            Some(Err(e)) => return Err(e).context("live view failed"),
            None => {
                debug!("subscription closed");
                return Ok(());
            }
        }
    }
}
