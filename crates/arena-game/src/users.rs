//! Users and sign-in sessions.
//!
//! A sign-in writes the user under its id, login, session token and a
//! sign-in time index in one unconditional commit. These records are
//! replaced wholesale on every sign-in and never edited, so they need no
//! versionstamp guard.

use std::time::Duration;

use arena_store::{CacheLayer, Kv, ListOptions, ListSelector};
use chrono::{SecondsFormat, Utc};
use tracing::{debug, info, instrument};

use crate::error::GameResult;
use crate::index;
use crate::types::User;

/// User and session operations over a shared [`Kv`] handle.
#[derive(Clone)]
pub struct UserStore {
    kv: Kv,
    sessions: CacheLayer<String, User>,
}

impl UserStore {
    pub fn new(kv: Kv) -> Self {
        Self::with_session_cache(kv, 10_000, Duration::from_secs(300))
    }

    /// Like [`UserStore::new`] with an explicitly sized session cache.
    pub fn with_session_cache(kv: Kv, capacity: u64, ttl: Duration) -> Self {
        let sessions = CacheLayer::<String, User>::builder("sessions")
            .max_capacity(capacity)
            .ttl(ttl)
            .build();
        Self { kv, sessions }
    }

    /// Record a sign-in and return the new session token.
    #[instrument(skip_all, fields(user_id = %user.id))]
    pub async fn sign_in(&self, user: &User) -> GameResult<String> {
        let session = uuid::Uuid::new_v4().to_string();
        self.set_user_with_session(user, &session).await?;
        info!(login = %user.login, "user signed in");
        Ok(session)
    }

    /// Write `user` under all of its lookup keys, bound to `session`.
    pub async fn set_user_with_session(&self, user: &User, session: &str) -> GameResult<()> {
        let signed_in_at = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let commit = self
            .kv
            .atomic()
            .set(index::user_key(&user.id), user)
            .set(index::user_by_login_key(&user.login), user)
            .set(index::user_by_session_key(session), user)
            .set(index::user_by_last_signin_key(&signed_in_at, &user.id), user)
            .commit()
            .await?;
        debug!(user_id = %user.id, versionstamp = ?commit.versionstamp(), "user records written");
        // A token is never reused, but a stale entry must not outlive a rewrite.
        self.sessions.invalidate(&session.to_string()).await;
        Ok(())
    }

    pub async fn get_by_id(&self, user_id: &str) -> GameResult<Option<User>> {
        Ok(self.kv.get::<User>(&index::user_key(user_id)).await?.map(|e| e.value))
    }

    pub async fn get_by_login(&self, login: &str) -> GameResult<Option<User>> {
        let entry = self.kv.get::<User>(&index::user_by_login_key(login)).await?;
        Ok(entry.map(|e| e.value))
    }

    /// Resolve a session token, served from memory when possible.
    ///
    /// Sign-outs through this store (or a clone of it) take effect at once.
    /// Separately built stores keep their own cache and may serve a
    /// signed-out session until its entry expires.
    pub async fn get_by_session(&self, session: &str) -> GameResult<Option<User>> {
        let user = self
            .sessions
            .get_or_load(session.to_string(), || async {
                let entry = self.kv.get::<User>(&index::user_by_session_key(session)).await?;
                Ok(entry.map(|e| e.value))
            })
            .await?;
        Ok(user)
    }

    /// Sign a session out.
    pub async fn delete_session(&self, session: &str) -> GameResult<()> {
        self.kv.delete(index::user_by_session_key(session)).await?;
        self.sessions.invalidate(&session.to_string()).await;
        debug!("session deleted");
        Ok(())
    }

    /// Distinct users by most recent sign-in, newest first.
    pub async fn list_recently_signed_in(&self, limit: usize) -> GameResult<Vec<User>> {
        let mut iter = self.kv.list::<User>(
            ListSelector::prefix([index::USERS_BY_LAST_SIGNIN]),
            ListOptions::default().reverse(),
        )?;
        let mut users: Vec<User> = Vec::with_capacity(limit);
        while users.len() < limit {
            let Some(entry) = iter.next().await? else {
                break;
            };
            if !users.iter().any(|u| u.id == entry.value.id) {
                users.push(entry.value);
            }
        }
        Ok(users)
    }

    /// Hit/miss counters of the session cache.
    pub fn session_cache_stats(&self) -> &arena_store::CacheStats {
        self.sessions.stats()
    }
}
