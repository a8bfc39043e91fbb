//! The guarded read-modify-write path for versioned records.
//!
//! Every change to a versioned record goes through here:
//!
//! 1. read the record and its versionstamp (absent: `NotFound`);
//! 2. let the caller validate and compute the next value from the old one
//!    (a rejected change writes nothing);
//! 3. commit the next value and its derived index entries, guarded by the
//!    versionstamp read in step 1;
//! 4. report a lost race as `Conflict`. There is no retry loop here;
//!    callers resubmit if they want to.

use arena_store::{Commit, Key, KvEntry, Kv, Mutation, StoreResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::error::{GameError, GameResult, Precondition};
use crate::index;
use crate::types::Game;

/// A record stored under a primary key with derived index entries.
pub trait VersionedRecord: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name used in errors and logs.
    const ENTITY: &'static str;

    fn id(&self) -> &str;

    fn primary_key(id: &str) -> Key;

    /// The full write batch for this value, primary entry included.
    fn mutations(&self) -> StoreResult<Vec<Mutation>>;
}

impl VersionedRecord for Game {
    const ENTITY: &'static str = "game";

    fn id(&self) -> &str {
        &self.id
    }

    fn primary_key(id: &str) -> Key {
        index::game_key(id)
    }

    fn mutations(&self) -> StoreResult<Vec<Mutation>> {
        index::game_mutations(self)
    }
}

/// Read `id`, apply `change`, and write the result guarded by the read.
#[instrument(skip(kv, change), fields(entity = R::ENTITY))]
pub async fn read_modify_write<R, F>(kv: &Kv, id: &str, change: F) -> GameResult<KvEntry<R>>
where
    R: VersionedRecord,
    F: FnOnce(&R) -> GameResult<R>,
{
    let snapshot = kv
        .get::<R>(&R::primary_key(id))
        .await?
        .ok_or_else(|| GameError::NotFound {
            entity: R::ENTITY,
            id: id.to_string(),
        })?;
    let next = change(&snapshot.value)?;
    guarded_write(kv, &snapshot, next).await
}

/// Write `next` only if the record still carries `snapshot`'s versionstamp.
pub async fn guarded_write<R: VersionedRecord>(
    kv: &Kv,
    snapshot: &KvEntry<R>,
    next: R,
) -> GameResult<KvEntry<R>> {
    let id = snapshot.value.id();
    if next.id() != id {
        return Err(Precondition::IdChanged {
            entity: R::ENTITY,
            from: id.to_string(),
            to: next.id().to_string(),
        }
        .into());
    }

    let commit = kv
        .atomic()
        .check(snapshot.key.clone(), Some(snapshot.versionstamp))
        .extend(next.mutations()?)
        .commit()
        .await?;

    match commit {
        Commit::Committed { versionstamp } => {
            debug!(entity = R::ENTITY, id, %versionstamp, "guarded write committed");
            Ok(KvEntry {
                key: snapshot.key.clone(),
                value: next,
                versionstamp,
            })
        }
        Commit::Conflict => {
            warn!(
                entity = R::ENTITY,
                id,
                read = %snapshot.versionstamp,
                "guarded write lost a race"
            );
            Err(GameError::Conflict {
                entity: R::ENTITY,
                id: id.to_string(),
            })
        }
    }
}

/// Write a brand-new record; fails with `Conflict` if the id is taken.
pub async fn create_record<R: VersionedRecord>(kv: &Kv, value: R) -> GameResult<KvEntry<R>> {
    let key = R::primary_key(value.id());
    let commit = kv
        .atomic()
        .check(key.clone(), None)
        .extend(value.mutations()?)
        .commit()
        .await?;

    match commit {
        Commit::Committed { versionstamp } => Ok(KvEntry {
            key,
            value,
            versionstamp,
        }),
        Commit::Conflict => Err(GameError::Conflict {
            entity: R::ENTITY,
            id: value.id().to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Choice, GameState, Role, User};
    use chrono::Utc;

    fn user(id: &str) -> User {
        User {
            id: id.to_string(),
            login: id.to_string(),
            name: id.to_string(),
            avatar_url: String::new(),
        }
    }

    async fn setup() -> (Kv, KvEntry<Game>) {
        let kv = Kv::open_in_memory().await.unwrap();
        let game = Game::new("game-0001", user("alice"), user("bob"), Utc::now());
        let created = create_record(&kv, game).await.unwrap();
        (kv, created)
    }

    #[tokio::test]
    async fn create_writes_primary_and_indexes() {
        let (kv, created) = setup().await;
        for key in [
            index::game_key("game-0001"),
            index::games_by_user_key("alice", "game-0001"),
            index::games_by_user_key("bob", "game-0001"),
        ] {
            let entry = kv.get::<Game>(&key).await.unwrap().unwrap();
            assert_eq!(entry.versionstamp, created.versionstamp);
        }
    }

    #[tokio::test]
    async fn create_twice_conflicts() {
        let (kv, created) = setup().await;
        match create_record(&kv, created.value.clone()).await {
            Err(GameError::Conflict { entity, id }) => {
                assert_eq!(entity, "game");
                assert_eq!(id, "game-0001");
            }
            other => panic!("expected Conflict, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_record_is_not_found_and_change_never_runs() {
        let kv = Kv::open_in_memory().await.unwrap();
        let result = read_modify_write::<Game, _>(&kv, "nope-nope", |_| {
            panic!("change must not run for a missing record")
        })
        .await;
        assert!(matches!(result, Err(GameError::NotFound { .. })));
    }

    #[tokio::test]
    async fn rejected_change_writes_nothing() {
        let (kv, created) = setup().await;
        let result = read_modify_write::<Game, _>(&kv, "game-0001", |_| {
            Err(Precondition::GameOver.into())
        })
        .await;
        assert!(matches!(result, Err(GameError::PreconditionFailed(_))));

        let entry = kv.get::<Game>(&index::game_key("game-0001")).await.unwrap().unwrap();
        assert_eq!(entry.versionstamp, created.versionstamp);
    }

    #[tokio::test]
    async fn stale_snapshot_conflicts() {
        let (kv, created) = setup().await;
        let first = created.value.with_move(Role::Initiator, Choice::Rock, Utc::now());
        guarded_write(&kv, &created, first).await.unwrap();

        let second = created.value.with_move(Role::Opponent, Choice::Paper, Utc::now());
        let result = guarded_write(&kv, &created, second).await;
        assert!(matches!(result, Err(GameError::Conflict { .. })));

        let stored = kv.get::<Game>(&index::game_key("game-0001")).await.unwrap().unwrap();
        assert_eq!(stored.value.initiator_choice, Some(Choice::Rock));
        assert_eq!(stored.value.opponent_choice, None);
        assert_eq!(stored.value.state, GameState::InProgress);
    }

    #[tokio::test]
    async fn id_change_is_rejected() {
        let (kv, created) = setup().await;
        let mut renamed = created.value.clone();
        renamed.id = "game-0002".into();
        let result = guarded_write(&kv, &created, renamed).await;
        assert!(matches!(result, Err(GameError::PreconditionFailed(_))));
    }
}
