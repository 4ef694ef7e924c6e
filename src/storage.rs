use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use sqlx::{sqlite::SqlitePoolOptions, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::error::{Result, SayrError};
use crate::session::{Session, SessionKey, SessionStore, StateMap, Turn, TurnRole};

fn storage_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> SayrError {
    move |err| SayrError::Storage(format!("{context}: {err}"))
}

fn to_millis(timestamp: SystemTime) -> i64 {
    timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn from_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

/// Sessions and turns kept in SQLite.
pub struct SqlSessionStore {
    pool: SqlitePool,
}

impl SqlSessionStore {
    const INIT_STATEMENTS: [&'static str; 2] = [
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            app_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            state TEXT NOT NULL DEFAULT '{}',
            PRIMARY KEY (app_name, user_id, session_id)
        )
        "#,
        r#"
        CREATE TABLE IF NOT EXISTS turns (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            app_name TEXT NOT NULL,
            user_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            role TEXT NOT NULL,
            author TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        )
        "#,
    ];

    pub async fn connect(connection_url: impl AsRef<str>) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(connection_url.as_ref())
            .await
            .map_err(|err| {
                SayrError::Storage(format!(
                    "failed connecting to SQL backend `{}`: {err}",
                    connection_url.as_ref()
                ))
            })?;

        for statement in Self::INIT_STATEMENTS {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(storage_error("failed initializing schema"))?;
        }

        Ok(Self { pool })
    }

    async fn load(&self, key: &SessionKey) -> Result<Option<Session>> {
        let Some(row) = sqlx::query(
            "SELECT state FROM sessions WHERE app_name = ? AND user_id = ? AND session_id = ?",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage_error("failed loading session"))?
        else {
            return Ok(None);
        };

        let raw_state: String = row
            .try_get("state")
            .map_err(storage_error("failed decoding session state"))?;
        let state: StateMap = serde_json::from_str(&raw_state)?;

        let rows = sqlx::query(
            "SELECT role, author, content, created_at_ms FROM turns \
             WHERE app_name = ? AND user_id = ? AND session_id = ? ORDER BY id ASC",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("failed loading turns"))?;

        let turns = rows
            .into_iter()
            .map(|row| -> Result<Turn> {
                let role: String = row.try_get("role").map_err(storage_error("bad turn row"))?;
                let role = TurnRole::parse(&role)
                    .ok_or_else(|| SayrError::Storage(format!("unknown turn role `{role}`")))?;
                Ok(Turn {
                    role,
                    author: row.try_get("author").map_err(storage_error("bad turn row"))?,
                    content: row.try_get("content").map_err(storage_error("bad turn row"))?,
                    timestamp: from_millis(
                        row.try_get("created_at_ms")
                            .map_err(storage_error("bad turn row"))?,
                    ),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(Session {
            key: key.clone(),
            turns,
            state,
        }))
    }

    async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        self.pool
            .begin()
            .await
            .map_err(storage_error("failed starting transaction"))
    }
}

async fn ensure_session(conn: &mut SqliteConnection, key: &SessionKey) -> Result<()> {
    let exists = sqlx::query(
        "SELECT 1 FROM sessions WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_error("failed checking session"))?;
    match exists {
        Some(_) => Ok(()),
        None => Err(SayrError::SessionNotFound(key.to_string())),
    }
}

async fn insert_turns(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    turns: Vec<Turn>,
) -> Result<()> {
    for turn in turns {
        sqlx::query(
            "INSERT INTO turns (app_name, user_id, session_id, role, author, content, created_at_ms) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .bind(turn.role.as_str())
        .bind(turn.author)
        .bind(turn.content)
        .bind(to_millis(turn.timestamp))
        .execute(&mut *conn)
        .await
        .map_err(storage_error("failed writing turn"))?;
    }
    Ok(())
}

/// Merges `delta` into the stored state. Fails with `SessionNotFound` for unknown keys.
async fn write_state(
    conn: &mut SqliteConnection,
    key: &SessionKey,
    delta: StateMap,
) -> Result<()> {
    let row = sqlx::query(
        "SELECT state FROM sessions WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(storage_error("failed loading session state"))?
    .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))?;
    if delta.is_empty() {
        return Ok(());
    }

    let raw: String = row
        .try_get("state")
        .map_err(storage_error("failed decoding session state"))?;
    let mut state: StateMap = serde_json::from_str(&raw)?;
    state.extend(delta);

    sqlx::query(
        "UPDATE sessions SET state = ? WHERE app_name = ? AND user_id = ? AND session_id = ?",
    )
    .bind(serde_json::to_string(&state)?)
    .bind(&key.app_name)
    .bind(&key.user_id)
    .bind(&key.session_id)
    .execute(&mut *conn)
    .await
    .map_err(storage_error("failed writing session state"))?;
    Ok(())
}

#[async_trait]
impl SessionStore for SqlSessionStore {
    async fn get_or_create(&self, key: &SessionKey) -> Result<Session> {
        sqlx::query(
            "INSERT OR IGNORE INTO sessions (app_name, user_id, session_id, state) VALUES (?, ?, ?, '{}')",
        )
        .bind(&key.app_name)
        .bind(&key.user_id)
        .bind(&key.session_id)
        .execute(&self.pool)
        .await
        .map_err(storage_error("failed creating session"))?;

        self.load(key)
            .await?
            .ok_or_else(|| SayrError::SessionNotFound(key.to_string()))
    }

    async fn get(&self, key: &SessionKey) -> Result<Option<Session>> {
        self.load(key).await
    }

    async fn append_turn(&self, key: &SessionKey, turn: Turn) -> Result<()> {
        self.append_turns(key, vec![turn]).await
    }

    async fn append_turns(&self, key: &SessionKey, turns: Vec<Turn>) -> Result<()> {
        let mut tx = self.begin().await?;
        ensure_session(&mut *tx, key).await?;
        insert_turns(&mut *tx, key, turns).await?;
        tx.commit()
            .await
            .map_err(storage_error("failed committing turns"))
    }

    async fn merge_state(&self, key: &SessionKey, delta: StateMap) -> Result<()> {
        let mut tx = self.begin().await?;
        write_state(&mut *tx, key, delta).await?;
        tx.commit()
            .await
            .map_err(storage_error("failed committing session state"))
    }

    async fn commit_turn(
        &self,
        key: &SessionKey,
        turns: Vec<Turn>,
        delta: StateMap,
    ) -> Result<()> {
        let mut tx = self.begin().await?;
        write_state(&mut *tx, key, delta).await?;
        insert_turns(&mut *tx, key, turns).await?;
        tx.commit()
            .await
            .map_err(storage_error("failed committing turn"))
    }

    async fn list_sessions(&self, app_name: &str, user_id: &str) -> Result<Vec<SessionKey>> {
        let rows = sqlx::query(
            "SELECT session_id FROM sessions WHERE app_name = ? AND user_id = ? ORDER BY session_id",
        )
        .bind(app_name)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_error("failed listing sessions"))?;

        rows.into_iter()
            .map(|row| -> Result<SessionKey> {
                let session_id: String = row
                    .try_get("session_id")
                    .map_err(storage_error("bad session row"))?;
                Ok(SessionKey::new(app_name, user_id, session_id))
            })
            .collect()
    }

    async fn delete(&self, key: &SessionKey) -> Result<bool> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(storage_error("failed starting transaction"))?;

        sqlx::query("DELETE FROM turns WHERE app_name = ? AND user_id = ? AND session_id = ?")
            .bind(&key.app_name)
            .bind(&key.user_id)
            .bind(&key.session_id)
            .execute(&mut *tx)
            .await
            .map_err(storage_error("failed deleting turns"))?;
        let removed =
            sqlx::query("DELETE FROM sessions WHERE app_name = ? AND user_id = ? AND session_id = ?")
                .bind(&key.app_name)
                .bind(&key.user_id)
                .bind(&key.session_id)
                .execute(&mut *tx)
                .await
                .map_err(storage_error("failed deleting session"))?
                .rows_affected();

        tx.commit()
            .await
            .map_err(storage_error("failed committing delete"))?;
        Ok(removed > 0)
    }
}
