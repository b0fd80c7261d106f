use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    future::Future,
    path::Path,
    sync::{Arc, PoisonError},
    time::Duration,
};
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::common::now_unix_seconds;
use crate::error::{AuthError, ClassifiedError};
use crate::portal::{PortalAdapter, SessionProbe};

/// Serialized authentication state for one portal: whatever the adapter
/// needs to make authenticated calls (tokens, cookie headers), plus timing
/// hints. Immutable once issued; a refresh produces a new artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionArtifact {
    pub payload: Value,
    pub issued_at_unix: i64,
    pub expires_at_unix: Option<i64>,
}

impl SessionArtifact {
    pub fn new(payload: Value, expires_at_unix: Option<i64>) -> Self {
        Self {
            payload,
            issued_at_unix: now_unix_seconds(),
            expires_at_unix,
        }
    }

    pub fn is_past_expiry_hint(&self) -> bool {
        self.expires_at_unix
            .map(|at| now_unix_seconds() >= at)
            .unwrap_or(false)
    }

    pub fn value(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }
}

/// What jobs hold while making requests: an immutable snapshot of the
/// current artifact plus the epoch it was issued under. The epoch lets the
/// manager ignore expiry reports from jobs still holding a replaced session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub epoch: u64,
    pub artifact: Arc<SessionArtifact>,
}

#[derive(Debug, Clone)]
enum SessionState {
    Unset,
    Authenticating,
    Valid,
    Expired,
    Failed(AuthError),
}

/// Sqlite-backed persistence for session artifacts, one row per portal.
/// Pure storage; all freshness policy lives in the manager.
pub struct SessionStore {
    conn: std::sync::Mutex<Connection>,
}

impl SessionStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed creating session dir {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed opening session DB {}", path.display()))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            CREATE TABLE IF NOT EXISTS portal_sessions (
                portal_id TEXT PRIMARY KEY,
                payload_json TEXT NOT NULL,
                issued_at_unix INTEGER NOT NULL,
                expires_at_unix INTEGER
            );
            ",
        )
        .context("Failed initializing session store schema")?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    pub fn load(&self, portal_id: &str) -> Result<Option<SessionArtifact>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let row: Option<(String, i64, Option<i64>)> = conn
            .query_row(
                "SELECT payload_json, issued_at_unix, expires_at_unix
                 FROM portal_sessions WHERE portal_id = ?1",
                [portal_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .with_context(|| format!("Failed loading stored session for {portal_id}"))?;

        match row {
            Some((payload_json, issued_at_unix, expires_at_unix)) => {
                let payload: Value = serde_json::from_str(&payload_json)
                    .with_context(|| format!("Invalid stored session payload for {portal_id}"))?;
                Ok(Some(SessionArtifact {
                    payload,
                    issued_at_unix,
                    expires_at_unix,
                }))
            }
            None => Ok(None),
        }
    }

    pub fn save(&self, portal_id: &str, artifact: &SessionArtifact) -> Result<()> {
        let payload_json = serde_json::to_string(&artifact.payload)
            .with_context(|| format!("Failed serializing session payload for {portal_id}"))?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "
            INSERT INTO portal_sessions (portal_id, payload_json, issued_at_unix, expires_at_unix)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(portal_id) DO UPDATE SET
                payload_json = excluded.payload_json,
                issued_at_unix = excluded.issued_at_unix,
                expires_at_unix = excluded.expires_at_unix
            ",
            params![
                portal_id,
                payload_json,
                artifact.issued_at_unix,
                artifact.expires_at_unix
            ],
        )
        .with_context(|| format!("Failed saving session for {portal_id}"))?;
        Ok(())
    }
}

struct SessionCell {
    state: SessionState,
    epoch: u64,
    current: Option<SessionHandle>,
    store_checked: bool,
}

/// Owns one portal's session lifecycle. The cell mutex is held across the
/// whole login await, which is what makes concurrent callers single-flight:
/// whoever arrives while a login runs queues on the lock and then observes
/// the settled Valid/Failed state instead of starting its own attempt.
pub struct SessionManager {
    portal_id: String,
    adapter: Arc<dyn PortalAdapter>,
    store: Option<Arc<SessionStore>>,
    login_timeout: Duration,
    cell: Mutex<SessionCell>,
}

impl SessionManager {
    pub fn new(
        adapter: Arc<dyn PortalAdapter>,
        store: Option<Arc<SessionStore>>,
        login_timeout: Duration,
    ) -> Self {
        Self {
            portal_id: adapter.portal_id().to_string(),
            adapter,
            store,
            login_timeout,
            cell: Mutex::new(SessionCell {
                state: SessionState::Unset,
                epoch: 0,
                current: None,
                store_checked: false,
            }),
        }
    }

    pub fn portal_id(&self) -> &str {
        &self.portal_id
    }

    /// Produce a currently-valid session handle, logging in if needed.
    /// A settled login failure is returned to every caller until
    /// `invalidate` requests a fresh attempt.
    pub async fn ensure_session(&self) -> Result<SessionHandle, AuthError> {
        let mut cell = self.cell.lock().await;

        if matches!(cell.state, SessionState::Valid) {
            let fresh = cell
                .current
                .as_ref()
                .filter(|handle| !handle.artifact.is_past_expiry_hint())
                .cloned();
            match fresh {
                Some(handle) => return Ok(handle),
                None => {
                    println!(
                        "{}: session is past its expiry hint; refreshing",
                        self.portal_id
                    );
                    cell.state = SessionState::Expired;
                    cell.current = None;
                }
            }
        }

        if let SessionState::Failed(err) = &cell.state {
            return Err(err.clone());
        }

        if matches!(cell.state, SessionState::Unset) && !cell.store_checked {
            cell.store_checked = true;
            if let Some(handle) = self.restore_from_store(&mut cell).await {
                return Ok(handle);
            }
        }

        self.login_locked(&mut cell).await
    }

    /// Try to revive a persisted artifact. Any store or probe trouble is
    /// reported and treated as "no usable session".
    async fn restore_from_store(&self, cell: &mut SessionCell) -> Option<SessionHandle> {
        let store = self.store.as_ref()?;
        let artifact = match store.load(&self.portal_id) {
            Ok(Some(artifact)) => artifact,
            Ok(None) => return None,
            Err(err) => {
                println!(
                    "{}: could not load stored session ({err:#}); logging in fresh",
                    self.portal_id
                );
                return None;
            }
        };
        if artifact.is_past_expiry_hint() {
            println!(
                "{}: stored session is past its expiry hint; logging in fresh",
                self.portal_id
            );
            return None;
        }

        let candidate = SessionHandle {
            epoch: cell.epoch + 1,
            artifact: Arc::new(artifact),
        };
        match timeout(self.login_timeout, self.adapter.check_session(&candidate)).await {
            Ok(Ok(SessionProbe::Valid)) => {
                println!("{}: stored session is still valid", self.portal_id);
                cell.epoch += 1;
                cell.current = Some(candidate.clone());
                cell.state = SessionState::Valid;
                Some(candidate)
            }
            Ok(Ok(SessionProbe::Expired)) => {
                println!("{}: stored session has expired", self.portal_id);
                None
            }
            Ok(Err(err)) => {
                println!(
                    "{}: session probe failed ({err}); treating stored session as expired",
                    self.portal_id
                );
                None
            }
            Err(_) => {
                println!(
                    "{}: session probe timed out; treating stored session as expired",
                    self.portal_id
                );
                None
            }
        }
    }

    async fn login_locked(&self, cell: &mut SessionCell) -> Result<SessionHandle, AuthError> {
        cell.state = SessionState::Authenticating;
        cell.current = None;
        println!("{}: authenticating...", self.portal_id);

        let artifact = match timeout(self.login_timeout, self.adapter.login()).await {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(err)) => {
                cell.state = SessionState::Failed(err.clone());
                return Err(err);
            }
            Err(_) => {
                let err = AuthError::LoginTimeout {
                    portal: self.portal_id.clone(),
                    timeout: self.login_timeout,
                };
                cell.state = SessionState::Failed(err.clone());
                return Err(err);
            }
        };

        if let Some(store) = &self.store {
            if let Err(err) = store.save(&self.portal_id, &artifact) {
                println!(
                    "{}: could not persist session ({err:#}); continuing with the in-memory one",
                    self.portal_id
                );
            }
        }

        cell.epoch += 1;
        let handle = SessionHandle {
            epoch: cell.epoch,
            artifact: Arc::new(artifact),
        };
        cell.current = Some(handle.clone());
        cell.state = SessionState::Valid;
        println!("{}: session established", self.portal_id);
        Ok(handle)
    }

    /// Force the next `ensure_session` to authenticate again. Also the
    /// explicit "try again" signal after a settled login failure.
    pub async fn invalidate(&self) {
        let mut cell = self.cell.lock().await;
        cell.state = SessionState::Expired;
        cell.current = None;
    }

    /// Epoch-guarded invalidation: a job reporting expiry on a session that
    /// has already been replaced must not kill the replacement.
    pub async fn invalidate_if_current(&self, handle: &SessionHandle) {
        let mut cell = self.cell.lock().await;
        if cell.epoch == handle.epoch && matches!(cell.state, SessionState::Valid) {
            cell.state = SessionState::Expired;
            cell.current = None;
        }
    }

    /// Run `operation` with a valid session; on a classified session-expiry
    /// failure, refresh once and retry once. A second auth failure (or any
    /// other error kind) surfaces unmodified.
    pub async fn with_retry_on_auth_failure<T, F, Fut>(
        &self,
        operation: F,
    ) -> Result<T, ClassifiedError>
    where
        F: Fn(SessionHandle) -> Fut,
        Fut: Future<Output = Result<T, ClassifiedError>>,
    {
        let handle = self.ensure_session().await?;
        match operation(handle.clone()).await {
            Err(err) if err.is_auth_expired() => {
                println!(
                    "{}: request hit an expired session; refreshing and retrying once",
                    self.portal_id
                );
                self.invalidate_if_current(&handle).await;
                let fresh = self.ensure_session().await?;
                operation(fresh).await
            }
            other => other,
        }
    }
}
