//! SQLite-based resource store.
//!
//! Resources are stored as JSON documents keyed by (namespace, name). Every
//! mutating call runs in a transaction, bumps the resource version and emits a
//! watch event after commit.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::broadcast;
use tracing::debug;

use crate::api::{Microvm, ObjectKey};

use super::{MicrovmPatch, Secret, Store, StoreError, WatchEvent};

/// Buffered watch events per subscriber before it starts lagging.
const WATCH_CAPACITY: usize = 1024;

/// SQLite resource store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    events: broadcast::Sender<WatchEvent>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::from_connection(conn)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_schema(&conn)?;
        let (events, _) = broadcast::channel(WATCH_CAPACITY);
        Ok(Self {
            conn: Mutex::new(conn),
            events,
        })
    }

    /// Initialize database schema.
    fn init_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS microvms (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (namespace, name)
            );

            CREATE TABLE IF NOT EXISTS secrets (
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (namespace, name)
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Invalid("store connection lock poisoned".to_string()))
    }

    fn read(conn: &Connection, key: &ObjectKey) -> Result<Option<Microvm>, StoreError> {
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM microvms WHERE namespace = ?1 AND name = ?2",
                params![key.namespace, key.name],
                |row| row.get(0),
            )
            .optional()?;

        body.map(|b| serde_json::from_str(&b))
            .transpose()
            .map_err(Into::into)
    }

    fn write(conn: &Connection, microvm: &Microvm) -> Result<(), StoreError> {
        let body = serde_json::to_string(microvm)?;
        conn.execute(
            r#"
            INSERT INTO microvms (namespace, name, body, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(namespace, name) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            "#,
            params![
                microvm.metadata.namespace,
                microvm.metadata.name,
                body,
                Utc::now().timestamp(),
            ],
        )?;
        Ok(())
    }

    fn remove(conn: &Connection, key: &ObjectKey) -> Result<(), StoreError> {
        conn.execute(
            "DELETE FROM microvms WHERE namespace = ?1 AND name = ?2",
            params![key.namespace, key.name],
        )?;
        Ok(())
    }

    fn notify(&self, event: WatchEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn get(&self, key: &ObjectKey) -> Result<Microvm, StoreError> {
        let conn = self.conn()?;
        Self::read(&conn, key)?.ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn patch(
        &self,
        key: &ObjectKey,
        patch: &MicrovmPatch,
    ) -> Result<Option<Microvm>, StoreError> {
        let (result, event) = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;

            let mut current =
                Self::read(&tx, key)?.ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            if let Some(expected) = patch.resource_version {
                if expected != current.metadata.resource_version {
                    return Err(StoreError::Conflict {
                        key: key.to_string(),
                        expected,
                        actual: current.metadata.resource_version,
                    });
                }
            }

            patch.apply_to(&mut current)?;
            current.metadata.resource_version += 1;

            let outcome = if current.is_deleting() && current.metadata.finalizers.is_empty() {
                Self::remove(&tx, key)?;
                debug!(namespace = %key.namespace, name = %key.name, "Last finalizer released, resource removed");
                (None, WatchEvent::Deleted(key.clone()))
            } else {
                Self::write(&tx, &current)?;
                (Some(current), WatchEvent::Applied(key.clone()))
            };

            tx.commit()?;
            outcome
        };

        self.notify(event);
        Ok(result)
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, StoreError> {
        let conn = self.conn()?;
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM secrets WHERE namespace = ?1 AND name = ?2",
                params![namespace, name],
                |row| row.get(0),
            )
            .optional()?;

        let data = data.ok_or_else(|| StoreError::NotFound(format!("secret {namespace}/{name}")))?;
        Ok(Secret {
            namespace: namespace.to_string(),
            name: name.to_string(),
            data: serde_json::from_str(&data)?,
        })
    }

    async fn apply(&self, microvm: Microvm) -> Result<Microvm, StoreError> {
        let key = microvm.key();
        if key.namespace.is_empty() || key.name.is_empty() {
            return Err(StoreError::Invalid(
                "namespace and name are required".to_string(),
            ));
        }

        let stored = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;

            let stored = match Self::read(&tx, &key)? {
                Some(mut existing) => {
                    if existing.spec != microvm.spec {
                        existing.spec = microvm.spec;
                        existing.metadata.generation += 1;
                    }
                    existing.metadata.labels = microvm.metadata.labels;
                    existing.metadata.resource_version += 1;
                    existing
                }
                None => {
                    let mut created = microvm;
                    created.metadata.uid = uuid::Uuid::new_v4().to_string();
                    created.metadata.generation = 1;
                    created.metadata.resource_version = 1;
                    created.metadata.creation_timestamp = Some(Utc::now());
                    created.metadata.deletion_timestamp = None;
                    created
                }
            };

            Self::write(&tx, &stored)?;
            tx.commit()?;
            stored
        };

        self.notify(WatchEvent::Applied(key));
        Ok(stored)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        let event = {
            let mut conn = self.conn()?;
            let tx = conn.transaction()?;

            let mut current =
                Self::read(&tx, key)?.ok_or_else(|| StoreError::NotFound(key.to_string()))?;

            let event = if current.metadata.finalizers.is_empty() {
                Self::remove(&tx, key)?;
                WatchEvent::Deleted(key.clone())
            } else {
                if current.metadata.deletion_timestamp.is_none() {
                    current.metadata.deletion_timestamp = Some(Utc::now());
                    current.metadata.resource_version += 1;
                    Self::write(&tx, &current)?;
                }
                WatchEvent::Applied(key.clone())
            };

            tx.commit()?;
            event
        };

        self.notify(event);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ObjectKey>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT namespace, name FROM microvms ORDER BY namespace, name")?;

        let keys = stmt
            .query_map([], |row| {
                Ok(ObjectKey {
                    namespace: row.get(0)?,
                    name: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(keys)
    }

    async fn put_secret(&self, secret: Secret) -> Result<(), StoreError> {
        let data = serde_json::to_string(&secret.data)?;
        let conn = self.conn()?;
        conn.execute(
            r#"
            INSERT INTO secrets (namespace, name, data)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(namespace, name) DO UPDATE SET data = excluded.data
            "#,
            params![secret.namespace, secret.name, data],
        )?;
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
