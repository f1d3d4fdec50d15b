//! In-memory lifecycle service.
//!
//! Every client handed out by a `MockClientFactory` shares the factory's
//! record table and call log, so tests can seed remote state, inject failures
//! and assert on the calls a reconciliation pass made.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

use super::{
    ClientFactory, ClientOptions, CreateRequest, MicrovmClient, RemoteError, RemoteRecord,
    RemoteState,
};

/// A call observed by the mock service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    Connect(String),
    Get(String),
    Create(String),
    Delete(String),
    Close,
}

struct Entry {
    name: String,
    record: RemoteRecord,
}

struct MockState {
    /// Keyed by UID.
    records: BTreeMap<String, Entry>,
    calls: Vec<RemoteCall>,
    last_options: Option<ClientOptions>,
    fail_connect: bool,
    fail_get: bool,
    fail_create: bool,
    fail_delete: bool,
    created_state: RemoteState,
    delete_removes: bool,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            calls: Vec::new(),
            last_options: None,
            fail_connect: false,
            fail_get: false,
            fail_create: false,
            fail_delete: false,
            created_state: RemoteState::Pending,
            delete_removes: false,
        }
    }
}

impl MockState {
    fn find_uid(&self, id: &str) -> Option<String> {
        if self.records.contains_key(id) {
            return Some(id.to_string());
        }
        self.records
            .iter()
            .find(|(_, entry)| entry.name == id)
            .map(|(uid, _)| uid.clone())
    }
}

fn injected(operation: &str) -> RemoteError {
    RemoteError::Api {
        status: 503,
        message: format!("mock {operation} configured to fail"),
    }
}

/// Mock client factory for testing and development.
#[derive(Clone, Default)]
pub struct MockClientFactory {
    state: Arc<Mutex<MockState>>,
}

impl MockClientFactory {
    /// Create an empty mock service. Created records start out `PENDING`.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seed a record as if it had been created earlier. Returns its UID.
    pub fn insert(&self, name: &str, state: RemoteState) -> String {
        let uid = Uuid::new_v4().to_string();
        self.state().records.insert(
            uid.clone(),
            Entry {
                name: name.to_string(),
                record: RemoteRecord {
                    uid: uid.clone(),
                    state,
                    spec: serde_json::Value::Null,
                },
            },
        );
        uid
    }

    /// Move a record to another lifecycle state. Returns false if unknown.
    pub fn set_state(&self, id: &str, state: RemoteState) -> bool {
        let mut guard = self.state();
        match guard.find_uid(id) {
            Some(uid) => {
                if let Some(entry) = guard.records.get_mut(&uid) {
                    entry.record.state = state;
                }
                true
            }
            None => false,
        }
    }

    /// Drop a record, as the service does once an asynchronous delete finishes.
    pub fn remove(&self, id: &str) -> bool {
        let mut guard = self.state();
        match guard.find_uid(id) {
            Some(uid) => guard.records.remove(&uid).is_some(),
            None => false,
        }
    }

    /// Look up a record by UID or name.
    pub fn record(&self, id: &str) -> Option<RemoteRecord> {
        let guard = self.state();
        let uid = guard.find_uid(id)?;
        guard.records.get(&uid).map(|entry| entry.record.clone())
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state().records.is_empty()
    }

    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn create_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::Create(_)))
    }

    pub fn delete_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::Delete(_)))
    }

    pub fn get_calls(&self) -> usize {
        self.count(|call| matches!(call, RemoteCall::Get(_)))
    }

    fn count(&self, predicate: impl Fn(&RemoteCall) -> bool) -> usize {
        self.state().calls.iter().filter(|call| predicate(call)).count()
    }

    /// Options passed to the most recent `connect`.
    pub fn last_options(&self) -> Option<ClientOptions> {
        self.state().last_options.clone()
    }

    pub fn fail_connect(&self, fail: bool) {
        self.state().fail_connect = fail;
    }

    pub fn fail_get(&self, fail: bool) {
        self.state().fail_get = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.state().fail_create = fail;
    }

    pub fn fail_delete(&self, fail: bool) {
        self.state().fail_delete = fail;
    }

    /// State assigned to records made by `create`.
    pub fn set_created_state(&self, state: RemoteState) {
        self.state().created_state = state;
    }

    /// When true, `delete` removes the record at once instead of moving it
    /// to `DELETING`.
    pub fn set_delete_removes(&self, removes: bool) {
        self.state().delete_removes = removes;
    }
}

impl ClientFactory for MockClientFactory {
    fn connect(
        &self,
        endpoint: &str,
        options: ClientOptions,
    ) -> Result<Box<dyn MicrovmClient>, RemoteError> {
        let mut guard = self.state();
        guard.calls.push(RemoteCall::Connect(endpoint.to_string()));
        if guard.fail_connect {
            return Err(RemoteError::InvalidConfig(
                "mock client factory configured to fail".to_string(),
            ));
        }
        guard.last_options = Some(options);

        Ok(Box::new(MockMicrovmClient {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Client handed out by `MockClientFactory`.
pub struct MockMicrovmClient {
    state: Arc<Mutex<MockState>>,
}

impl MockMicrovmClient {
    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl MicrovmClient for MockMicrovmClient {
    async fn get(&self, id: &str) -> Result<RemoteRecord, RemoteError> {
        let mut guard = self.state();
        guard.calls.push(RemoteCall::Get(id.to_string()));
        if guard.fail_get {
            return Err(injected("get"));
        }

        let uid = guard
            .find_uid(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        guard
            .records
            .get(&uid)
            .map(|entry| entry.record.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn create(&self, request: &CreateRequest) -> Result<RemoteRecord, RemoteError> {
        let mut guard = self.state();
        guard.calls.push(RemoteCall::Create(request.id.clone()));
        if guard.fail_create {
            return Err(injected("create"));
        }

        let record = RemoteRecord {
            uid: Uuid::new_v4().to_string(),
            state: guard.created_state.clone(),
            spec: serde_json::to_value(request)?,
        };
        debug!(uid = %record.uid, name = %request.id, "Mock microvm created");

        guard.records.insert(
            record.uid.clone(),
            Entry {
                name: request.id.clone(),
                record: record.clone(),
            },
        );
        Ok(record)
    }

    async fn delete(&self, id: &str) -> Result<(), RemoteError> {
        let mut guard = self.state();
        guard.calls.push(RemoteCall::Delete(id.to_string()));
        if guard.fail_delete {
            return Err(injected("delete"));
        }

        let uid = guard
            .find_uid(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        if guard.delete_removes {
            guard.records.remove(&uid);
        } else if let Some(entry) = guard.records.get_mut(&uid) {
            entry.record.state = RemoteState::Deleting;
        }
        Ok(())
    }

    async fn close(&self) {
        self.state().calls.push(RemoteCall::Close);
    }
}
