// sitebackup/src/test_support.rs
//! Deterministic doubles for the command runner and the object store.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backup::s3_upload::{BucketStatus, ObjectStatus, ObjectStore};
use crate::errors::{CommandError, StoreError};
use crate::utils::command::{CommandRunner, Invocation, RunLog};

#[derive(Debug, Default)]
struct RunnerState {
    invocations: Vec<Invocation>,
    failing: HashSet<String>,
}

/// Records every invocation and fails the programs it is told to fail.
///
/// Invocations with a stdout redirect get a small placeholder file, so later
/// stages have something to archive.
#[derive(Debug, Clone, Default)]
pub struct RecordingRunner {
    state: Arc<Mutex<RunnerState>>,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, RunnerState> {
        self.state.lock().expect("runner state poisoned")
    }

    pub fn fail_program(&self, program: &str) {
        self.lock().failing.insert(program.to_string());
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.lock().invocations.clone()
    }
}

impl CommandRunner for RecordingRunner {
    fn run(&self, invocation: &Invocation, _log: &RunLog) -> Result<(), CommandError> {
        let mut state = self.lock();
        state.invocations.push(invocation.clone());
        if state.failing.contains(&invocation.program) {
            return Err(CommandError::Exit {
                program: invocation.program.clone(),
                code: Some(1),
            });
        }
        if let Some(path) = &invocation.stdout {
            fs::write(path, format!("-- output of {}\n", invocation.program)).map_err(|source| {
                CommandError::Spawn {
                    program: invocation.program.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    EnsureBucket {
        bucket: String,
    },
    Exists {
        bucket: String,
        key: String,
    },
    Put {
        bucket: String,
        key: String,
        content_type: String,
        acl: String,
    },
}

#[derive(Debug, Default)]
struct StoreState {
    buckets: HashSet<String>,
    deny_bucket_head: bool,
    /// Stored length per object; `None` when the store reports no length.
    objects: HashMap<(String, String), Option<u64>>,
    probe_errors: HashMap<(String, String), u16>,
    failing_puts: HashSet<String>,
    dropped_puts: HashSet<String>,
    calls: Vec<StoreCall>,
}

/// In-memory object store with scriptable answers.
#[derive(Debug, Clone, Default)]
pub struct FakeStore {
    state: Arc<Mutex<StoreState>>,
}

impl FakeStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().expect("store state poisoned")
    }

    pub fn set_present(&self, bucket: &str, key: &str) {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), None);
    }

    pub fn set_present_with_size(&self, bucket: &str, key: &str, bytes: u64) {
        self.lock()
            .objects
            .insert((bucket.to_string(), key.to_string()), Some(bytes));
    }

    pub fn is_present(&self, bucket: &str, key: &str) -> bool {
        self.lock()
            .objects
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// HEAD on any bucket answers 403.
    pub fn deny_bucket_head(&self) {
        self.lock().deny_bucket_head = true;
    }

    /// HEAD on `key` answers with `status` instead of found/not found.
    pub fn set_probe_error(&self, bucket: &str, key: &str, status: u16) {
        self.lock()
            .probe_errors
            .insert((bucket.to_string(), key.to_string()), status);
    }

    /// Uploads of `key` fail as if the connection was reset.
    pub fn fail_put(&self, key: &str) {
        self.lock().failing_puts.insert(key.to_string());
    }

    /// Uploads of `key` report success but store nothing.
    pub fn drop_puts_of(&self, key: &str) {
        self.lock().dropped_puts.insert(key.to_string());
    }

    pub fn clear_failures(&self) {
        let mut state = self.lock();
        state.failing_puts.clear();
        state.probe_errors.clear();
        state.dropped_puts.clear();
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.lock().calls.clear();
    }
}

impl ObjectStore for FakeStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<BucketStatus, StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::EnsureBucket {
            bucket: bucket.to_string(),
        });
        if state.deny_bucket_head {
            Ok(BucketStatus::Unverified)
        } else if state.buckets.insert(bucket.to_string()) {
            Ok(BucketStatus::Created)
        } else {
            Ok(BucketStatus::Existing)
        }
    }

    async fn probe(&self, bucket: &str, key: &str) -> ObjectStatus {
        let mut state = self.lock();
        state.calls.push(StoreCall::Exists {
            bucket: bucket.to_string(),
            key: key.to_string(),
        });
        let id = (bucket.to_string(), key.to_string());
        if let Some(status) = state.probe_errors.get(&id) {
            return ObjectStatus::Error(StoreError::Service {
                operation: "HeadObject",
                target: format!("{}/{}", bucket, key),
                status: Some(*status),
                message: "scripted failure".to_string(),
            });
        }
        match state.objects.get(&id) {
            Some(bytes) => ObjectStatus::Present { bytes: *bytes },
            None => ObjectStatus::Absent,
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: &Path,
        content_type: &str,
        acl: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        state.calls.push(StoreCall::Put {
            bucket: bucket.to_string(),
            key: key.to_string(),
            content_type: content_type.to_string(),
            acl: acl.to_string(),
        });
        let bytes = fs::metadata(body)
            .ok()
            .filter(|meta| meta.is_file())
            .map(|meta| meta.len())
            .ok_or_else(|| StoreError::Body {
                path: body.to_path_buf(),
                message: "no such file".to_string(),
            })?;
        if state.failing_puts.contains(key) {
            return Err(StoreError::Transport {
                operation: "PutObject",
                target: format!("{}/{}", bucket, key),
                message: "connection reset by peer".to_string(),
            });
        }
        if !state.dropped_puts.contains(key) {
            state
                .objects
                .insert((bucket.to_string(), key.to_string()), Some(bytes));
        }
        Ok(())
    }
}
