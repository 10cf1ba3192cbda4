use crate::error::{Error, Result};
use crate::id::DocId;
use crate::path::StoragePath;
use crate::store::{File, FileStore, StoreOp, TransactionResult, TransactionSpec};
use async_trait::async_trait;
use futures::channel::oneshot;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

/// An in-memory [`FileStore`].
///
/// Implements the complete transactional contract, including suspending
/// `WhenPathNot` conditions, so the engine can run self-contained. One
/// process owns the map; cross-process sharing is a property of durable
/// stores, not this one.
#[derive(Default)]
pub struct MemoryFileStore {
    files: Mutex<HashMap<DocId, Arc<MemoryFile>>>,
}

impl MemoryFileStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn open(&self, id: &DocId) -> Result<Arc<dyn File>> {
        let mut files = self.files.lock();
        let file: Arc<dyn File> = files.entry(id.clone()).or_default().clone();
        Ok(file)
    }
}

/// One in-memory transactional file.
#[derive(Default)]
pub struct MemoryFile {
    // None until created
    state: Mutex<Option<BTreeMap<StoragePath, Vec<u8>>>>,
    watchers: Mutex<Vec<oneshot::Sender<()>>>,
}

enum Eval {
    Done { result: TransactionResult, mutated: bool },
    Wait,
}

impl MemoryFile {
    /// Creates an empty file handle; `create` must run before `transact`.
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self) {
        for watcher in self.watchers.lock().drain(..) {
            watcher.send(()).ok();
        }
    }

    /// Evaluates a spec against the map. Preconditions and wait
    /// conditions see the state at entry, reads see the state before any
    /// of the spec's own mutations, and mutations apply only after every
    /// condition has passed.
    fn eval(spec: &TransactionSpec, map: &mut BTreeMap<StoragePath, Vec<u8>>) -> Result<Eval> {
        for op in spec.ops() {
            match op {
                StoreOp::CheckPathPresent(path) => {
                    if !map.contains_key(path) {
                        return Err(Error::PathNotPresent(path.clone()));
                    }
                }
                StoreOp::CheckPathAbsent(path) => {
                    if map.contains_key(path) {
                        return Err(Error::PathNotEmpty(path.clone()));
                    }
                }
                StoreOp::CheckPathIs(path, value) => {
                    if map.get(path) != Some(value) {
                        return Err(Error::PathMismatch(path.clone()));
                    }
                }
                StoreOp::WhenPathNot(path, value) => {
                    if map.get(path) == value.as_ref() {
                        return Ok(Eval::Wait);
                    }
                }
                _ => {}
            }
        }
        let mut result = TransactionResult::default();
        for op in spec.ops() {
            match op {
                StoreOp::ReadPath(path) => {
                    if let Some(value) = map.get(path) {
                        result.insert_value(path.clone(), value.clone());
                    }
                }
                StoreOp::ListPath(prefix) => {
                    for path in map.keys() {
                        if path.is_under(prefix) {
                            result.insert_listing(path.clone());
                        }
                    }
                }
                _ => {}
            }
        }
        let mut mutated = false;
        for op in spec.ops() {
            match op {
                StoreOp::DeleteAll => {
                    map.clear();
                    mutated = true;
                }
                StoreOp::WritePath(path, value) => {
                    map.insert(path.clone(), value.clone());
                    mutated = true;
                }
                StoreOp::DeletePath(path) => {
                    map.remove(path);
                    mutated = true;
                }
                _ => {}
            }
        }
        Ok(Eval::Done { result, mutated })
    }
}

#[async_trait]
impl File for MemoryFile {
    async fn exists(&self) -> Result<bool> {
        Ok(self.state.lock().is_some())
    }

    async fn create(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.is_none() {
            *state = Some(BTreeMap::new());
        }
        Ok(())
    }

    async fn transact(&self, spec: TransactionSpec) -> Result<TransactionResult> {
        let deadline = Instant::now() + spec.timeout();
        loop {
            let wait = {
                let mut state = self.state.lock();
                let map = state.as_mut().ok_or(Error::NotFound)?;
                match Self::eval(&spec, map)? {
                    Eval::Done { result, mutated } => {
                        drop(state);
                        if mutated {
                            self.notify();
                        }
                        return Ok(result);
                    }
                    Eval::Wait => {
                        // register under the state lock so a commit between
                        // evaluation and registration cannot be missed
                        let (tx, rx) = oneshot::channel();
                        self.watchers.lock().push(tx);
                        rx
                    }
                }
            };
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::TimedOut(spec.timeout()));
            }
            if async_std::future::timeout(deadline - now, wait).await.is_err() {
                return Err(Error::TimedOut(spec.timeout()));
            }
        }
    }
}
