//! Subscription registry: at most one handler per request type.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use super::request::RequestType;
use crate::error::BusError;

/// A registered handler as reported by [`Bus::handlers`](super::Bus::handlers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    /// The request type the handler serves.
    pub request_type: RequestType,
    /// Type name of the handler's result.
    pub result_type: &'static str,
}

struct Entry {
    id: u64,
    info: HandlerInfo,
    cancel: CancellationToken,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Reserve `info.request_type` for a new subscription.
    ///
    /// An entry whose subscription was already cancelled no longer holds
    /// its request type, even while its receive loop is still winding down.
    /// Returns the registration id used to remove exactly this entry later.
    pub(crate) fn insert(
        &self,
        info: HandlerInfo,
        cancel: CancellationToken,
    ) -> Result<u64, BusError> {
        let key = info.request_type.to_string();
        let mut entries = self.lock();
        if entries.get(&key).is_some_and(Entry::is_live) {
            return Err(BusError::DuplicateHandler(key));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        entries.insert(key, Entry { id, info, cancel });
        Ok(id)
    }

    /// Remove the entry for `key` if it still belongs to registration `id`.
    pub(crate) fn remove(&self, key: &str, id: u64) -> bool {
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.id == id => {
                entries.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn contains(&self, request_type: &RequestType) -> bool {
        self.lock()
            .get(&request_type.to_string())
            .is_some_and(Entry::is_live)
    }

    pub(crate) fn infos(&self) -> Vec<HandlerInfo> {
        let mut infos: Vec<HandlerInfo> = self
            .lock()
            .values()
            .filter(|e| e.is_live())
            .map(|e| e.info.clone())
            .collect();
        infos.sort_by(|a, b| a.request_type.cmp(&b.request_type));
        infos
    }

    /// Cancel every registered subscription.
    pub(crate) fn cancel_all(&self) {
        for entry in self.lock().values() {
            entry.cancel.cancel();
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
