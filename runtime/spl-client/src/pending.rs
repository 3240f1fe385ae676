//! Outstanding requests awaiting a response from the execution context.

use crate::error::{Error, Result};
use spl_db::{Reply, Response};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;
use tracing::{trace, warn};

pub type Settlement = oneshot::Receiver<Result<Reply>>;

/// Request ids are `max(outstanding) + 1`, starting at 0; a settled id may be
/// handed out again.
#[derive(Debug, Default)]
pub struct PendingRequests {
    inner: Mutex<HashMap<u64, oneshot::Sender<Result<Reply>>>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Reply>>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> (u64, Settlement) {
        let mut pending = self.lock();
        let id = pending.keys().max().map_or(0, |max| max + 1);
        let (sender, receiver) = oneshot::channel();
        pending.insert(id, sender);
        (id, receiver)
    }

    /// Completes the request named by the response.
    pub fn settle(&self, response: Response) {
        let Some(sender) = self.lock().remove(&response.request_id) else {
            warn!(request_id = response.request_id, "response for unknown request");
            return;
        };
        let outcome = if response.is_error() {
            Err(Error::from_response(&response))
        } else {
            Ok(response.result.unwrap_or(Reply::Value(spl_db::Value::Null)))
        };
        trace!(
            request_id = response.request_id,
            transfer = response.transfer.len(),
            "request settled"
        );
        // The caller may have dropped its future.
        let _ = sender.send(outcome);
    }

    pub fn fail(&self, request_id: u64, err: Error) {
        if let Some(sender) = self.lock().remove(&request_id) {
            let _ = sender.send(Err(err));
        }
    }

    /// Rejects everything outstanding with [`Error::Terminated`].
    pub fn abandon_all(&self) {
        let drained: Vec<_> = self.lock().drain().collect();
        if !drained.is_empty() {
            warn!(count = drained.len(), "abandoning pending requests");
        }
        for (_, sender) in drained {
            let _ = sender.send(Err(Error::Terminated));
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
