//! Deduplication of concurrent operations on the same key.
//!
//! The first caller for a key spawns the operation on the runtime; later callers for the same
//! key await the same shared result. The key is removed once the operation finishes (success or
//! failure), so a failed operation can be retried by the next caller. Because the operation runs
//! as its own task it completes even if every caller gives up waiting.
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

type Pending<V> = Shared<BoxFuture<'static, Result<V>>>;

pub struct SingleFlight<K, V> {
    pending: Arc<Mutex<HashMap<K, Pending<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        SingleFlight {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> SingleFlight<K, V> {
        SingleFlight::default()
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_pending(&self, key: &K) -> bool {
        self.pending
            .lock()
            .map(|p| p.contains_key(key))
            .unwrap_or(false)
    }

    /// Run `op` for `key` unless an operation for `key` is already in flight, in which case the
    /// result of that operation is returned.
    pub async fn run<F>(&self, key: K, op: F) -> Result<V>
    where
        F: Future<Output = Result<V>> + Send + 'static,
    {
        let fut = {
            let mut pending = self
                .pending
                .lock()
                .map_err(|_| Error::Invalid("single flight map poisoned".into()))?;

            match pending.get(&key) {
                Some(fut) => fut.clone(),
                None => {
                    let map = Arc::clone(&self.pending);
                    let k = key.clone();

                    // The task can not remove its key before it is inserted below since the map
                    // is locked until then.
                    let task = tokio::spawn(async move {
                        let r = op.await;
                        if let Ok(mut m) = map.lock() {
                            m.remove(&k);
                        }
                        r
                    });

                    let fut = async move {
                        match task.await {
                            Ok(r) => r,
                            Err(e) => Err(Error::Io(Arc::new(io::Error::new(
                                io::ErrorKind::Other,
                                format!("background task failed: {e}"),
                            )))),
                        }
                    }
                    .boxed()
                    .shared();

                    pending.insert(key, fut.clone());
                    fut
                }
            }
        };

        fut.await
    }
}
