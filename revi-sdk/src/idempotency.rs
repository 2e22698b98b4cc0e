//! Deduplication of concurrent and replayed submissions.
//!
//! Given `(key, op)`: if an operation for `key` is already in flight, the
//! caller is attached to its pending result; if one settled recently, the
//! memoized result is returned; otherwise `op` runs and its settled result
//! is kept for a TTL. Different callers with the same key observe identical
//! results and `op` runs exactly once.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use revi::error::AgentResult;
use sha2::{Digest, Sha256};
use tokio::time::Instant;

/// Default retention of settled results.
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);

type SharedOutcome<T> = Shared<BoxFuture<'static, Arc<AgentResult<T>>>>;

enum Entry<T: Clone> {
    InFlight(SharedOutcome<T>),
    Settled {
        result: Arc<AgentResult<T>>,
        expires_at: Instant,
    },
}

/// Keyed in-flight sharing plus TTL memoization of settled results.
pub struct IdempotencyManager<T: Clone + Send + Sync + 'static> {
    entries: Arc<Mutex<HashMap<String, Entry<T>>>>,
    ttl: Duration,
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for IdempotencyManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys = self.entries.lock().map(|map| map.len()).unwrap_or(0);
        f.debug_struct("IdempotencyManager")
            .field("keys", &keys)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> IdempotencyManager<T> {
    /// A manager retaining settled results for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        IdempotencyManager {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Run `op` under `key`, or join/replay an existing execution.
    pub async fn execute<F>(&self, key: &str, op: F) -> AgentResult<T>
    where
        F: Future<Output = AgentResult<T>> + Send + 'static,
    {
        let shared = {
            let mut entries = match self.entries.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            entries.retain(|_, entry| match entry {
                Entry::InFlight(_) => true,
                Entry::Settled { expires_at, .. } => *expires_at > now,
            });

            match entries.get(key) {
                Some(Entry::InFlight(shared)) => shared.clone(),
                Some(Entry::Settled { result, .. }) => return (**result).clone(),
                None => {
                    let handle = Arc::clone(&self.entries);
                    let owned_key = key.to_string();
                    let ttl = self.ttl;
                    let shared = async move {
                        let result = Arc::new(op.await);
                        if let Ok(mut entries) = handle.lock() {
                            entries.insert(
                                owned_key,
                                Entry::Settled {
                                    result: Arc::clone(&result),
                                    expires_at: Instant::now() + ttl,
                                },
                            );
                        }
                        result
                    }
                    .boxed()
                    .shared();
                    entries.insert(key.to_string(), Entry::InFlight(shared.clone()));
                    shared
                }
            }
        };

        (*shared.await).clone()
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }
}

impl<T: Clone + Send + Sync + 'static> Default for IdempotencyManager<T> {
    fn default() -> Self {
        Self::new(DEFAULT_RESULT_TTL)
    }
}

/// The default key for callers that do not supply one: operation name plus a
/// stable digest of the payload.
pub fn default_key(operation: &str, payload: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{:02x}", byte));
    }
    format!("{}:{}", operation, hex)
}

#[cfg(test)]
mod tests {
    use super::*;
    use revi::error::AgentError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_callers_share_one_execution() {
        let manager: Arc<IdempotencyManager<u32>> = Arc::new(IdempotencyManager::default());
        let runs = Arc::new(AtomicUsize::new(0));
        let (gate_tx, gate_rx) = tokio::sync::oneshot::channel::<()>();

        let first = {
            let manager = Arc::clone(&manager);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                manager
                    .execute("submit:abc", async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        let _ = gate_rx.await;
                        Ok(7)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let second = {
            let manager = Arc::clone(&manager);
            let runs = Arc::clone(&runs);
            tokio::spawn(async move {
                manager
                    .execute("submit:abc", async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        Ok(99)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let _ = gate_tx.send(());
        assert_eq!(first.await.unwrap(), Ok(7));
        assert_eq!(second.await.unwrap(), Ok(7));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn settled_results_replay_within_ttl() {
        let manager: IdempotencyManager<u32> = IdempotencyManager::default();
        let runs = AtomicUsize::new(0);

        for _ in 0..3 {
            let value = manager
                .execute("submit:abc", {
                    let count = runs.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(count as u32) }
                })
                .await;
            assert_eq!(value, Ok(0));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn settled_results_expire_after_ttl() {
        let manager: IdempotencyManager<u32> = IdempotencyManager::new(Duration::from_secs(60));

        assert_eq!(manager.execute("k", async { Ok(1) }).await, Ok(1));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(manager.execute("k", async { Ok(2) }).await, Ok(2));
    }

    #[tokio::test]
    async fn failures_are_shared_too() {
        let manager: IdempotencyManager<u32> = IdempotencyManager::default();
        let result = manager
            .execute("k", async { Err(AgentError::ServerTerminal { status: 400 }) })
            .await;
        assert_eq!(result, Err(AgentError::ServerTerminal { status: 400 }));

        // Memoized failure replays without re-running.
        let replay = manager.execute("k", async { Ok(5) }).await;
        assert_eq!(replay, Err(AgentError::ServerTerminal { status: 400 }));
    }

    #[test]
    fn default_keys_are_stable_and_distinct() {
        let a = default_key("capture-error", b"{\"n\":1}");
        let b = default_key("capture-error", b"{\"n\":1}");
        let c = default_key("capture-error", b"{\"n\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("capture-error:"));
    }
}
