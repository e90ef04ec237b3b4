//! Diff Coalescer: debounces `git status`/`git diff` invocations per
//! scope (a session or a worktree), guaranteeing at most one in-flight
//! computation per scope with a trailing edge so the most recent request
//! is always eventually served.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

#[derive(Default)]
struct ScopeState {
    in_flight: bool,
    trailing: bool,
}

pub struct DiffCoalescer {
    states: Mutex<HashMap<String, Arc<Mutex<ScopeState>>>>,
    debounce: Duration,
}

impl DiffCoalescer {
    pub fn new(debounce: Duration) -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            debounce,
        }
    }

    async fn state_for(&self, scope_id: &str) -> Arc<Mutex<ScopeState>> {
        let mut states = self.states.lock().await;
        states
            .entry(scope_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ScopeState::default())))
            .clone()
    }

    /// Request a recompute for `scope_id`. If nothing is in-flight, starts
    /// computing immediately, then — if another request arrived while the
    /// computation was running — runs `compute` again after the debounce,
    /// repeating until a run completes with no trailing request pending.
    /// If a computation is already in-flight, this just marks the
    /// trailing flag; the in-flight run's completion picks it up.
    pub async fn request<F>(&self, scope_id: &str, compute: F)
    where
        F: Fn() -> BoxFuture + Send + Sync + 'static,
    {
        let state = self.state_for(scope_id).await;
        let mut guard = state.lock().await;
        if guard.in_flight {
            guard.trailing = true;
            debug!(scope_id, "diff recompute already in-flight, marking trailing");
            return;
        }
        guard.in_flight = true;
        drop(guard);

        let debounce = self.debounce;
        let compute = Arc::new(compute);
        tokio::spawn(async move {
            loop {
                compute().await;

                let mut guard = state.lock().await;
                if guard.trailing {
                    guard.trailing = false;
                    drop(guard);
                    tokio::time::sleep(debounce).await;
                    continue;
                } else {
                    guard.in_flight = false;
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn single_request_runs_once() {
        let coalescer = DiffCoalescer::new(Duration::from_millis(20));
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        coalescer
            .request("scope1", move || {
                let runs = runs_clone.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_requests_mark_trailing_not_duplicate_runs() {
        let coalescer = Arc::new(DiffCoalescer::new(Duration::from_millis(10)));
        let runs = Arc::new(AtomicUsize::new(0));

        let runs_clone = runs.clone();
        coalescer
            .request("scope1", move || {
                let runs = runs_clone.clone();
                Box::pin(async move {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        // A second request while the first is in-flight should not spawn
        // a second computation; it only sets `trailing`, so the total
        // settles at 2 (the initial run plus exactly one trailing rerun),
        // never more.
        let runs_clone = runs.clone();
        coalescer
            .request("scope1", move || {
                let runs = runs_clone.clone();
                Box::pin(async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                })
            })
            .await;

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }
}
