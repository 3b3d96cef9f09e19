//! Long-poll watch manager.
//!
//! A waiter parks until a commit newer than its last-known revision touches
//! a matching path, its deadline elapses, or its caller cancels. Commit
//! fan-out happens after the writer lock is released; waiters observing the
//! same commit all see the same revision, in no particular order.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::{Stream, StreamExt};
use tokio::sync::oneshot;

use super::Repository;
use crate::{
    model::{Query, Revision, WatchFileResult, WatchRepoResult},
    pattern::PathPattern,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DELAY_ON_SUCCESS: Duration = Duration::from_secs(1);
const MAX_FAILED_COUNT: usize = 5; // Max base wait time 2 << 5 = 64 secs
const JITTER_RATE: f32 = 0.2;

/// What a waiter is listening for.
#[derive(Debug, Clone)]
pub(crate) enum WatchTarget {
    /// Any path matching the pattern.
    Pattern(PathPattern),
    /// Exactly this file path.
    File(String),
}

impl WatchTarget {
    pub(crate) fn matches(&self, path: &str) -> bool {
        match self {
            WatchTarget::Pattern(pattern) => pattern.matches(path),
            WatchTarget::File(file) => file == path,
        }
    }
}

struct Waiter {
    last_known: i32,
    target: WatchTarget,
    tx: oneshot::Sender<Revision>,
}

#[derive(Default)]
pub(crate) struct WatchManager {
    waiters: DashMap<u64, Waiter>,
    next_id: AtomicU64,
}

impl WatchManager {
    pub fn new() -> WatchManager {
        WatchManager::default()
    }

    /// Parks a new waiter. The receiver resolves with the first matching
    /// revision; dropping the returned id via [`deregister`](Self::deregister)
    /// cancels it.
    pub fn register(
        &self,
        last_known: i32,
        target: WatchTarget,
    ) -> (u64, oneshot::Receiver<Revision>) {
        let (tx, rx) = oneshot::channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.waiters.insert(
            id,
            Waiter {
                last_known,
                target,
                tx,
            },
        );
        (id, rx)
    }

    pub fn deregister(&self, id: u64) {
        self.waiters.remove(&id);
    }

    /// Fans a committed revision out to every matching waiter. Called after
    /// the writer lock is released.
    pub fn notify(&self, revision: Revision, changed_paths: &[String]) {
        let fired: Vec<u64> = self
            .waiters
            .iter()
            .filter(|entry| {
                revision.major() > entry.value().last_known
                    && changed_paths
                        .iter()
                        .any(|path| entry.value().target.matches(path))
            })
            .map(|entry| *entry.key())
            .collect();
        for id in fired {
            if let Some((_, waiter)) = self.waiters.remove(&id) {
                // The receiver may already have timed out; that is fine.
                let _ = waiter.tx.send(revision);
            }
        }
    }

    #[cfg(test)]
    pub fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}

/// The transport-level deadline, rounded up to the next whole second plus a
/// slack window, so a client-side timer never expires after the server
/// already answered 304.
pub(crate) fn effective_timeout(requested: Duration, slack: Duration) -> Duration {
    let mut seconds = requested.as_secs();
    if requested.subsec_nanos() > 0 {
        seconds += 1;
    }
    Duration::from_secs(seconds) + slack
}

fn delay_time_for(failed_count: usize) -> Duration {
    let base_time_ms = (2u64 << failed_count) * 1000;
    let jitter = (fastrand::f32() * JITTER_RATE * base_time_ms as f32) as u64;

    Duration::from_millis(base_time_ms + jitter)
}

struct RepoStreamState {
    repo: Arc<Repository>,
    path_pattern: String,
    last_known: Revision,
    failed_count: usize,
    success_delay: Option<Duration>,
}

/// Returns a stream which outputs a [`WatchRepoResult`] whenever the
/// repository has a new commit that contains changes for the files matched
/// by the given `path_pattern`.
pub(crate) fn watch_repo_stream(
    repo: Arc<Repository>,
    path_pattern: String,
) -> Pin<Box<dyn Stream<Item = WatchRepoResult> + Send>> {
    let init_state = RepoStreamState {
        repo,
        path_pattern,
        last_known: Revision::HEAD,
        failed_count: 0,
        success_delay: None,
    };
    futures::stream::unfold(init_state, |mut state| async move {
        if let Some(d) = state.success_delay.take() {
            tokio::time::sleep(d).await;
        }
        loop {
            let cancel = tokio_util::sync::CancellationToken::new();
            let resp = state
                .repo
                .watch_repo(state.last_known, &state.path_pattern, DEFAULT_TIMEOUT, &cancel)
                .await;
            let next_delay = match resp {
                Ok(Some(result)) => {
                    state.last_known = result.revision;
                    state.failed_count = 0;
                    state.success_delay = Some(DELAY_ON_SUCCESS);

                    return Some((result, state));
                }
                Ok(None) => {
                    state.failed_count = 0;
                    Duration::from_secs(1)
                }
                Err(e) => {
                    log::debug!("watch request error: {}", e);
                    if state.failed_count < MAX_FAILED_COUNT {
                        state.failed_count += 1;
                    }
                    delay_time_for(state.failed_count)
                }
            };
            tokio::time::sleep(next_delay).await;
        }
    })
    .boxed()
}

struct FileStreamState {
    repo: Arc<Repository>,
    query: Query,
    last_known: Revision,
    failed_count: usize,
    success_delay: Option<Duration>,
}

/// Returns a stream which outputs a [`WatchFileResult`] whenever the result
/// of the given [`Query`] changes.
pub(crate) fn watch_file_stream(
    repo: Arc<Repository>,
    query: Query,
) -> Pin<Box<dyn Stream<Item = WatchFileResult> + Send>> {
    let init_state = FileStreamState {
        repo,
        query,
        last_known: Revision::HEAD,
        failed_count: 0,
        success_delay: None,
    };
    futures::stream::unfold(init_state, |mut state| async move {
        if let Some(d) = state.success_delay.take() {
            tokio::time::sleep(d).await;
        }
        loop {
            let cancel = tokio_util::sync::CancellationToken::new();
            let resp = state
                .repo
                .watch_file(state.last_known, &state.query, DEFAULT_TIMEOUT, &cancel)
                .await;
            let next_delay = match resp {
                Ok(Some(result)) => {
                    state.last_known = result.revision;
                    state.failed_count = 0;
                    state.success_delay = Some(DELAY_ON_SUCCESS);

                    return Some((result, state));
                }
                Ok(None) => {
                    state.failed_count = 0;
                    Duration::from_secs(1)
                }
                Err(e) => {
                    log::debug!("watch request error: {}", e);
                    if state.failed_count < MAX_FAILED_COUNT {
                        state.failed_count += 1;
                    }
                    delay_time_for(state.failed_count)
                }
            };
            tokio::time::sleep(next_delay).await;
        }
    })
    .boxed()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_notify_monotone_and_matching() {
        let manager = WatchManager::new();
        let (_stale_id, mut stale_rx) = manager.register(
            5,
            WatchTarget::Pattern(PathPattern::compile("/**").unwrap()),
        );
        let (_misses_id, mut misses_rx) = manager.register(
            2,
            WatchTarget::Pattern(PathPattern::compile("*.json").unwrap()),
        );
        let (_hits_id, mut hits_rx) = manager.register(
            2,
            WatchTarget::Pattern(PathPattern::compile("*.txt").unwrap()),
        );

        manager.notify(Revision::from(3), &["/b.txt".to_string()]);

        // Revision 3 is not newer than last-known 5.
        assert!(stale_rx.try_recv().is_err());
        // No changed path matches *.json.
        assert!(misses_rx.try_recv().is_err());
        assert_eq!(hits_rx.try_recv().unwrap(), Revision::from(3));
        assert_eq!(manager.waiter_count(), 2);
    }

    #[test]
    fn test_file_target_is_exact() {
        let manager = WatchManager::new();
        let (_id, mut rx) = manager.register(1, WatchTarget::File("/a.json".to_string()));
        manager.notify(Revision::from(2), &["/a.json.bak".to_string()]);
        assert!(rx.try_recv().is_err());
        manager.notify(Revision::from(2), &["/a.json".to_string()]);
        assert_eq!(rx.try_recv().unwrap(), Revision::from(2));
    }

    #[test]
    fn test_deregister_drops_waiter() {
        let manager = WatchManager::new();
        let (id, _rx) = manager.register(1, WatchTarget::File("/a".to_string()));
        assert_eq!(manager.waiter_count(), 1);
        manager.deregister(id);
        assert_eq!(manager.waiter_count(), 0);
    }

    #[test]
    fn test_effective_timeout_rounds_up() {
        let slack = Duration::from_millis(500);
        assert_eq!(
            effective_timeout(Duration::from_millis(1200), slack),
            Duration::from_millis(2500)
        );
        assert_eq!(
            effective_timeout(Duration::from_secs(3), slack),
            Duration::from_millis(3500)
        );
    }
}
