use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use crate::db::store::{CacheStatus, StoreResult};

use super::leaderboard::Leaderboard;

/// Key of one cached leaderboard artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheKey {
    Race(i64),
    Heat(i64),
    Class(i64),
    Event,
}

struct Slot {
    status: CacheStatus,
    value: Option<Arc<Leaderboard>>,
    notify: Arc<Notify>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            status: CacheStatus::Invalid,
            value: None,
            notify: Arc::new(Notify::new()),
        }
    }
}

/// Leaderboard cache with at-most-one concurrent build per key. Callers that
/// find a build in progress wait on the key's completion signal instead of
/// duplicating the work.
pub struct ResultsCache {
    slots: Mutex<HashMap<CacheKey, Slot>>,
}

impl ResultsCache {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn status(&self, key: CacheKey) -> CacheStatus {
        self.slots
            .lock()
            .expect("results cache poisoned")
            .get(&key)
            .map(|slot| slot.status)
            .unwrap_or(CacheStatus::Invalid)
    }

    /// Mark one key invalid. Leaf invalidation walking (race, then heat, class,
    /// and event) is the store's responsibility.
    pub fn invalidate(&self, key: CacheKey) {
        let mut slots = self.slots.lock().expect("results cache poisoned");
        let slot = slots.entry(key).or_default();
        // An in-progress build keeps running; its result is stored but the
        // status stays invalid so the next reader rebuilds.
        if slot.status == CacheStatus::Valid {
            slot.status = CacheStatus::Invalid;
        } else if slot.status == CacheStatus::InProgress {
            slot.value = None;
        }
        debug!(?key, "Results cache invalidated");
    }

    pub async fn get_or_build<F, Fut>(&self, key: CacheKey, build: F) -> StoreResult<Arc<Leaderboard>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StoreResult<Leaderboard>>,
    {
        loop {
            let waiter = {
                let mut slots = self.slots.lock().expect("results cache poisoned");
                let slot = slots.entry(key).or_default();
                match slot.status {
                    CacheStatus::Valid => {
                        if let Some(value) = &slot.value {
                            return Ok(value.clone());
                        }
                        slot.status = CacheStatus::InProgress;
                        None
                    }
                    CacheStatus::Invalid => {
                        slot.status = CacheStatus::InProgress;
                        None
                    }
                    CacheStatus::InProgress => Some(slot.notify.clone()),
                }
            };

            match waiter {
                Some(notify) => {
                    notify.notified().await;
                    continue;
                }
                None => break,
            }
        }

        match build().await {
            Ok(board) => {
                let value = Arc::new(board);
                let mut slots = self.slots.lock().expect("results cache poisoned");
                let slot = slots.entry(key).or_default();
                slot.status = CacheStatus::Valid;
                slot.value = Some(value.clone());
                slot.notify.notify_waiters();
                Ok(value)
            }
            Err(error) => {
                let mut slots = self.slots.lock().expect("results cache poisoned");
                let slot = slots.entry(key).or_default();
                slot.status = CacheStatus::Invalid;
                slot.value = None;
                slot.notify.notify_waiters();
                Err(error)
            }
        }
    }
}

impl Default for ResultsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::results::leaderboard::RankMethod;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn empty_board() -> Leaderboard {
        Leaderboard {
            ranking: RankMethod::RaceProgress,
            rows: vec![],
        }
    }

    #[tokio::test]
    async fn build_runs_once_while_valid() {
        let cache = ResultsCache::new();
        let builds = AtomicUsize::new(0);

        for _ in 0..3 {
            cache
                .get_or_build(CacheKey::Race(1), || {
                    builds.fetch_add(1, Ordering::SeqCst);
                    async { Ok(empty_board()) }
                })
                .await
                .unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.status(CacheKey::Race(1)), CacheStatus::Valid);
    }

    #[tokio::test]
    async fn invalidation_forces_rebuild() {
        let cache = ResultsCache::new();
        let builds = AtomicUsize::new(0);

        cache
            .get_or_build(CacheKey::Heat(7), || {
                builds.fetch_add(1, Ordering::SeqCst);
                async { Ok(empty_board()) }
            })
            .await
            .unwrap();
        cache.invalidate(CacheKey::Heat(7));
        assert_eq!(cache.status(CacheKey::Heat(7)), CacheStatus::Invalid);

        cache
            .get_or_build(CacheKey::Heat(7), || {
                builds.fetch_add(1, Ordering::SeqCst);
                async { Ok(empty_board()) }
            })
            .await
            .unwrap();
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_build_resets_to_invalid() {
        let cache = ResultsCache::new();
        let result = cache
            .get_or_build(CacheKey::Event, || async {
                Err(crate::db::store::StoreError::Validation("boom".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.status(CacheKey::Event), CacheStatus::Invalid);
    }

    #[tokio::test]
    async fn concurrent_readers_share_one_build() {
        let cache = Arc::new(ResultsCache::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let builds = builds.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_build(CacheKey::Class(3), || {
                        let builds = builds.clone();
                        async move {
                            builds.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                            Ok(empty_board())
                        }
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(builds.load(Ordering::SeqCst), 1);
    }
}
