mod admin;
mod classes;
mod formats;
mod heats;
pub mod options;
mod pilots;
mod profiles;
mod races;

pub use admin::AUTO_BACKUP_PREFIX;
pub use classes::ClassPatch;
pub use formats::FormatPatch;
pub use heats::HeatPatch;
pub use pilots::PilotPatch;
pub use profiles::ProfilePatch;
pub use races::{
    NewSavedLap, NewSavedPilotRace, NewSavedRace, PilotRaceQuery, RaceOrder, RaceQuery,
};

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};

use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

use crate::events::EventBus;
use crate::freq::FrequencySet;
use crate::results::cache::ResultsCache;

/// Sentinel id meaning "none" for every entity kind.
pub const ID_NONE: i64 = 0;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Bad id, bad enum value, or a mutation blocked by race state.
    #[error("{0}")]
    Validation(String),
    /// Deleting a referenced entity or the last of a required kind.
    #[error("{0}")]
    Conflict(String),
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: i64 },
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Tri-state status of a cached leaderboard artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Invalid,
    InProgress,
    Valid,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Invalid => "invalid",
            CacheStatus::InProgress => "in_progress",
            CacheStatus::Valid => "valid",
        }
    }

    pub fn parse(value: &str) -> CacheStatus {
        match value {
            "valid" => CacheStatus::Valid,
            "in_progress" => CacheStatus::InProgress,
            _ => CacheStatus::Invalid,
        }
    }
}

/// Transactional entity store. The sole writer of persistent state; owns the
/// in-memory options cache and the coarse page-cache flag.
#[derive(Clone)]
pub struct Store {
    pub pool: SqlitePool,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) results: Arc<ResultsCache>,
    pub(crate) options_cache: Arc<RwLock<HashMap<String, String>>>,
    /// Coarse Valid/Invalid flag for static leaderboard responses.
    pub(crate) page_cache_valid: Arc<AtomicBool>,
    pub(crate) db_path: String,
    pub(crate) node_count: usize,
}

impl Store {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        results: Arc<ResultsCache>,
        db_path: String,
        node_count: usize,
    ) -> Self {
        Self {
            pool,
            bus,
            results,
            options_cache: Arc::new(RwLock::new(HashMap::new())),
            page_cache_valid: Arc::new(AtomicBool::new(false)),
            db_path,
            node_count,
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    /// Prime the options cache and seed required entities: at least one
    /// heat, one format, and one profile must always exist.
    pub async fn init(&self) -> StoreResult<()> {
        self.prime_options_cache().await?;
        self.seed_defaults().await?;
        Ok(())
    }

    async fn seed_defaults(&self) -> StoreResult<()> {
        let format_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM race_formats")
            .fetch_one(&self.pool)
            .await?;
        if format_count == 0 {
            let standard = self.seed_format(
                "2:00 Standard Race",
                0, // count-down
                120,
                2,
                1, // MostLaps
                0,
            )
            .await?;
            self.seed_format("First to 3 Laps", 1, 0, -1, 2, 3).await?;
            self.set_option(options::CURRENT_FORMAT, &standard.to_string())
                .await?;
            info!("Seeded default race formats");
        }

        let profile_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles")
            .fetch_one(&self.pool)
            .await?;
        if profile_count == 0 {
            let freqs = FrequencySet::defaults(self.node_count);
            let profile_id: i64 = sqlx::query_scalar(
                "INSERT INTO profiles (name, description, frequencies) VALUES (?, ?, ?) RETURNING id",
            )
            .bind("Default")
            .bind("")
            .bind(serde_json::to_string(&freqs)?)
            .fetch_one(&self.pool)
            .await?;
            self.set_option(options::CURRENT_PROFILE, &profile_id.to_string())
                .await?;
            info!(profile_id, "Seeded default profile");
        }

        let heat_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM heats")
            .fetch_one(&self.pool)
            .await?;
        if heat_count == 0 {
            self.add_heat().await?;
            info!("Seeded initial heat");
        }

        Ok(())
    }

    async fn seed_format(
        &self,
        name: &str,
        race_mode: i64,
        race_time_sec: i64,
        lap_grace_sec: i64,
        win_condition: i64,
        number_laps_win: i64,
    ) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO race_formats \
             (name, race_mode, race_time_sec, lap_grace_sec, win_condition, number_laps_win) \
             VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
        )
        .bind(name)
        .bind(race_mode)
        .bind(race_time_sec)
        .bind(lap_grace_sec)
        .bind(win_condition)
        .bind(number_laps_win)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

/// Resolve a name collision by appending the lowest free numeric suffix.
pub fn unique_name(base: &str, existing: &[String]) -> String {
    if !existing.iter().any(|n| n == base) {
        return base.to_string();
    }
    let mut counter = 2;
    loop {
        let candidate = format!("{base} {counter}");
        if !existing.iter().any(|n| n == &candidate) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::db;

    /// Store over an in-memory database with seeded defaults.
    pub async fn memory_store() -> Store {
        let pool = db::create_pool(":memory:").await.unwrap();
        db::run_migrations(&pool).await.unwrap();
        let bus = Arc::new(EventBus::new());
        let results = Arc::new(ResultsCache::new());
        let store = Store::new(pool, bus, results, ":memory:".into(), 4);
        store.init().await.unwrap();
        store
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_name_appends_lowest_free_suffix() {
        let existing = vec!["Open".to_string(), "Open 2".to_string()];
        assert_eq!(unique_name("Open", &existing), "Open 3");
        assert_eq!(unique_name("Sport", &existing), "Sport");
    }

    #[test]
    fn cache_status_round_trips() {
        for status in [CacheStatus::Invalid, CacheStatus::InProgress, CacheStatus::Valid] {
            assert_eq!(CacheStatus::parse(status.as_str()), status);
        }
        assert_eq!(CacheStatus::parse("garbage"), CacheStatus::Invalid);
    }

    #[tokio::test]
    async fn init_seeds_required_minimums() {
        let store = test_support::memory_store().await;
        let heats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM heats")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let formats: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM race_formats")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let profiles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM profiles")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        assert!(heats >= 1);
        assert!(formats >= 1);
        assert!(profiles >= 1);
    }
}
