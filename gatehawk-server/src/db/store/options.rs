use std::sync::atomic::Ordering;

use super::{CacheStatus, Store, StoreResult};
use crate::events::Event;

pub const CURRENT_PROFILE: &str = "currentProfile";
pub const CURRENT_FORMAT: &str = "currentFormat";
pub const MIN_LAP_SEC: &str = "MinLapSec";
pub const MIN_LAP_BEHAVIOR: &str = "MinLapBehavior";
pub const START_THRESH_LOWER_AMOUNT: &str = "startThreshLowerAmount";
pub const START_THRESH_LOWER_DURATION: &str = "startThreshLowerDuration";
pub const CALIBRATION_MODE: &str = "calibrationMode";
pub const TIME_FORMAT: &str = "timeFormat";
pub const CURRENT_LANGUAGE: &str = "currentLanguage";
pub const EVENT_RESULTS_CACHE_STATUS: &str = "eventResults_cacheStatus";
pub const LED_EFFECTS: &str = "ledEffects";
pub const LED_BRIGHTNESS: &str = "ledBrightness";
pub const SECRET_KEY: &str = "secret_key";
pub const VOICE_CALLOUTS: &str = "voiceCallouts";
pub const DB_AUTOBKP_NUM_KEEP: &str = "DB_AUTOBKP_NUM_KEEP";

impl Store {
    /// Load every persisted option into the in-memory map, then fill in
    /// defaults for options the database does not know yet.
    pub(crate) async fn prime_options_cache(&self) -> StoreResult<()> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT option_name, option_value FROM global_settings")
                .fetch_all(&self.pool)
                .await?;

        {
            let mut cache = self.options_cache.write().expect("options cache poisoned");
            cache.clear();
            for (name, value) in rows {
                cache.insert(name, value);
            }
        }

        let defaults: &[(&str, &str)] = &[
            (MIN_LAP_SEC, "10"),
            (MIN_LAP_BEHAVIOR, "0"),
            (START_THRESH_LOWER_AMOUNT, "0"),
            (START_THRESH_LOWER_DURATION, "0"),
            (CALIBRATION_MODE, "1"),
            (TIME_FORMAT, "{m}:{s}.{d}"),
            (CURRENT_LANGUAGE, "en"),
            (EVENT_RESULTS_CACHE_STATUS, "invalid"),
            (LED_BRIGHTNESS, "32"),
            (DB_AUTOBKP_NUM_KEEP, "30"),
        ];
        for (name, value) in defaults {
            if self.get_option(name).is_none() {
                self.set_option(name, value).await?;
            }
        }
        if self.get_option(SECRET_KEY).is_none() {
            let key = format!("{:032x}", rand::random::<u128>());
            self.set_option(SECRET_KEY, &key).await?;
        }

        Ok(())
    }

    /// Absent or empty options read as `None`; callers supply the default.
    pub fn get_option(&self, name: &str) -> Option<String> {
        self.options_cache
            .read()
            .expect("options cache poisoned")
            .get(name)
            .filter(|v| !v.is_empty())
            .cloned()
    }

    pub fn get_option_or(&self, name: &str, default: &str) -> String {
        self.get_option(name).unwrap_or_else(|| default.to_string())
    }

    pub fn get_option_int(&self, name: &str, default: i64) -> i64 {
        self.get_option(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Write-through: updates the cache and persists in one statement.
    pub async fn set_option(&self, name: &str, value: &str) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO global_settings (option_name, option_value) VALUES (?, ?) \
             ON CONFLICT(option_name) DO UPDATE SET option_value = excluded.option_value",
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await?;

        self.options_cache
            .write()
            .expect("options cache poisoned")
            .insert(name.to_string(), value.to_string());

        self.bus.publish(
            Event::OptionSet,
            serde_json::json!({ "option": name, "value": value }),
        );
        Ok(())
    }

    pub fn event_results_cache_status(&self) -> CacheStatus {
        CacheStatus::parse(&self.get_option_or(EVENT_RESULTS_CACHE_STATUS, "invalid"))
    }

    pub fn page_cache_is_valid(&self) -> bool {
        self.page_cache_valid.load(Ordering::Relaxed)
    }

    pub fn set_page_cache_valid(&self, valid: bool) {
        self.page_cache_valid.store(valid, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::memory_store;
    use super::*;

    #[tokio::test]
    async fn options_prime_and_write_through() {
        let store = memory_store().await;

        // Defaults primed.
        assert_eq!(store.get_option_int(MIN_LAP_SEC, 0), 10);

        store.set_option(MIN_LAP_SEC, "5").await.unwrap();
        assert_eq!(store.get_option_int(MIN_LAP_SEC, 0), 5);

        // Persisted value survives a cache re-prime.
        store.prime_options_cache().await.unwrap();
        assert_eq!(store.get_option_int(MIN_LAP_SEC, 0), 5);
    }

    #[tokio::test]
    async fn absent_and_empty_options_fall_back_to_default() {
        let store = memory_store().await;
        assert_eq!(store.get_option("noSuchOption"), None);
        assert_eq!(store.get_option_or("noSuchOption", "x"), "x");

        store.set_option("emptyOption", "").await.unwrap();
        assert_eq!(store.get_option("emptyOption"), None);
        assert_eq!(store.get_option_int("emptyOption", 7), 7);
    }
}
