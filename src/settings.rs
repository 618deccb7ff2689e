use std::collections::HashSet;
use std::env;
use std::path::PathBuf;

use chrono::{NaiveDate, NaiveTime};
use config::builder::DefaultState;
use config::ConfigBuilder;
use serde::Deserialize;

use crate::limits::MAX_PRICE;
use crate::model::{Extra, Facility, House, HouseId};
use crate::pricing::RateRule;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("price coefficient #{index}: {reason}")]
    RateRule { index: usize, reason: String },

    #[error("{key}: {reason}")]
    Invalid { key: String, reason: String },
}

fn invalid(key: impl Into<String>, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key: key.into(), reason: reason.into() }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    /// WAL appends before the maintenance job compacts.
    pub compact_threshold: u64,
    pub reservations: ReservationSettings,
    pub scheduler: SchedulerSettings,
    pub notifications: NotificationSettings,
    pub verification: VerificationSettings,
    pub catalog: CatalogSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 10_000,
            reservations: ReservationSettings::default(),
            scheduler: SchedulerSettings::default(),
            notifications: NotificationSettings::default(),
            verification: VerificationSettings::default(),
            catalog: CatalogSettings::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReservationSettings {
    /// Days before check-in the reminder goes out.
    pub notification_threshold_days: u32,
    pub price_coefficients: Vec<RateRule>,
}

impl Default for ReservationSettings {
    fn default() -> Self {
        Self { notification_threshold_days: 1, price_coefficients: Vec::new() }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SchedulerSettings {
    pub status_interval_secs: u64,
    /// Local `HH:MM` at which reminders are sent.
    pub reminder_time: String,
    pub compaction_interval_secs: u64,
    /// Run every job once at startup as well.
    pub run_on_start: bool,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            status_interval_secs: 3600,
            reminder_time: "09:00".into(),
            compaction_interval_secs: 600,
            run_on_start: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct NotificationSettings {
    pub queue_capacity: usize,
}

impl Default for NotificationSettings {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VerificationSettings {
    /// Lifetime of a messaging verification code.
    pub ttl_secs: u64,
}

impl Default for VerificationSettings {
    fn default() -> Self {
        Self { ttl_secs: 600 }
    }
}

/// Catalog seeded into the store at startup. Entries already present are
/// updated when they differ from the file.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CatalogSettings {
    pub houses: Vec<House>,
    pub extras: Vec<Extra>,
    pub facilities: Vec<Facility>,
    pub blackouts: Vec<BlackoutSettings>,
}

/// Closed period `[start, end)` for one house.
#[derive(Debug, Deserialize, Clone)]
pub struct BlackoutSettings {
    pub house_id: HouseId,
    pub start: NaiveDate,
    pub end: NaiveDate,
    #[serde(default)]
    pub reason: Option<String>,
}

const PRICE_RANGE: &str = "price must be between 0 and 1000000000";

fn price_ok(price: i64) -> bool {
    (0..=MAX_PRICE).contains(&price)
}

pub fn parse_hhmm(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M").ok()
}

impl Settings {
    /// Layered load: `config/default`, `config/local`, the file named by
    /// `LODGEBOOK_CONFIG`, then `LODGEBOOK__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::File::with_name("config/local").required(false));
        if let Ok(path) = env::var("LODGEBOOK_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        builder = builder.add_source(config::Environment::with_prefix("LODGEBOOK").separator("__"));
        Self::build(builder)
    }

    pub fn from_toml(s: &str) -> Result<Self, ConfigError> {
        Self::build(
            config::Config::builder().add_source(config::File::from_str(s, config::FileFormat::Toml)),
        )
    }

    fn build(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn reminder_time(&self) -> Result<NaiveTime, ConfigError> {
        parse_hhmm(&self.scheduler.reminder_time)
            .ok_or_else(|| invalid("scheduler.reminder_time", "expected HH:MM"))
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("lodgebook.wal")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, rule) in self.reservations.price_coefficients.iter().enumerate() {
            if rule.start > rule.end {
                return Err(ConfigError::RateRule {
                    index,
                    reason: format!("start {} is after end {}", rule.start, rule.end),
                });
            }
            if !rule.rate.is_finite() || rule.rate < 1.0 {
                return Err(ConfigError::RateRule {
                    index,
                    reason: format!("rate {} must be at least 1.0", rule.rate),
                });
            }
        }

        if self.compact_threshold == 0 {
            return Err(invalid("compact_threshold", "must be positive"));
        }
        if self.scheduler.status_interval_secs == 0 {
            return Err(invalid("scheduler.status_interval_secs", "must be positive"));
        }
        if self.scheduler.compaction_interval_secs == 0 {
            return Err(invalid("scheduler.compaction_interval_secs", "must be positive"));
        }
        self.reminder_time()?;
        if self.notifications.queue_capacity == 0 {
            return Err(invalid("notifications.queue_capacity", "must be positive"));
        }
        if !(1..=86_400).contains(&self.verification.ttl_secs) {
            return Err(invalid("verification.ttl_secs", "must be between 1 and 86400"));
        }

        let mut ids = HashSet::new();
        for h in &self.catalog.houses {
            let key = format!("catalog.houses[{}]", h.id);
            if !ids.insert(h.id) {
                return Err(invalid(key, "duplicate id"));
            }
            if h.capacity == 0 {
                return Err(invalid(key, "capacity must be positive"));
            }
            if !price_ok(h.base_price) {
                return Err(invalid(key, PRICE_RANGE));
            }
            if parse_hhmm(&h.check_in_from).is_none() || parse_hhmm(&h.check_out_until).is_none() {
                return Err(invalid(key, "check-in/out times must be HH:MM"));
            }
        }
        if let Some(e) = self.catalog.extras.iter().find(|e| !price_ok(e.price)) {
            return Err(invalid(format!("catalog.extras[{}]", e.id), PRICE_RANGE));
        }
        for f in &self.catalog.facilities {
            if !price_ok(f.price) || f.fill_options.iter().any(|o| !price_ok(o.price)) {
                return Err(invalid(format!("catalog.facilities[{}]", f.id), PRICE_RANGE));
            }
        }
        for (i, b) in self.catalog.blackouts.iter().enumerate() {
            if b.start >= b.end {
                return Err(invalid(format!("catalog.blackouts[{i}]"), "start must be before end"));
            }
        }
        Ok(())
    }
}
