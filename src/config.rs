use chrono::Duration;
use mongodb::Client as MongoClient;
use rocket::{
    fairing::{Fairing, Info, Kind},
    Build, Rocket,
};
use serde::Deserialize;
use std::sync::Arc;

use crate::{
    model::mongodb::ensure_indexes_exist,
    store::{MongoStore, SharedStore},
    voting::RetryPolicy,
};

/// Application configuration, derived from `Rocket.toml` and `ROCKET_*`
/// environment variables. This struct becomes managed state and can be
/// inspected by any endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "defaults::invitation_ttl")]
    invitation_ttl: u32,
    #[serde(default = "defaults::default_batch_size")]
    default_batch_size: u32,
    #[serde(default = "defaults::cast_retries")]
    cast_retries: u32,
    #[serde(default = "defaults::cast_retry_window_ms")]
    cast_retry_window_ms: u64,
    #[serde(default = "defaults::cast_retry_base_delay_ms")]
    cast_retry_base_delay_ms: u64,
    #[serde(default = "defaults::expiry_sweep_interval")]
    expiry_sweep_interval: u32,
    #[serde(default = "defaults::vote_url_base")]
    vote_url_base: String,
}

mod defaults {
    pub fn invitation_ttl() -> u32 {
        24 * 60 * 60
    }

    pub fn default_batch_size() -> u32 {
        60
    }

    pub fn cast_retries() -> u32 {
        3
    }

    pub fn cast_retry_window_ms() -> u64 {
        2000
    }

    pub fn cast_retry_base_delay_ms() -> u64 {
        5
    }

    pub fn expiry_sweep_interval() -> u32 {
        5 * 60
    }

    pub fn vote_url_base() -> String {
        "http://localhost:5174/vote".to_string()
    }
}

impl Config {
    /// Valid lifetime of an invitation in seconds.
    pub fn invitation_ttl(&self) -> Duration {
        Duration::seconds(self.invitation_ttl.into())
    }

    /// Batch size used when neither the request nor the election gives one.
    pub fn default_batch_size(&self) -> u32 {
        self.default_batch_size
    }

    /// How storage operations are re-run from the start after a retryable
    /// failure: at least `cast_retries` times, and for as long as the window
    /// of `cast_retry_window_ms` lasts.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.cast_retries,
            std::time::Duration::from_millis(self.cast_retry_window_ms),
            std::time::Duration::from_millis(self.cast_retry_base_delay_ms),
        )
    }

    /// Seconds between sweeps that expire overdue invitations.
    pub fn expiry_sweep_interval(&self) -> Duration {
        Duration::seconds(self.expiry_sweep_interval.into())
    }

    /// Base of the voting link; the token is appended as the last segment.
    pub fn vote_url_base(&self) -> &str {
        &self.vote_url_base
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            invitation_ttl: defaults::invitation_ttl(),
            default_batch_size: defaults::default_batch_size(),
            cast_retries: defaults::cast_retries(),
            cast_retry_window_ms: defaults::cast_retry_window_ms(),
            cast_retry_base_delay_ms: defaults::cast_retry_base_delay_ms(),
            expiry_sweep_interval: defaults::expiry_sweep_interval(),
            vote_url_base: defaults::vote_url_base(),
        }
    }
}

/// A fairing that loads the application config and puts it in managed state.
/// This could easily be achieved using `AdHoc::config`, but is written out
/// explicitly for symmetry with the other fairings and control over error
/// messages.
pub struct ConfigFairing;

#[rocket::async_trait]
impl Fairing for ConfigFairing {
    fn info(&self) -> Info {
        Info {
            name: "Config",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<Config>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load application config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };

        // Manage the state.
        rocket = rocket.manage(config);
        Ok(rocket)
    }
}

/// Configuration for the database.
#[derive(Deserialize)]
struct DbConfig {
    // secrets
    db_uri: String,
}

/// A fairing that loads the MongoDB config, connects to the database,
/// ensures the indexes exist, and places a [`SharedStore`] backed by it into
/// managed state.
pub struct DatabaseFairing;

#[rocket::async_trait]
impl Fairing for DatabaseFairing {
    fn info(&self) -> Info {
        Info {
            name: "MongoDB",
            kind: Kind::Ignite,
        }
    }

    async fn on_ignite(&self, mut rocket: Rocket<Build>) -> rocket::fairing::Result {
        // Load the config.
        let config = match rocket.figment().extract::<DbConfig>() {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load database config");
                rocket::config::pretty_print_error(e);
                return Err(rocket);
            }
        };
        info!("Loaded database config, connecting...");
        // Construct the connection.
        let client = match MongoClient::with_uri_str(config.db_uri).await {
            Ok(client) => client,
            Err(e) => {
                error!("Failed to connect to database: {e}");
                return Err(rocket);
            }
        };
        let db = client.database(&get_database_name());

        // The unique indexes carry the one-invitation and one-ballot guarantees.
        if let Err(e) = ensure_indexes_exist(&db).await {
            error!("Failed to create database indexes: {e}");
            return Err(rocket);
        }
        info!("...database connection online!");

        // Manage the state.
        let store: SharedStore = Arc::new(MongoStore::new(client, db));
        rocket = rocket.manage(store);
        Ok(rocket)
    }
}

/// Get the name of the database to use (production version).
#[cfg(not(test))]
pub(crate) fn get_database_name() -> String {
    "campusvote".to_string()
}

/// Get the name of the database to use (test version).
/// Use a random name to avoid collisions between tests.
#[cfg(test)]
pub(crate) fn get_database_name() -> String {
    let random: u32 = rand::random();
    let db = format!("test{random}");
    info!("Using database {db}");
    db
}
