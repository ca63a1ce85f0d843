#[macro_use]
extern crate rocket;

#[cfg(all(test, feature = "db-tests"))]
#[macro_use]
extern crate backend_test;

use std::sync::Arc;

use rocket::{Build, Rocket};

use crate::{
    config::{ConfigFairing, DatabaseFairing},
    logging::LoggerFairing,
    store::SharedStore,
    voting::{ExpirySweepFairing, LogDispatcher, SharedDispatcher},
};

pub mod api;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod scheduled_task;
pub mod store;
pub mod voting;

pub use config::Config;

/// Build the server, connecting to MongoDB during ignition.
pub fn build() -> Rocket<Build> {
    let dispatcher: SharedDispatcher = Arc::new(LogDispatcher);
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .attach(DatabaseFairing)
        .attach(ExpirySweepFairing)
        .manage(dispatcher)
        .mount("/", api::routes())
}

/// Build the server around an existing store and dispatcher.
pub fn rocket_for_store(store: SharedStore, dispatcher: SharedDispatcher) -> Rocket<Build> {
    rocket::build()
        .attach(LoggerFairing)
        .attach(ConfigFairing)
        .manage(store)
        .manage(dispatcher)
        .attach(ExpirySweepFairing)
        .mount("/", api::routes())
}

/// A tracked client for a server backed by a fresh in-memory store.
#[cfg(test)]
pub(crate) async fn memory_client() -> (
    rocket::local::asynchronous::Client,
    Arc<store::MemoryStore>,
) {
    let store = Arc::new(store::MemoryStore::new());
    let rocket = rocket_for_store(store.clone(), Arc::new(LogDispatcher));
    let client = rocket::local::asynchronous::Client::tracked(rocket)
        .await
        .unwrap();
    (client, store)
}

/// Connect to the database named by `db_uri`, for tests that need a real one.
#[cfg(all(test, feature = "db-tests"))]
pub(crate) async fn db_client() -> mongodb::Client {
    let db_uri = rocket::Config::figment()
        .extract_inner::<String>("db_uri")
        .expect("`db_uri` not set");
    mongodb::Client::with_uri_str(&db_uri)
        .await
        .expect("Could not connect to database")
}

/// A fresh database name for a test.
#[cfg(all(test, feature = "db-tests"))]
pub(crate) fn database() -> String {
    config::get_database_name()
}
