// Relaunch Engine - Core module structure
pub mod catalog;
pub mod config;
pub mod database;
pub mod migrations;
pub mod updater;

pub use catalog::Catalog;
pub use config::UpdatesConfig;
pub use database::Database;
