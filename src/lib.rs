pub mod auth;
pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod filesystem;
pub mod jobs;
pub mod ledger;
pub mod mail;
pub mod models;
pub mod server;
pub mod services;
pub mod slave;
pub mod util;
