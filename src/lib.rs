//! Game archive storage: resumable chunked uploads, sharded archive storage,
//! deletion that keeps files and records in step, and background patch
//! generation between archive versions.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
