pub mod actions;
pub mod app;
pub mod config;
pub mod conflict;
pub mod database;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod operations;
pub mod reaper;
pub mod registry;
pub mod resources;
pub mod routes;
pub mod runner;
pub mod scheduler;
pub mod schedules;
pub mod status;

#[cfg(test)]
mod testing;
