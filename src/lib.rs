pub mod app;
pub mod config;
pub mod error;
pub mod response;

pub mod checks;
pub mod database;
pub mod handlers;
pub mod models;
pub mod queue;
pub mod repositories;
pub mod routes;
pub mod services;
pub mod storage;

#[cfg(test)]
mod test_support;
