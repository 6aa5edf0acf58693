pub mod health;

pub use health::{AppState, queue_health, storage_health, system_status};
