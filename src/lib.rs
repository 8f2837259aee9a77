pub mod agent;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod patterns;
pub mod store;
pub mod tracker;
pub mod util;
pub mod verify;
