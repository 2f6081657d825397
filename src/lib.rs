pub mod api;
pub mod board;
pub mod config;
pub mod errors;
pub mod events;
pub mod logging;
pub mod orchestrator;
pub mod queue;
pub mod server;
pub mod webhook;
pub mod workspace;
pub mod ws;
