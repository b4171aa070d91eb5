//! FdxTunnel server: accepts agent tunnels and issues calls through them.

pub mod app;
pub mod config;
pub mod connection;
pub mod controller;
pub mod metrics;

pub use config::ServerConfig;
pub use controller::{CallResponse, ServerController, ServerOptions};
