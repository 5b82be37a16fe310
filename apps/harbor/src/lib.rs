pub mod broker;
pub mod cli;
pub mod client;
pub mod config;
pub mod connection;
pub mod control;
pub mod device;
pub mod error;
pub mod registry;
pub mod relay;
pub mod server;
pub mod telemetry;
pub mod websocket;
