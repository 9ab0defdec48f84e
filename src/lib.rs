pub mod config;
pub mod console;
pub mod core;
pub mod plugins;
pub mod server;
