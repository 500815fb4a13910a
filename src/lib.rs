pub mod auth;
pub mod cache;
pub mod cli;
pub mod server;
