#![forbid(unsafe_code)]

pub mod blob;
pub mod config;
pub mod credentials;
pub mod server;
pub mod store;
