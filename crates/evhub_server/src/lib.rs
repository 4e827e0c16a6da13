#![forbid(unsafe_code)]

pub mod config;
pub mod server;

pub use server::hub::{Hub, HubHandle};
