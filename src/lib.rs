#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod media;
pub mod proxy;
pub mod resolve;
pub mod server;

#[cfg(test)]
mod testing;
