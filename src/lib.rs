// src/lib.rs
pub mod app;
pub mod cert;
pub mod config;
pub mod deploy;
pub mod error;
pub mod hosts;
pub mod kubeconfig;
pub mod retry;
pub mod state;
pub mod store;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

pub use error::{Error, Result};
