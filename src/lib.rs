pub mod api;
pub mod args;
pub mod auth;
pub mod commands;
mod config;
mod error;
pub mod generative;
pub mod heuristic;
pub mod migrate;
pub mod model;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod sync;
#[cfg(test)]
mod test;
mod utils;

pub use api::Mode;
pub use config::{AggregatorSecret, Config, InitOptions, MigrateSettings, ModelSecret, SyncSettings};
pub use error::{Error, ErrorType, IntoResult, Res, Result};
