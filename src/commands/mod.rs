//! Command handlers for the ledger CLI.
//!
//! Each handler is a thin entry point: it builds the collaborators from the `Config`, calls into
//! the library and wraps the outcome in an `Out`.

mod init;
mod link;
mod migrate;
mod rules;
mod sync;

use crate::api::{self, Mode};
use crate::args::JobArgs;
use crate::config::check_batch;
use crate::error::{ErrorType, IntoResult};
use crate::generative::DeepCategorizer;
use crate::migrate::RunnerOptions;
use crate::pipeline::Resolver;
use crate::rules::RuleStore;
use crate::{Config, Result};
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info, warn};

pub use init::init;
pub use link::{link, LinkSummary};
pub use migrate::{normalize_l0, relabel, repair};
pub use rules::{rules_publish, rules_seed};
pub use sync::sync;

/// The output type for a command. This allows the command to return a consistent message and,
/// optionally, structured data.
#[derive(Debug, Clone, Serialize)]
pub struct Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// A message that can be printed to the user regarding the outcome of the command execution.
    message: String,

    /// Any structured data that needs to be output from the call.
    structure: Option<T>,

    /// Set when part of the work failed even though the command itself completed, for example
    /// one owner out of many.
    #[serde(skip)]
    failed: bool,
}

impl<T, S> From<S> for Out<T>
where
    T: Debug + Clone + Serialize,
    S: Into<String>,
{
    fn from(value: S) -> Self {
        Out::new_message(value)
    }
}

impl<T> Out<T>
where
    T: Serialize + Clone + Debug,
{
    /// Create a new `Out` object that has `Some(structure)`.
    pub fn new<S>(message: S, structure: T) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: Some(structure),
            failed: false,
        }
    }

    /// Create a new `Out` object that has `None` for `structure`.
    pub fn new_message<S>(message: S) -> Self
    where
        S: Into<String>,
    {
        Self {
            message: message.into(),
            structure: None,
            failed: false,
        }
    }

    pub fn with_failure(mut self, failed: bool) -> Self {
        self.failed = failed;
        self
    }

    /// Get the `message`.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the structured data stored in `structure`.
    pub fn structure(&self) -> Option<&T> {
        self.structure.as_ref()
    }

    pub fn failed(&self) -> bool {
        self.failed
    }

    /// Print the message to `info!` (or `warn!` on partial failure) and the structured data (if it
    /// exists) as JSON to `debug!`.
    pub fn print(&self) {
        if self.failed {
            warn!("{}", self.message);
        } else {
            info!("{}", self.message);
        }
        if let Some(structure) = self.structure() {
            if let Ok(json) = serde_json::to_string_pretty(structure) {
                debug!("Command output:\n\n{json}\n\n");
            }
        }
    }
}

/// Builds the resolution pipeline from the config's store and the model for `mode`.
fn resolver(config: &Config, mode: Mode) -> Result<Resolver> {
    let model = api::model(config, mode)?;
    Ok(Resolver::new(
        RuleStore::new(config.store(), config.sync_options().batch_size),
        DeepCategorizer::new(model),
    ))
}

/// Command-line values win over `migrate` settings from the config file.
fn runner_options(config: &Config, job: &JobArgs) -> Result<RunnerOptions> {
    let settings = config.migrate_settings();
    let options = RunnerOptions {
        page_size: job.page_size().unwrap_or(settings.page_size),
        batch_size: job.batch_size().unwrap_or(settings.batch_size),
        dry_run: job.dry_run(),
    };
    check_batch("--batch-size", options.batch_size).pub_result(ErrorType::Validation)?;
    Ok(options)
}
