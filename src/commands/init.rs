use crate::args::InitArgs;
use crate::commands::Out;
use crate::config::InitOptions;
use crate::{Config, Result};
use std::path::Path;

/// Creates the ledger home directory and:
/// - creates an initial `config.json` from `args` along with default batch settings
/// - copies any given secret files into `.secrets`
/// - creates the SQLite document store
///
/// # Errors
/// - Returns a `Config` error if the directory already holds a ledger or any file operation
///   fails.
pub async fn init(ledger_home: &Path, args: &InitArgs) -> Result<Out<()>> {
    let options = InitOptions {
        aggregator_url: args.aggregator_url().clone(),
        model_url: args.model_url().clone(),
        webhook_url: args.webhook_url().cloned(),
        admins: args.admins().to_vec(),
        aggregator_secret: args.aggregator_secret().map(Path::to_path_buf),
        model_secret: args.model_secret().map(Path::to_path_buf),
    };
    let config = Config::create(ledger_home, options).await?;
    Ok(format!(
        "Successfully created the ledger directory and config at {}",
        config.root().display()
    )
    .into())
}
