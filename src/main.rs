use clap::Parser;
use landlord_ledger::args::{Args, Command, RulesCommand};
use landlord_ledger::{commands, Config, Mode, Result};
use std::process::ExitCode;
use tracing::{debug, error, trace};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

const LIB_CRATE_NAME: &str = "landlord_ledger";

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let log_level = args.common().log_level();
    init_logger(log_level);
    debug!("Log level set to {}", log_level.to_string().to_lowercase());

    match main_inner(args).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => {
            error!("Exiting with failures, see the summary above");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("Exiting with error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Runs the command. Returns `Ok(false)` when the command completed but some of its work failed.
pub async fn main_inner(args: Args) -> Result<bool> {
    trace!("{args:?}");
    let home = args.common().ledger_home().path();

    // This allows for running the program without the aggregator or the model. When
    // LEDGER_IN_TEST_MODE is set and non-zero in length, then the mode will be Mode::Test,
    // otherwise it will be Mode::Live.
    let mode = Mode::from_env();

    let ok = match args.command() {
        Command::Init(init_args) => emit(commands::init(home, init_args).await?),

        Command::Link(link_args) => {
            let config = Config::load(home, mode).await?;
            emit(commands::link(config, mode, link_args).await?)
        }

        Command::Sync(sync_args) => {
            let config = Config::load(home, mode).await?;
            emit(commands::sync(config, mode, sync_args).await?)
        }

        Command::NormalizeL0(job_args) => {
            let config = Config::load(home, mode).await?;
            emit(commands::normalize_l0(config, job_args).await?)
        }

        Command::Repair(repair_args) => {
            let config = Config::load(home, mode).await?;
            emit(commands::repair(config, mode, repair_args).await?)
        }

        Command::Relabel(relabel_args) => {
            let config = Config::load(home, mode).await?;
            emit(commands::relabel(config, relabel_args).await?)
        }

        Command::Rules(rules_args) => {
            let config = Config::load(home, mode).await?;
            match rules_args.command() {
                RulesCommand::Seed(args) => emit(commands::rules_seed(config, args).await?),
                RulesCommand::Publish(args) => emit(commands::rules_publish(config, args).await?),
            }
        }
    };
    Ok(ok)
}

fn emit<T>(out: commands::Out<T>) -> bool
where
    T: serde::Serialize + Clone + std::fmt::Debug,
{
    out.print();
    !out.failed()
}

/// Initializes the tracing subscriber.
pub fn init_logger(level: LevelFilter) {
    let filter = match std::env::var("RUST_LOG").ok() {
        Some(_) => {
            // RUST_LOG exists; use it.
            EnvFilter::from_default_env()
        }
        None => {
            // RUST_LOG does not exist; use default log level for this crate only.
            EnvFilter::new(format!(
                "{}={},{}={}",
                LIB_CRATE_NAME,
                level,
                env!("CARGO_BIN_NAME"),
                level
            ))
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
