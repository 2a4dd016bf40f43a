//! These structs provide the CLI interface for the ledger CLI.

use crate::sync::RemovedPolicy;
use clap::{ArgGroup, Parser, Subcommand};
use std::convert::Infallible;
use std::fmt::{Display, Formatter};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::error;
use tracing_subscriber::filter::LevelFilter;
use url::Url;

/// ledger: bookkeeping for small landlords.
///
/// The program pulls bank transactions from an aggregator into a local document store and files
/// each one under a four-level category, trying the owner's keyword rules, then the global rule
/// table, then local heuristics and finally a generative model. It also carries the repair jobs
/// that keep historical records consistent with the current taxonomy.
///
/// Set LEDGER_IN_TEST_MODE to any non-empty value to run against an in-memory aggregator and a
/// model that never answers, without credentials.
#[derive(Debug, Parser, Clone)]
pub struct Args {
    #[clap(flatten)]
    common: Common,

    #[command(subcommand)]
    command: Command,
}

impl Args {
    pub fn new(common: Common, command: Command) -> Self {
        Self { common, command }
    }

    pub fn common(&self) -> &Common {
        &self.common
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Create the ledger home directory, its config file and the document store.
    ///
    /// Decide where the data lives and pass it as --ledger-home (default $HOME/ledger). The
    /// aggregator and model credentials can be passed now or copied into the `.secrets`
    /// directory later as `aggregator.json` and `model.json`.
    Init(InitArgs),
    /// Exchange a public token from the aggregator's link flow and record the linked accounts.
    Link(LinkArgs),
    /// Pull new, changed and removed transactions for one user or for everyone.
    Sync(SyncArgs),
    /// Rewrite legacy level-0 values into the six canonical classes, for every user.
    NormalizeL0(JobArgs),
    /// Send a user's unresolved and needs-review transactions back through categorization.
    Repair(RepairArgs),
    /// Move transactions from old category labels to new ones using a JSON mapping file.
    Relabel(RelabelArgs),
    /// Manage the global keyword rule table.
    Rules(RulesArgs),
}

/// Arguments common to all subcommands.
#[derive(Debug, Parser, Clone)]
pub struct Common {
    /// The logging verbosity. One of, from least to most verbose:
    /// off, error, warn, info, debug, trace
    ///
    /// This can be overridden by RUST_LOG.
    #[arg(long, default_value_t = LevelFilter::INFO)]
    log_level: LevelFilter,

    /// The directory where ledger data and configuration is held. Defaults to ~/ledger
    #[arg(long, env = "LEDGER_HOME", default_value_t = default_ledger_home())]
    ledger_home: DisplayPath,
}

impl Common {
    pub fn new(log_level: LevelFilter, ledger_home: PathBuf) -> Self {
        Self {
            log_level,
            ledger_home: ledger_home.into(),
        }
    }

    pub fn log_level(&self) -> LevelFilter {
        self.log_level
    }

    pub fn ledger_home(&self) -> &DisplayPath {
        &self.ledger_home
    }
}

/// Args for the `ledger init` command.
#[derive(Debug, Parser, Clone)]
pub struct InitArgs {
    /// Base URL of the bank-data aggregator API.
    #[arg(long)]
    aggregator_url: Url,

    /// URL of the generative model endpoint.
    #[arg(long)]
    model_url: Url,

    /// Registered with the aggregator for every linked account.
    #[arg(long)]
    webhook_url: Option<Url>,

    /// A user id allowed to seed and publish global rules. Repeat for more than one.
    #[arg(long = "admin")]
    admins: Vec<String>,

    /// A JSON file with the aggregator `client_id` and `secret`. It is copied into `.secrets`.
    #[arg(long)]
    aggregator_secret: Option<PathBuf>,

    /// A JSON file with the model `api_key`. It is copied into `.secrets`.
    #[arg(long)]
    model_secret: Option<PathBuf>,
}

impl InitArgs {
    pub fn new(aggregator_url: Url, model_url: Url) -> Self {
        Self {
            aggregator_url,
            model_url,
            webhook_url: None,
            admins: Vec::new(),
            aggregator_secret: None,
            model_secret: None,
        }
    }

    pub fn aggregator_url(&self) -> &Url {
        &self.aggregator_url
    }

    pub fn model_url(&self) -> &Url {
        &self.model_url
    }

    pub fn webhook_url(&self) -> Option<&Url> {
        self.webhook_url.as_ref()
    }

    pub fn admins(&self) -> &[String] {
        &self.admins
    }

    pub fn aggregator_secret(&self) -> Option<&Path> {
        self.aggregator_secret.as_deref()
    }

    pub fn model_secret(&self) -> Option<&Path> {
        self.model_secret.as_deref()
    }
}

/// Args for the `ledger link` command.
#[derive(Debug, Parser, Clone)]
pub struct LinkArgs {
    #[arg(long)]
    user: String,

    /// The short-lived token returned by the aggregator's link flow.
    #[arg(long)]
    public_token: String,

    /// An account id covered by the token. Repeat for more than one.
    #[arg(long = "account", required = true)]
    accounts: Vec<String>,
}

impl LinkArgs {
    pub fn new(user: impl Into<String>, public_token: impl Into<String>, accounts: Vec<String>) -> Self {
        Self {
            user: user.into(),
            public_token: public_token.into(),
            accounts,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn public_token(&self) -> &str {
        &self.public_token
    }

    pub fn accounts(&self) -> &[String] {
        &self.accounts
    }
}

/// Args for the `ledger sync` command.
#[derive(Debug, Parser, Clone)]
#[command(group(ArgGroup::new("who").required(true).args(["user", "all"])))]
pub struct SyncArgs {
    /// Sync this user's accounts.
    #[arg(long)]
    user: Option<String>,

    /// Sync only this account of --user.
    #[arg(long, requires = "user")]
    account: Option<String>,

    /// Sync every user.
    #[arg(long)]
    all: bool,

    /// Overrides `sync.removed` from the config file.
    #[arg(long, value_enum)]
    removed: Option<RemovedPolicy>,
}

impl SyncArgs {
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn account(&self) -> Option<&str> {
        self.account.as_deref()
    }

    pub fn all(&self) -> bool {
        self.all
    }

    pub fn removed(&self) -> Option<RemovedPolicy> {
        self.removed
    }
}

/// Paging and batching options shared by the repair jobs. Values given here override
/// `migrate.page_size` and `migrate.batch_size` from the config file.
#[derive(Debug, Default, Parser, Clone)]
pub struct JobArgs {
    /// Count what would change without writing anything.
    #[arg(long, env = "LEDGER_DRY_RUN")]
    dry_run: bool,

    /// Records read per query.
    #[arg(long, env = "LEDGER_PAGE_SIZE")]
    page_size: Option<usize>,

    /// Records written per commit. Must be below 500.
    #[arg(long, env = "LEDGER_BATCH_SIZE")]
    batch_size: Option<usize>,
}

impl JobArgs {
    pub fn new(dry_run: bool, page_size: Option<usize>, batch_size: Option<usize>) -> Self {
        Self {
            dry_run,
            page_size,
            batch_size,
        }
    }

    pub fn dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn page_size(&self) -> Option<usize> {
        self.page_size
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }
}

/// Args for the `ledger repair` command.
#[derive(Debug, Parser, Clone)]
pub struct RepairArgs {
    #[arg(long)]
    user: String,

    #[clap(flatten)]
    job: JobArgs,
}

impl RepairArgs {
    pub fn new(user: impl Into<String>, job: JobArgs) -> Self {
        Self {
            user: user.into(),
            job,
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn job(&self) -> &JobArgs {
        &self.job
    }
}

/// Args for the `ledger relabel` command.
#[derive(Debug, Parser, Clone)]
pub struct RelabelArgs {
    /// A JSON array of `{"from": {"l0": .., "l1": .., "l2": .., "l3": ..}, "to": {..}}`.
    #[arg(long)]
    mapping: PathBuf,

    /// Relabel only this user. Defaults to every user.
    #[arg(long)]
    user: Option<String>,

    #[clap(flatten)]
    job: JobArgs,
}

impl RelabelArgs {
    pub fn new(mapping: impl Into<PathBuf>, user: Option<String>, job: JobArgs) -> Self {
        Self {
            mapping: mapping.into(),
            user,
            job,
        }
    }

    pub fn mapping(&self) -> &Path {
        &self.mapping
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    pub fn job(&self) -> &JobArgs {
        &self.job
    }
}

/// Args for the `ledger rules` command.
#[derive(Debug, Parser, Clone)]
pub struct RulesArgs {
    #[command(subcommand)]
    command: RulesCommand,
}

impl RulesArgs {
    pub fn command(&self) -> &RulesCommand {
        &self.command
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum RulesCommand {
    /// Load the built-in global rule table. Safe to run again.
    Seed(SeedArgs),
    /// Copy one user's keyword rules into the global table. Safe to run again.
    Publish(PublishArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct SeedArgs {
    /// The user id performing the change. Must be listed in `admins`.
    #[arg(long)]
    actor: String,
}

impl SeedArgs {
    pub fn actor(&self) -> &str {
        &self.actor
    }
}

#[derive(Debug, Parser, Clone)]
pub struct PublishArgs {
    /// The user whose rules are published.
    #[arg(long)]
    user: String,

    /// The user id performing the change. Must be listed in `admins`.
    #[arg(long)]
    actor: String,
}

impl PublishArgs {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }
}

fn default_ledger_home() -> DisplayPath {
    DisplayPath(match dirs::home_dir() {
        Some(home) => home.join("ledger"),
        None => {
            error!(
                "There was an error when trying to get your home directory. You can get around \
                this by providing --ledger-home or LEDGER_HOME instead of relying on the default \
                ledger home directory. If you continue using the program right now, you may have \
                problems!",
            );
            PathBuf::from("ledger")
        }
    })
}

#[derive(Debug, Default, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct DisplayPath(PathBuf);

impl From<PathBuf> for DisplayPath {
    fn from(value: PathBuf) -> Self {
        DisplayPath(value)
    }
}

impl Deref for DisplayPath {
    type Target = Path;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl AsRef<Path> for DisplayPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl Display for DisplayPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_string_lossy())
    }
}

impl FromStr for DisplayPath {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(PathBuf::from(s)))
    }
}

impl DisplayPath {
    pub fn new(path: PathBuf) -> Self {
        Self(path)
    }

    pub fn path(&self) -> &Path {
        &self.0
    }
}
