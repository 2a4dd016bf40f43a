//! Types that represent the core data model, such as `TransactionRecord` and `CategoryLabel`.
mod account;
mod category;
mod rule;
mod stats;
mod transaction;

pub use account::{Account, Contact, ContactKind, UserContext};
pub use category::{normalize_l0, CategoryLabel, L0};
pub use rule::{normalize_text, rule_key, KeywordRule, RuleScope, GLOBAL_OWNER};
pub use stats::{any_failed, total, OwnerOutcome, OwnerReport, RunStats};
pub use transaction::{ResolutionSource, TransactionRecord};
