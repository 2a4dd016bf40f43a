use crate::api::{self, Mode};
use crate::args::SyncArgs;
use crate::commands::{resolver, Out};
use crate::error::{ErrorType, IntoResult};
use crate::model::{any_failed, OwnerOutcome, OwnerReport};
use crate::sync::{SyncEngine, SyncOptions, SyncReport};
use crate::{Config, Result};
use anyhow::anyhow;

/// Pulls transactions for one account, one user or every user, depending on `args`. A failure on
/// a single account is returned as an error; for a user or for everyone the per-owner outcome is
/// reported and the `Out` is marked failed.
pub async fn sync(config: Config, mode: Mode, args: &SyncArgs) -> Result<Out<OwnerReport<SyncReport>>> {
    let options = SyncOptions {
        removed: args.removed().unwrap_or(config.sync_options().removed),
        ..config.sync_options()
    };
    let engine = SyncEngine::new(
        config.store(),
        api::feed(&config, mode)?,
        resolver(&config, mode)?,
        options,
    );

    let report = match (args.all(), args.user(), args.account()) {
        (true, _, _) => engine.sync_all().await?,
        (false, Some(user_id), Some(account_id)) => {
            let stats = engine.sync_account(user_id, account_id).await?;
            OwnerReport::from([(user_id.to_string(), OwnerOutcome { stats, error: None })])
        }
        (false, Some(user_id), None) => {
            OwnerReport::from([(user_id.to_string(), engine.sync_user(user_id).await)])
        }
        (false, None, _) => {
            return Err(anyhow!("Either --user or --all is required")).pub_result(ErrorType::Validation)
        }
    };

    let mut total = SyncReport::default();
    for outcome in report.values() {
        total += outcome.stats;
    }
    let failed = any_failed(&report);
    let message = format!(
        "Synced {} owner(s){}: {} added, {} modified, {} removed, {} unresolved",
        report.len(),
        if failed { " with failures" } else { "" },
        total.added,
        total.modified,
        total.removed,
        total.unresolved
    );
    Ok(Out::new(message, report).with_failure(failed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::LinkArgs;
    use crate::commands::link;
    use crate::model::TransactionRecord;
    use crate::store::{decode, paths, DocumentStore};
    use crate::test::TestEnv;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrap {
        #[clap(flatten)]
        args: SyncArgs,
    }

    fn sync_args(argv: &[&str]) -> SyncArgs {
        Wrap::parse_from(std::iter::once("sync").chain(argv.iter().copied())).args
    }

    #[tokio::test]
    async fn test_sync_user_in_test_mode() {
        let env = TestEnv::new().await;
        link(env.config(), Mode::Test, &LinkArgs::new("u1", "p", vec!["a1".to_string()]))
            .await
            .unwrap();

        let out = sync(env.config(), Mode::Test, &sync_args(&["--user", "u1"]))
            .await
            .unwrap();
        assert!(!out.failed());
        let report = out.structure().unwrap();
        assert_eq!(report["u1"].stats.added, 6);

        let store = env.config().store();
        let doc = store
            .get(&paths::transactions("u1"), "a1-sample-000")
            .await
            .unwrap()
            .unwrap();
        let record: TransactionRecord = decode(doc).unwrap();
        assert_eq!(record.category.l3, "Supplies");

        // The second run starts from the stored cursor and finds nothing new.
        let again = sync(env.config(), Mode::Test, &sync_args(&["--all"]))
            .await
            .unwrap();
        assert_eq!(again.structure().unwrap()["u1"].stats.added, 0);
    }

    #[tokio::test]
    async fn test_sync_unknown_account_is_an_error() {
        let env = TestEnv::new().await;
        let err = sync(env.config(), Mode::Test, &sync_args(&["--user", "u1", "--account", "nope"]))
            .await
            .unwrap_err();
        assert_eq!(err.error_type(), ErrorType::Validation);
    }
}
