use crate::api::Mode;
use crate::args::{JobArgs, RelabelArgs, RepairArgs};
use crate::commands::{resolver, runner_options, Out};
use crate::migrate::{MigrationRunner, NormalizeL0, ReResolve, RelabelMap};
use crate::model::{any_failed, total, OwnerReport, RunStats};
use crate::{Config, Result};

fn summarize(job: &str, report: &OwnerReport<RunStats>, dry_run: bool) -> Out<OwnerReport<RunStats>> {
    let sum = total(report);
    let failed = any_failed(report);
    let message = format!(
        "{job}{} over {} owner(s): scanned {}, updated {}, skipped {}, errored {}{}",
        if dry_run { " (dry run)" } else { "" },
        report.len(),
        sum.scanned,
        sum.updated,
        sum.skipped,
        sum.errored,
        if failed { "; some owners failed" } else { "" }
    );
    Out::new(message, report.clone()).with_failure(failed)
}

/// Normalizes `l0` on every owner's transactions.
pub async fn normalize_l0(config: Config, args: &JobArgs) -> Result<Out<OwnerReport<RunStats>>> {
    let options = runner_options(&config, args)?;
    let runner = MigrationRunner::new(config.store(), options)?;
    let report = runner.run_all(&NormalizeL0).await?;
    Ok(summarize("normalize-l0", &report, options.dry_run))
}

/// Re-resolves one owner's unresolved and needs-review transactions. A store failure part way
/// through is reported in the owner's outcome along with the counts reached before it.
pub async fn repair(config: Config, mode: Mode, args: &RepairArgs) -> Result<Out<OwnerReport<RunStats>>> {
    let options = runner_options(&config, args.job())?;
    let store = config.store();
    let transform = ReResolve::for_user(resolver(&config, mode)?, store.as_ref(), args.user()).await?;
    let outcome = MigrationRunner::new(store, options)?
        .run_owner(args.user(), &transform)
        .await;
    let report = OwnerReport::from([(args.user().to_string(), outcome)]);
    Ok(summarize("repair", &report, options.dry_run))
}

/// Applies a relabel mapping file to one owner or to every owner.
pub async fn relabel(config: Config, args: &RelabelArgs) -> Result<Out<OwnerReport<RunStats>>> {
    let options = runner_options(&config, args.job())?;
    let map = RelabelMap::from_file(args.mapping()).await?;
    let runner = MigrationRunner::new(config.store(), options)?;
    let report = match args.user() {
        Some(user_id) => {
            OwnerReport::from([(user_id.to_string(), runner.run_owner(user_id, &map).await)])
        }
        None => runner.run_all(&map).await?,
    };
    Ok(summarize("relabel", &report, options.dry_run))
}
