use crate::args::{PublishArgs, SeedArgs};
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::rules::{seed_rules, RuleStore};
use crate::{Config, Result};

fn rule_store(config: &Config) -> RuleStore {
    RuleStore::new(config.store(), config.sync_options().batch_size)
}

/// Upserts the built-in global rule table.
pub async fn rules_seed(config: Config, args: &SeedArgs) -> Result<Out<usize>> {
    let capability = config.authorizer().check(args.actor())?;
    let rules = seed_rules().pub_result(ErrorType::Internal)?;
    let written = rule_store(&config)
        .seed_global(&capability, &rules)
        .await
        .pub_result(ErrorType::Store)?;
    Ok(Out::new(
        format!("Seeded {written} global rules as {}", capability.actor()),
        written,
    ))
}

/// Copies one user's rules into the global table.
pub async fn rules_publish(config: Config, args: &PublishArgs) -> Result<Out<usize>> {
    let capability = config.authorizer().check(args.actor())?;
    let written = rule_store(&config)
        .publish(args.user(), &capability)
        .await
        .pub_result(ErrorType::Store)?;
    Ok(Out::new(
        format!(
            "Published {written} rules from {} as {}",
            args.user(),
            capability.actor()
        ),
        written,
    ))
}
