use crate::api::{self, Mode};
use crate::args::LinkArgs;
use crate::commands::Out;
use crate::error::{ErrorType, IntoResult};
use crate::model::Account;
use crate::store::{decode, encode, paths, DocumentStore, SetMode};
use crate::{Config, Result};
use anyhow::Context;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize)]
pub struct LinkSummary {
    pub user_id: String,
    pub item_id: String,
    pub accounts: Vec<String>,
    pub webhook_registered: bool,
}

/// Exchanges the public token, registers the configured webhook and records each account with
/// its access token. Re-linking an account under the same item keeps its cursor; a new item starts
/// from an empty cursor.
pub async fn link(config: Config, mode: Mode, args: &LinkArgs) -> Result<Out<LinkSummary>> {
    let feed = api::feed(&config, mode)?;
    let store = config.store();
    let user_id = args.user();

    let grant = feed
        .exchange_public_token(args.public_token())
        .await
        .context("Unable to exchange the public token")
        .pub_result(ErrorType::Feed)?;

    let webhook_registered = match config.webhook_url() {
        Some(url) => {
            feed.register_webhook(&grant.access_token, url)
                .await
                .context("Unable to register the webhook")
                .pub_result(ErrorType::Feed)?;
            true
        }
        None => false,
    };

    store
        .set(
            paths::USERS,
            user_id,
            encode(&serde_json::json!({ "user_id": user_id })).pub_result(ErrorType::Internal)?,
            SetMode::Merge,
        )
        .await
        .pub_result(ErrorType::Store)?;

    let collection = paths::accounts(user_id);
    for account_id in args.accounts() {
        let existing = store
            .get(&collection, account_id)
            .await
            .pub_result(ErrorType::Store)?
            .and_then(|doc| match decode::<Account>(doc) {
                Ok(account) => Some(account),
                Err(e) => {
                    warn!("Replacing malformed account {collection}/{account_id}: {e:#}");
                    None
                }
            });
        let cursor = existing
            .filter(|prior| prior.item_id == grant.item_id)
            .and_then(|prior| prior.cursor);
        let account = Account {
            account_id: account_id.clone(),
            user_id: user_id.to_string(),
            item_id: grant.item_id.clone(),
            access_token: grant.access_token.clone(),
            cursor,
        };
        store
            .set(
                &collection,
                account_id,
                encode(&account).pub_result(ErrorType::Internal)?,
                SetMode::Replace,
            )
            .await
            .pub_result(ErrorType::Store)?;
        info!("Linked account {account_id} for {user_id}");
    }

    let summary = LinkSummary {
        user_id: user_id.to_string(),
        item_id: grant.item_id,
        accounts: args.accounts().to_vec(),
        webhook_registered,
    };
    Ok(Out::new(
        format!("Linked {} account(s) for {user_id}", summary.accounts.len()),
        summary,
    ))
}
