//! The capability check that guards writes to the shared global rule table.

use crate::error::{Error, ErrorType, Result};
use anyhow::anyhow;
use std::collections::BTreeSet;

/// Proof that an actor was allowed to write to the global rule table. It can only be obtained from
/// `Authorizer::check`, so holding one means the check passed.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct AdminCapability {
    actor: String,
}

impl AdminCapability {
    pub fn actor(&self) -> &str {
        &self.actor
    }
}

/// Decides which actors may seed or publish global rules, from the `admins` list in the config.
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct Authorizer {
    admins: BTreeSet<String>,
}

impl Authorizer {
    pub fn new<I, S>(admins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            admins: admins
                .into_iter()
                .map(Into::into)
                .map(|s: String| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn check(&self, actor: &str) -> Result<AdminCapability> {
        let actor = actor.trim();
        if self.admins.contains(actor) {
            Ok(AdminCapability {
                actor: actor.to_string(),
            })
        } else {
            Err(Error::new(
                ErrorType::Authorization,
                anyhow!("'{actor}' is not allowed to modify the global rule table"),
            ))
        }
    }

    #[cfg(test)]
    pub(crate) fn grant(actor: &str) -> AdminCapability {
        AdminCapability {
            actor: actor.to_string(),
        }
    }
}
