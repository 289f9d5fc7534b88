use crate::error::Result;
use crate::models::registration::RegistrationRow;
use async_trait::async_trait;

pub mod sqlite;

/// Source of truth for device registrations, polled by the reconciler. The
/// storage behind it (spreadsheet, relational store) is a collaborator; the
/// relay only sees materialized rows.
#[async_trait]
pub trait RegistrySource: Send + Sync {
    async fn fetch_active(&self) -> Result<Vec<RegistrationRow>>;
}
