use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::error::StoreError;

/// Read-only view of the repositories tasks operate on.
#[async_trait]
pub trait ResourceStore: Send + Sync {
  async fn exists(&self, id: &str) -> Result<bool, StoreError>;

  /// The upstream feed a repository syncs from, if it has one.
  async fn source(&self, id: &str) -> Result<Option<String>, StoreError>;
}

#[derive(Default)]
pub struct MemoryResourceStore {
  repos: RwLock<HashMap<String, Option<String>>>,
}

impl MemoryResourceStore {
  pub fn new() -> Self {
    Self::default()
  }

  pub async fn insert(&self, id: impl Into<String>, source: Option<String>) {
    self.repos.write().await.insert(id.into(), source);
  }

  /// Parses `id[=feed]` entries separated by commas.
  pub async fn seed(&self, spec: &str) {
    for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
      match entry.split_once('=') {
        Some((id, feed)) => self.insert(id.trim(), Some(feed.trim().to_string())).await,
        None => self.insert(entry, None).await,
      }
    }
  }
}

#[async_trait]
impl ResourceStore for MemoryResourceStore {
  async fn exists(&self, id: &str) -> Result<bool, StoreError> {
    Ok(self.repos.read().await.contains_key(id))
  }

  async fn source(&self, id: &str) -> Result<Option<String>, StoreError> {
    Ok(self.repos.read().await.get(id).cloned().flatten())
  }
}

pub struct PgResourceStore {
  pool: PgPool,
}

impl PgResourceStore {
  pub fn new(pool: PgPool) -> Self {
    Self { pool }
  }
}

#[async_trait]
impl ResourceStore for PgResourceStore {
  async fn exists(&self, id: &str) -> Result<bool, StoreError> {
    let found: Option<(String,)> = sqlx::query_as("SELECT id FROM repositories WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(found.is_some())
  }

  async fn source(&self, id: &str) -> Result<Option<String>, StoreError> {
    let row: Option<(Option<String>,)> = sqlx::query_as("SELECT source FROM repositories WHERE id = $1")
      .bind(id)
      .fetch_optional(&self.pool)
      .await?;
    Ok(row.and_then(|(source,)| source))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn seed_parses_ids_and_feeds() {
    let store = MemoryResourceStore::new();
    store.seed("repo-a=yum:http://mirror/a, repo-b ,").await;

    assert!(store.exists("repo-a").await.unwrap());
    assert!(store.exists("repo-b").await.unwrap());
    assert!(!store.exists("repo-c").await.unwrap());
    assert_eq!(store.source("repo-a").await.unwrap().as_deref(), Some("yum:http://mirror/a"));
    assert_eq!(store.source("repo-b").await.unwrap(), None);
  }
}
