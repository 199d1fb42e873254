//! Credential source collaborator for the authorization handshake
//!
//! The session manager queries a [`CredentialSource`] once per successful
//! connection and authorizes with the first account's token. Storage details
//! (encryption, key derivation, prompting) live outside this crate; the
//! reference implementations here keep plain data in memory or in a JSON
//! file for embedding and tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::RwLock;

/// One account/token pair as returned by the credential store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountToken {
    pub account: String,
    pub token: String,
}

/// External collaborator providing authorization tokens
#[async_trait]
pub trait CredentialSource: Send + Sync {
    /// Load the ordered sequence of account/token pairs (possibly empty)
    async fn load(&self) -> Result<Vec<AccountToken>>;

    /// Persist a sequence of account/token pairs.
    ///
    /// Used by external setup code; the session manager itself never writes.
    async fn store(&self, accounts: Vec<AccountToken>) -> Result<()>;
}

/// In-memory credential source
#[derive(Default)]
pub struct MemoryCredentials {
    accounts: RwLock<Vec<AccountToken>>,
}

impl MemoryCredentials {
    pub fn new(accounts: Vec<AccountToken>) -> Self {
        Self {
            accounts: RwLock::new(accounts),
        }
    }

    /// Convenience constructor for a single account
    pub fn single(account: impl Into<String>, token: impl Into<String>) -> Self {
        Self::new(vec![AccountToken {
            account: account.into(),
            token: token.into(),
        }])
    }
}

#[async_trait]
impl CredentialSource for MemoryCredentials {
    async fn load(&self) -> Result<Vec<AccountToken>> {
        Ok(self.accounts.read().await.clone())
    }

    async fn store(&self, accounts: Vec<AccountToken>) -> Result<()> {
        *self.accounts.write().await = accounts;
        Ok(())
    }
}

/// JSON-file-backed credential source
pub struct FileCredentials {
    path: PathBuf,
}

impl FileCredentials {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl CredentialSource for FileCredentials {
    async fn load(&self) -> Result<Vec<AccountToken>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow!("Failed to read credentials file: {}", e))?;
        let accounts: Vec<AccountToken> = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("Invalid credentials file format: {}", e))?;
        Ok(accounts)
    }

    async fn store(&self, accounts: Vec<AccountToken>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let raw = serde_json::to_string_pretty(&accounts)?;
        tokio::fs::write(&self.path, raw)
            .await
            .map_err(|e| anyhow!("Failed to write credentials file: {}", e))?;
        Ok(())
    }
}
