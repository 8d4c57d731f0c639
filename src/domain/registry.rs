//! Registry of currently reachable endpoints
//!
//! Maps a user identity (the user part of a SIP URI) to the `host:port`
//! it last registered from. Entries never expire; they live until the
//! process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Identity -> address directory
#[async_trait]
pub trait Registry: Send + Sync {
    /// Store or overwrite the address for `user`
    async fn add(&self, user: &str, address: &str);

    /// Current address of `user`, if registered
    async fn get(&self, user: &str) -> Option<String>;

    /// Number of registered identities
    async fn len(&self) -> usize;

    async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// In-memory registry
#[derive(Clone, Default)]
pub struct InMemoryRegistry {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn add(&self, user: &str, address: &str) {
        let previous = self
            .entries
            .write()
            .await
            .insert(user.to_string(), address.to_string());

        match previous {
            Some(old) if old != address => {
                debug!("Registry: {} moved from {} to {}", user, old, address)
            }
            Some(_) => debug!("Registry: {} refreshed at {}", user, address),
            None => debug!("Registry: {} registered at {}", user, address),
        }
    }

    async fn get(&self, user: &str) -> Option<String> {
        self.entries.read().await.get(user).cloned()
    }

    async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}
