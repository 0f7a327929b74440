//! Configuration for a [`ClientCache`](crate::cache::ClientCache).

use serde::{Deserialize, Serialize};

/// What happens to mirrored rows when a new session starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectPolicy {
    /// Fire `on_delete` for every cached row before clearing the mirrors, so
    /// observers end the old session with an empty view of it.
    #[default]
    SynthesizeDeletes,
    /// Clear the mirrors without row callbacks. Reactive views still refresh.
    ClearSilently,
}

/// Configuration for a client cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Mirror handling on reconnect.
    pub reconnect_policy: ReconnectPolicy,
    /// Merge a delete and an insert of the same primary key within one table
    /// update into a single update.
    pub pair_primary_key_updates: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            reconnect_policy: ReconnectPolicy::SynthesizeDeletes,
            pair_primary_key_updates: true,
        }
    }
}
