//! Message cache on top of any key-value `StoragePort`.
//! Each session's list is one JSON value under `messages:{session_id}`.

use std::rc::Rc;

use async_trait::async_trait;
use chat_core::ports::{MessageCachePort, StoragePort};
use chat_types::{message::Message, ChatError, Result};

const KEY_PREFIX: &str = "messages:";

pub struct KvMessageCache {
    storage: Rc<dyn StoragePort>,
}

impl KvMessageCache {
    pub fn new(storage: Rc<dyn StoragePort>) -> Self {
        Self { storage }
    }

    pub fn key(session_id: &str) -> String {
        format!("{}{}", KEY_PREFIX, session_id)
    }

    /// Sessions that have a cached list
    pub async fn sessions(&self) -> Result<Vec<String>> {
        let keys = self.storage.list_keys(KEY_PREFIX).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(KEY_PREFIX).map(str::to_string))
            .collect())
    }

    pub async fn evict(&self, session_id: &str) -> Result<()> {
        self.storage.delete(&Self::key(session_id)).await
    }
}

#[async_trait(?Send)]
impl MessageCachePort for KvMessageCache {
    async fn load(&self, session_id: &str) -> Result<Option<Vec<Message>>> {
        let Some(bytes) = self.storage.get(&Self::key(session_id)).await? else {
            return Ok(None);
        };
        match serde_json::from_slice::<Vec<Message>>(&bytes) {
            Ok(messages) => Ok(Some(messages)),
            Err(e) => {
                // A corrupt entry is treated as a miss; the next save overwrites it
                log::warn!("Discarding unreadable cache for {}: {}", session_id, e);
                Ok(None)
            }
        }
    }

    async fn save(&self, messages: &[Message], session_id: &str) -> Result<()> {
        let json = serde_json::to_vec(messages)?;
        self.storage
            .set(&Self::key(session_id), &json)
            .await
            .map_err(|e| match e {
                ChatError::Persistence(_) => e,
                other => ChatError::Persistence(other.to_string()),
            })
    }
}
