//! Pick the storage backend named by the config.
//!
//! `Auto` priority: File (when a directory is configured) → Memory (fallback)

use std::rc::Rc;
use chat_core::ports::StoragePort;
use chat_types::{
    config::{StorageBackendType, StorageConfig},
    ChatError, Result,
};
use super::{FileStorage, MemoryStorage};

/// Open the configured storage backend.
/// Returns a trait object so callers are backend-agnostic.
pub async fn auto_detect_storage(config: &StorageConfig) -> Result<Rc<dyn StoragePort>> {
    match config.backend {
        StorageBackendType::Memory => {
            log::info!("Storage backend: memory");
            Ok(Rc::new(MemoryStorage::new()))
        }
        StorageBackendType::File => {
            let dir = config
                .dir
                .as_deref()
                .ok_or_else(|| ChatError::Config("file storage needs storage.dir".to_string()))?;
            let storage = FileStorage::open(dir).await?;
            log::info!("Storage backend: file ({})", dir);
            Ok(Rc::new(storage))
        }
        StorageBackendType::Auto => {
            let Some(dir) = config.dir.as_deref() else {
                log::info!("Storage backend: memory (no directory configured)");
                return Ok(Rc::new(MemoryStorage::new()));
            };
            match FileStorage::open(dir).await {
                Ok(storage) => {
                    log::info!("Storage backend: file ({})", dir);
                    Ok(Rc::new(storage))
                }
                Err(e) => {
                    log::warn!("File storage unavailable ({}), falling back to memory", e);
                    Ok(Rc::new(MemoryStorage::new()))
                }
            }
        }
    }
}
