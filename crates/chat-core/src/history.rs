//! History paginator: cache-first paged loading of older messages.
//!
//! The first page of a session is served from the local cache when one
//! exists; everything else comes from the history port. A successful remote
//! fetch refreshes the cache. Failures degrade to an empty page except for
//! connectivity problems, which the caller may retry.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use chat_types::{
    message::{Message, MessageKind, MessageStatus},
    session::{HistoryRecord, Page, PageSource, PaginationCursor},
    Result,
};

use crate::classify;
use crate::extract::{self, PayloadExtractor};
use crate::ports::{HistoryPort, MessageCachePort};

/// Cheap to clone: ports and cursors are shared, so a clone can be moved
/// into a detached future.
#[derive(Clone)]
pub struct HistoryPaginator {
    history: Rc<dyn HistoryPort>,
    cache: Rc<dyn MessageCachePort>,
    project: String,
    page_size: usize,
    cursors: Rc<RefCell<HashMap<String, PaginationCursor>>>,
}

impl HistoryPaginator {
    pub fn new(
        history: Rc<dyn HistoryPort>,
        cache: Rc<dyn MessageCachePort>,
        project: impl Into<String>,
        page_size: usize,
    ) -> Self {
        Self {
            history,
            cache,
            project: project.into(),
            page_size: page_size.max(1),
            cursors: Rc::new(RefCell::new(HashMap::new())),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn cursor(&self, session_id: &str) -> PaginationCursor {
        self.cursors
            .borrow()
            .get(session_id)
            .copied()
            .unwrap_or_else(|| PaginationCursor::new(self.page_size))
    }

    /// Load one page. Offset 0 is cache-first.
    pub async fn load_page(&self, session_id: &str, offset: usize, page_size: usize) -> Result<Page> {
        let (page, _) = self.load_counted(session_id, offset, page_size).await?;
        Ok(page)
    }

    /// Load the page after the session's cursor and advance it
    pub async fn load_next(&self, session_id: &str) -> Result<Page> {
        let cursor = self.cursor(session_id);
        if !cursor.has_more {
            return Ok(Page {
                messages: Vec::new(),
                has_more: false,
                source: PageSource::Empty,
            });
        }
        let (page, fetched) = self
            .load_counted(session_id, cursor.offset, cursor.page_size)
            .await?;
        self.move_cursor(session_id, &page, fetched);
        Ok(page)
    }

    /// Bypass the cache for the first page and start the cursor over
    pub async fn refresh(&self, session_id: &str) -> Result<Page> {
        self.reset(session_id);
        let (page, fetched) = self.load_remote(session_id, 0, self.page_size).await?;
        self.move_cursor(session_id, &page, fetched);
        Ok(page)
    }

    /// Save the live list. Failures are logged and never surface.
    pub async fn persist(&self, session_id: &str, messages: &[Message]) {
        let settled: Vec<Message> = messages.iter().filter(|m| !m.streaming).cloned().collect();
        if let Err(e) = self.cache.save(&settled, session_id).await {
            log::warn!("Failed to persist {} messages for {}: {}", settled.len(), session_id, e);
        }
    }

    pub fn reset(&self, session_id: &str) {
        self.cursors.borrow_mut().remove(session_id);
    }

    async fn load_counted(
        &self,
        session_id: &str,
        offset: usize,
        page_size: usize,
    ) -> Result<(Page, usize)> {
        if offset == 0 {
            match self.cache.load(session_id).await {
                Ok(Some(cached)) if !cached.is_empty() => {
                    log::debug!("History for {} served from cache ({})", session_id, cached.len());
                    let count = cached.len();
                    let page = Page {
                        messages: cached.into_iter().map(settle_cached).collect(),
                        has_more: count >= page_size,
                        source: PageSource::Cache,
                    };
                    return Ok((page, count));
                }
                Ok(_) => {}
                Err(e) => log::warn!("Cache read failed for {}: {}", session_id, e),
            }
        }
        self.load_remote(session_id, offset, page_size).await
    }

    /// Remote page plus the number of records the backend returned, which
    /// can exceed the number of messages kept.
    async fn load_remote(
        &self,
        session_id: &str,
        offset: usize,
        page_size: usize,
    ) -> Result<(Page, usize)> {
        let records = match self
            .history
            .fetch(&self.project, session_id, page_size, offset)
            .await
        {
            Ok(records) => records,
            Err(e) if e.is_not_found() => {
                log::debug!("No history for {}", session_id);
                return Ok((Page::empty(), 0));
            }
            Err(e) if e.is_connectivity() => {
                log::warn!("History fetch for {} failed: {}", session_id, e);
                return Err(e);
            }
            Err(e) => {
                log::warn!("History for {} unavailable: {}", session_id, e);
                return Ok((Page::empty(), 0));
            }
        };

        let has_more = records.len() == page_size;
        let messages: Vec<Message> = records.iter().filter_map(record_to_message).collect();
        self.refresh_cache(session_id, offset, &messages).await;

        let page = Page {
            messages,
            has_more,
            source: PageSource::Remote,
        };
        Ok((page, records.len()))
    }

    async fn refresh_cache(&self, session_id: &str, offset: usize, page: &[Message]) {
        let merged = if offset == 0 {
            page.to_vec()
        } else {
            // older page: prepend to what is cached, skipping ids already there
            let cached = match self.cache.load(session_id).await {
                Ok(cached) => cached.unwrap_or_default(),
                Err(e) => {
                    log::warn!("Cache read failed for {}: {}", session_id, e);
                    return;
                }
            };
            let mut merged: Vec<Message> = page
                .iter()
                .filter(|m| !cached.iter().any(|c| c.id == m.id))
                .cloned()
                .collect();
            merged.extend(cached);
            merged
        };
        if let Err(e) = self.cache.save(&merged, session_id).await {
            log::warn!("Cache write failed for {}: {}", session_id, e);
        }
    }

    fn move_cursor(&self, session_id: &str, page: &Page, fetched: usize) {
        let mut cursors = self.cursors.borrow_mut();
        let cursor = cursors
            .entry(session_id.to_string())
            .or_insert_with(|| PaginationCursor::new(self.page_size));
        match page.source {
            PageSource::Remote => cursor.advance(fetched),
            PageSource::Cache => {
                cursor.offset += fetched;
                cursor.has_more = page.has_more;
            }
            PageSource::Empty => cursor.has_more = false,
        }
    }
}

/// Convert a history record. Records without usable content are skipped.
pub fn record_to_message(record: &HistoryRecord) -> Option<Message> {
    let text = extract::text_or_fragments(&record.content)
        .or_else(|| PayloadExtractor::new().extract(&record.content).map(|e| e.text))?;
    if extract::is_noise(&text) {
        return None;
    }

    let mut message = match record.role.as_str() {
        "user" | "human" => {
            let mut message = Message::outbound(text);
            message.id = record.id.clone();
            message.status = MessageStatus::Delivered;
            message
        }
        "system" => Message::inbound(record.id.clone(), text, MessageKind::System),
        _ => {
            let kind = classify::detect_kind(&text);
            Message::inbound(record.id.clone(), text, kind)
        }
    };
    if let Some(timestamp) = record.timestamp {
        message.timestamp = timestamp;
    }
    Some(message)
}

/// Cached messages outlive the timers that tracked them
fn settle_cached(mut message: Message) -> Message {
    if message.is_outbound() && message.status.is_pending() {
        message.status = MessageStatus::Failed;
    }
    message.streaming = false;
    message
}

impl std::fmt::Debug for HistoryPaginator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HistoryPaginator")
            .field("project", &self.project)
            .field("page_size", &self.page_size)
            .finish()
    }
}
