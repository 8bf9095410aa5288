//! Backward pagination over a channel log.
//!
//! The cursor is the id of the oldest loaded message. Pages are read
//! backward from it with an inclusive bound, so the entry at the cursor comes
//! back again and is stripped. The boundary marker (the channel's oldest id)
//! tells when history is exhausted.
//!
//! Fetching and committing are split: [`CursorTracker::request`] describes
//! the next read, [`PageRequest::fetch`] performs it without touching the
//! tracker, and [`CursorTracker::commit`] applies a successful result. A
//! failed or abandoned fetch therefore leaves the tracker as it was.
use tracing::{debug, warn};

use palaver_types::api::Direction;
use palaver_types::fields::LogEntry;
use palaver_types::models::{ChannelId, Message, MessageId};

use crate::error::SyncError;
use crate::session::SessionContext;
use crate::store::MessageStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub channel_id: ChannelId,
    /// `None` for the initial page.
    pub cursor: Option<MessageId>,
    pub page_size: usize,
}

impl PageRequest {
    pub fn is_initial(&self) -> bool {
        self.cursor.is_none()
    }

    pub async fn fetch<S: MessageStore>(&self, store: &S) -> Result<Page, SyncError> {
        // One extra so a full page survives stripping the cursor entry.
        let limit = match self.cursor {
            Some(_) => self.page_size + 1,
            None => self.page_size,
        };
        let entries = store
            .range_read(
                &self.channel_id,
                self.cursor.as_ref().map(MessageId::as_str),
                Direction::Backward,
                limit,
            )
            .await
            .map_err(SyncError::FetchFailed)?;
        Ok(Page::from_entries(self, entries))
    }
}

/// Oldest message id of a channel, `None` for an empty channel.
pub async fn fetch_boundary<S: MessageStore>(
    store: &S,
    channel_id: &ChannelId,
) -> Result<Option<MessageId>, SyncError> {
    let first = store
        .range_read(channel_id, None, Direction::Forward, 1)
        .await
        .map_err(SyncError::FetchFailed)?;
    Ok(first.into_iter().next().map(|entry| MessageId::new(entry.key)))
}

/// The initial page together with the boundary marker, both or neither.
pub async fn fetch_initial<S: MessageStore>(
    store: &S,
    request: &PageRequest,
) -> Result<(Page, Option<MessageId>), SyncError> {
    let (page, boundary) = tokio::join!(request.fetch(store), fetch_boundary(store, &request.channel_id));
    Ok((page?, boundary?))
}

/// One fetched page, ascending by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub messages: Vec<Message>,
    /// Cursor the page was requested with.
    pub requested_cursor: Option<MessageId>,
    /// Oldest key in the page, whether or not it decoded.
    pub oldest_key: Option<MessageId>,
    /// Entries in the page before decoding.
    pub raw_len: usize,
    /// Entries dropped because they could not be decoded.
    pub skipped: usize,
}

impl Page {
    fn from_entries(request: &PageRequest, mut entries: Vec<LogEntry>) -> Self {
        if let Some(cursor) = &request.cursor {
            entries.retain(|entry| entry.key != cursor.as_str());
        }
        if entries.len() > request.page_size {
            let surplus = entries.len() - request.page_size;
            entries.drain(..surplus);
        }

        let oldest_key = entries.first().map(|entry| MessageId::new(entry.key.as_str()));
        let raw_len = entries.len();
        let mut messages = Vec::with_capacity(raw_len);
        let mut skipped = 0;
        for entry in &entries {
            match Message::from_entry(&request.channel_id, entry) {
                Ok(message) => messages.push(message),
                Err(e) => {
                    warn!("Skipping malformed entry in {}: {}", request.channel_id, e);
                    skipped += 1;
                }
            }
        }

        Self {
            messages,
            requested_cursor: request.cursor.clone(),
            oldest_key,
            raw_len,
            skipped,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw_len == 0
    }
}

pub struct CursorTracker {
    channel_id: ChannelId,
    page_size: usize,
    session: SessionContext,
    cursor: Option<MessageId>,
    /// `None` until fetched; `Some(None)` for a channel that was empty.
    boundary: Option<Option<MessageId>>,
    initial_loaded: bool,
    last_page_empty: bool,
}

impl CursorTracker {
    pub fn new(channel_id: ChannelId, page_size: usize, session: SessionContext) -> Self {
        Self {
            channel_id,
            page_size: page_size.max(1),
            session,
            cursor: None,
            boundary: None,
            initial_loaded: false,
            last_page_empty: false,
        }
    }

    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn cursor(&self) -> Option<&MessageId> {
        self.cursor.as_ref()
    }

    pub fn boundary(&self) -> Option<&MessageId> {
        self.boundary.as_ref().and_then(Option::as_ref)
    }

    pub fn initial_loaded(&self) -> bool {
        self.initial_loaded
    }

    /// Whether another backward page may exist. False before the initial
    /// page, and false for good once the boundary is reached or a page comes
    /// back empty.
    pub fn is_paginatable(&self) -> bool {
        if !self.initial_loaded || self.last_page_empty {
            return false;
        }
        match (&self.cursor, &self.boundary) {
            (None, _) => false,
            (Some(cursor), Some(Some(boundary))) => cursor != boundary,
            (Some(_), _) => true,
        }
    }

    /// The next read to perform: the initial page until one has been
    /// committed, then the page before the cursor. `Ok(None)` once history
    /// is exhausted.
    pub fn request(&self) -> Result<Option<PageRequest>, SyncError> {
        self.session.require_user()?;
        if self.initial_loaded && !self.is_paginatable() {
            return Ok(None);
        }
        Ok(Some(PageRequest {
            channel_id: self.channel_id.clone(),
            cursor: if self.initial_loaded { self.cursor.clone() } else { None },
            page_size: self.page_size,
        }))
    }

    pub fn set_boundary(&mut self, boundary: Option<MessageId>) {
        debug!("Boundary of {} is {:?}", self.channel_id, boundary);
        self.boundary = Some(boundary);
    }

    /// Whether `page` was requested from the tracker's current position.
    pub fn expects(&self, page: &Page) -> bool {
        let expected = if self.initial_loaded { self.cursor.as_ref() } else { None };
        page.requested_cursor.as_ref() == expected
    }

    /// Apply a fetched page. Returns false, changing nothing, when the page
    /// was requested for a cursor other than the current one.
    pub fn commit(&mut self, page: &Page) -> bool {
        if !self.expects(page) {
            warn!(
                "Discarding page for cursor {:?} in {}, tracker is at {:?}",
                page.requested_cursor, self.channel_id, self.cursor
            );
            return false;
        }

        self.initial_loaded = true;
        self.last_page_empty = page.is_empty();
        if let Some(oldest) = &page.oldest_key {
            self.cursor = Some(oldest.clone());
        }
        true
    }

    /// Most recent `page_size` messages plus the boundary marker.
    pub async fn initial_page<S: MessageStore>(&mut self, store: &S) -> Result<Page, SyncError> {
        self.session.require_user()?;
        let request = PageRequest {
            channel_id: self.channel_id.clone(),
            cursor: None,
            page_size: self.page_size,
        };
        let (page, boundary) = fetch_initial(store, &request).await?;
        self.initial_loaded = false;
        self.cursor = None;
        self.set_boundary(boundary);
        self.commit(&page);
        Ok(page)
    }

    /// The page before the cursor; an empty page once history is exhausted.
    /// Falls back to the initial page when none has been loaded.
    pub async fn next_page<S: MessageStore>(&mut self, store: &S) -> Result<Page, SyncError> {
        if !self.initial_loaded {
            return self.initial_page(store).await;
        }
        let Some(request) = self.request()? else {
            return Ok(Page {
                messages: vec![],
                requested_cursor: self.cursor.clone(),
                oldest_key: None,
                raw_len: 0,
                skipped: 0,
            });
        };
        let page = request.fetch(store).await?;
        self.commit(&page);
        Ok(page)
    }
}
