//! One worker task per open channel.
//!
//! The worker exclusively owns the channel's [`CursorTracker`], [`Timeline`]
//! and [`LiveTail`]. Commands from [`TimelineHandle`]s and results from the
//! fetch, subscription and reaction tasks it spawns all arrive through one
//! queue, so every mutation of channel state is serialized. Results carry
//! the epoch of the open they belong to and are ignored otherwise.
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use palaver_types::models::{Channel, ChannelId, Message, MessageId, UserId};

use crate::config::SyncConfig;
use crate::cursor::{self, CursorTracker, Page, PageRequest};
use crate::error::{StoreError, SyncError};
use crate::live_tail::{self, LiveSignal, LiveTail, LiveTailState};
use crate::reactions::{self, ReactionAggregator};
use crate::session::SessionContext;
use crate::store::{AppendEvent, MessageStore};
use crate::timeline::{AppendOutcome, ReactionUndo, Timeline};

const EVENT_CAPACITY: usize = 256;

/// Result of one successful page load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageApplied {
    pub added: usize,
    /// Entries in the page that could not be decoded.
    pub skipped: usize,
    pub initial: bool,
    pub paginatable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactionOutcome {
    /// The store counted it; `count` is the counter after the increment.
    Confirmed { count: u64 },
    /// The store may or may not have counted it. The timeline shows the last
    /// confirmed state and nothing is retried.
    Unconfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelStatus {
    pub epoch: u64,
    pub seeded: bool,
    pub loading: bool,
    pub paginatable: bool,
    pub live: LiveTailState,
    pub len: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TimelineEvent {
    MessagesChanged { len: usize },
    ScrollToBottomRequested,
    PageLoaded(PageApplied),
    LoadFailed(SyncError),
    LiveTail(LiveTailState),
    /// The live tail gave up; carries [`SyncError::SubscriptionDropped`].
    LiveTailLost(SyncError),
    /// A live entry could not be decoded; carries [`SyncError::MalformedEntry`].
    EntrySkipped(SyncError),
    ReactionReverted { message_id: MessageId, emoji: String },
    Closed,
}

type ChangedListener = Box<dyn Fn(&Timeline) + Send + Sync>;
type ScrollListener = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Listeners {
    messages_changed: Vec<ChangedListener>,
    scroll_to_bottom: Vec<ScrollListener>,
}

type Reply<T> = oneshot::Sender<Result<T, SyncError>>;

pub(crate) enum WorkerMsg {
    LoadMore(Reply<PageApplied>),
    Ready(Reply<PageApplied>),
    React {
        message_id: MessageId,
        emoji: String,
        user_id: UserId,
        reply: Reply<ReactionOutcome>,
    },
    Snapshot(oneshot::Sender<Timeline>),
    Status(oneshot::Sender<ChannelStatus>),
    Close(oneshot::Sender<()>),
    PageFetched {
        epoch: u64,
        result: Result<FetchedPage, SyncError>,
    },
    Live {
        epoch: u64,
        signal: LiveSignal,
    },
    ReactionSettled {
        epoch: u64,
        undo: ReactionUndo,
        result: Result<u64, SyncError>,
        reply: Reply<ReactionOutcome>,
    },
}

pub(crate) struct FetchedPage {
    page: Page,
    /// Present for the initial page only.
    boundary: Option<Option<MessageId>>,
}

/// Presentation-side handle to an open channel. Cheap to clone; all clones
/// talk to the same worker.
#[derive(Clone)]
pub struct TimelineHandle {
    channel_id: ChannelId,
    epoch: u64,
    tx: mpsc::UnboundedSender<WorkerMsg>,
    listeners: Arc<Mutex<Listeners>>,
    events: broadcast::Sender<TimelineEvent>,
}

impl std::fmt::Debug for TimelineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineHandle")
            .field("channel_id", &self.channel_id)
            .field("epoch", &self.epoch)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl TimelineHandle {
    pub fn channel_id(&self) -> &ChannelId {
        &self.channel_id
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Load the page before the oldest loaded message. While one load is in
    /// flight further calls fail with [`SyncError::PaginationInFlight`].
    pub async fn load_more(&self) -> Result<PageApplied, SyncError> {
        self.call(WorkerMsg::LoadMore).await?
    }

    /// Wait for the initial page. Resolves with its result, or with the
    /// latest failure if it could not be loaded.
    pub async fn ready(&self) -> Result<PageApplied, SyncError> {
        self.call(WorkerMsg::Ready).await?
    }

    /// Count a reaction. The timeline shows it immediately and is corrected
    /// once the store answers.
    pub async fn react(&self, message_id: MessageId, emoji: &str, user_id: UserId) -> Result<ReactionOutcome, SyncError> {
        let emoji = emoji.to_string();
        self.call(|reply| WorkerMsg::React {
            message_id,
            emoji,
            user_id,
            reply,
        })
        .await?
    }

    pub async fn snapshot(&self) -> Result<Timeline, SyncError> {
        self.call(WorkerMsg::Snapshot).await
    }

    pub async fn status(&self) -> Result<ChannelStatus, SyncError> {
        self.call(WorkerMsg::Status).await
    }

    /// Called on the worker with the updated timeline after every change.
    /// Callbacks must not register further callbacks.
    pub fn on_messages_changed(&self, callback: impl Fn(&Timeline) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .messages_changed
            .push(Box::new(callback));
    }

    pub fn on_scroll_to_bottom_requested(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .scroll_to_bottom
            .push(Box::new(callback));
    }

    pub fn events(&self) -> broadcast::Receiver<TimelineEvent> {
        self.events.subscribe()
    }

    /// Tear the channel down: the live subscription is detached, in-flight
    /// results are discarded and the timeline is dropped. Idempotent.
    pub async fn close(&self) {
        let _ = self.call(WorkerMsg::Close).await;
    }

    /// Like [`close`](Self::close) without waiting for the worker.
    pub(crate) fn close_now(&self) {
        let (reply, _) = oneshot::channel();
        let _ = self.tx.send(WorkerMsg::Close(reply));
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> WorkerMsg) -> Result<T, SyncError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).map_err(|_| SyncError::ChannelClosed)?;
        rx.await.map_err(|_| SyncError::ChannelClosed)
    }
}

/// Spawn the worker for `channel` and start loading its initial page.
pub(crate) fn open<S: MessageStore>(
    channel: &Channel,
    epoch: u64,
    store: Arc<S>,
    session: SessionContext,
    config: &SyncConfig,
) -> TimelineHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    let listeners = Arc::new(Mutex::new(Listeners::default()));

    let mut worker = ChannelWorker {
        epoch,
        channel_id: channel.id.clone(),
        tracker: CursorTracker::new(channel.id.clone(), config.page_size, session.clone()),
        timeline: Timeline::new(channel.id.clone(), channel.is_group(), session.user_id(), config.utc_offset()),
        live: LiveTail::new(channel.id.clone()),
        reactions: ReactionAggregator::new(store.clone(), session.clone()),
        store,
        session,
        weak_tx: tx.downgrade(),
        listeners: listeners.clone(),
        events: events.clone(),
        fetch_waiters: None,
        initial_result: None,
        forwarder: None,
    };

    info!("Opening channel {} (epoch {})", channel.id, epoch);
    match worker.tracker.request() {
        Ok(Some(request)) => worker.start_fetch(request, vec![]),
        Ok(None) => {}
        Err(e) => worker.initial_result = Some(Err(e)),
    }
    tokio::spawn(worker.run(rx));

    TimelineHandle {
        channel_id: channel.id.clone(),
        epoch,
        tx,
        listeners,
        events,
    }
}

struct ChannelWorker<S> {
    epoch: u64,
    channel_id: ChannelId,
    store: Arc<S>,
    session: SessionContext,
    tracker: CursorTracker,
    timeline: Timeline,
    live: LiveTail,
    reactions: ReactionAggregator<S>,
    weak_tx: mpsc::WeakUnboundedSender<WorkerMsg>,
    listeners: Arc<Mutex<Listeners>>,
    events: broadcast::Sender<TimelineEvent>,
    /// `Some` while a page fetch is in flight, holding who to tell.
    fetch_waiters: Option<Vec<Reply<PageApplied>>>,
    initial_result: Option<Result<PageApplied, SyncError>>,
    forwarder: Option<JoinHandle<()>>,
}

impl<S: MessageStore> ChannelWorker<S> {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerMsg>) {
        while let Some(msg) = rx.recv().await {
            if let WorkerMsg::Close(reply) = msg {
                self.shutdown().await;
                let _ = reply.send(());
                return;
            }
            self.handle(msg);
        }
        // Every handle is gone.
        self.shutdown().await;
    }

    fn handle(&mut self, msg: WorkerMsg) {
        match msg {
            WorkerMsg::LoadMore(reply) => self.load_more(reply),
            WorkerMsg::Ready(reply) => self.ready(reply),
            WorkerMsg::React {
                message_id,
                emoji,
                user_id,
                reply,
            } => self.react(message_id, emoji, user_id, reply),
            WorkerMsg::Snapshot(reply) => {
                let _ = reply.send(self.timeline.clone());
            }
            WorkerMsg::Status(reply) => {
                let _ = reply.send(self.status());
            }
            WorkerMsg::Close(_) => {}
            WorkerMsg::PageFetched { epoch, result } if self.current(epoch) => self.page_fetched(result),
            WorkerMsg::Live { epoch, signal } if self.current(epoch) => self.live_signal(signal),
            WorkerMsg::ReactionSettled {
                epoch,
                undo,
                result,
                reply,
            } if self.current(epoch) => self.reaction_settled(undo, result, reply),
            WorkerMsg::PageFetched { epoch, .. }
            | WorkerMsg::Live { epoch, .. }
            | WorkerMsg::ReactionSettled { epoch, .. } => {
                debug!("Discarding result from epoch {} in {} (now {})", epoch, self.channel_id, self.epoch);
            }
        }
    }

    fn current(&self, epoch: u64) -> bool {
        epoch == self.epoch
    }

    fn status(&self) -> ChannelStatus {
        ChannelStatus {
            epoch: self.epoch,
            seeded: self.timeline.is_seeded(),
            loading: self.fetch_waiters.is_some(),
            paginatable: self.tracker.is_paginatable(),
            live: self.live.state(),
            len: self.timeline.len(),
        }
    }

    // -- Pagination --

    fn load_more(&mut self, reply: Reply<PageApplied>) {
        if self.fetch_waiters.is_some() {
            let _ = reply.send(Err(SyncError::PaginationInFlight));
            return;
        }
        match self.tracker.request() {
            Ok(Some(request)) => self.start_fetch(request, vec![reply]),
            Ok(None) => {
                let _ = reply.send(Ok(PageApplied {
                    added: 0,
                    skipped: 0,
                    initial: false,
                    paginatable: false,
                }));
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
        // A manual reload is also how a dropped live tail comes back.
        if self.live.state() == LiveTailState::Idle && self.timeline.is_seeded() {
            self.start_live();
        }
    }

    fn ready(&mut self, reply: Reply<PageApplied>) {
        if self.fetch_waiters.is_some() && !self.tracker.initial_loaded() {
            if let Some(waiters) = self.fetch_waiters.as_mut() {
                waiters.push(reply);
            }
            return;
        }
        let result = self.initial_result.clone().unwrap_or(Err(SyncError::ChannelClosed));
        let _ = reply.send(result);
    }

    fn start_fetch(&mut self, request: PageRequest, waiters: Vec<Reply<PageApplied>>) {
        self.fetch_waiters = Some(waiters);
        let store = self.store.clone();
        let tx = self.weak_tx.clone();
        let epoch = self.epoch;

        tokio::spawn(async move {
            let result = if request.is_initial() {
                cursor::fetch_initial(&*store, &request)
                    .await
                    .map(|(page, boundary)| FetchedPage {
                        page,
                        boundary: Some(boundary),
                    })
            } else {
                request.fetch(&*store).await.map(|page| FetchedPage { page, boundary: None })
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(WorkerMsg::PageFetched { epoch, result });
            }
        });
    }

    fn page_fetched(&mut self, result: Result<FetchedPage, SyncError>) {
        let waiters = self.fetch_waiters.take().unwrap_or_default();
        let result = result.and_then(|fetched| self.apply_page(fetched));

        match &result {
            Ok(applied) => {
                self.emit(TimelineEvent::PageLoaded(*applied));
                if applied.initial {
                    self.initial_result = Some(Ok(*applied));
                    self.start_live();
                }
            }
            Err(e) => {
                warn!("Loading {} failed: {}", self.channel_id, e);
                if !self.tracker.initial_loaded() {
                    self.initial_result = Some(Err(e.clone()));
                }
                self.emit(TimelineEvent::LoadFailed(e.clone()));
            }
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    /// Timeline first, then the cursor, so a rejected page changes nothing.
    fn apply_page(&mut self, fetched: FetchedPage) -> Result<PageApplied, SyncError> {
        let FetchedPage { mut page, boundary } = fetched;
        if !self.tracker.expects(&page) {
            return Err(SyncError::FetchFailed(StoreError::Malformed(
                "page does not continue from the current cursor".into(),
            )));
        }

        let messages = std::mem::take(&mut page.messages);
        let added = messages.len();
        let initial = page.requested_cursor.is_none();
        if initial {
            self.timeline.seed(messages)?;
        } else {
            self.timeline.prepend(messages)?;
        }
        if let Some(boundary) = boundary {
            self.tracker.set_boundary(boundary);
        }
        self.tracker.commit(&page);

        let applied = PageApplied {
            added,
            skipped: page.skipped,
            initial,
            paginatable: self.tracker.is_paginatable(),
        };
        debug!("Applied page to {}: {:?}", self.channel_id, applied);

        if initial || added > 0 {
            self.notify_messages_changed();
        }
        if initial {
            self.notify_scroll_to_bottom();
        }
        Ok(applied)
    }

    // -- Live tail --

    fn start_live(&mut self) {
        if let Err(e) = self.live.begin(self.timeline.is_seeded()) {
            debug!("Not subscribing {}: {}", self.channel_id, e);
            return;
        }
        let epoch = self.epoch;
        self.forwarder = Some(live_tail::spawn_forwarder(
            self.store.clone(),
            self.channel_id.clone(),
            self.timeline.newest_id().cloned(),
            self.weak_tx.clone(),
            move |signal| WorkerMsg::Live { epoch, signal },
        ));
        self.emit(TimelineEvent::LiveTail(LiveTailState::Subscribing));
    }

    fn live_signal(&mut self, signal: LiveSignal) {
        match signal {
            LiveSignal::Attached(id) => match self.live.activate(id) {
                Ok(()) => self.emit(TimelineEvent::LiveTail(LiveTailState::Active)),
                Err(e) => {
                    debug!("Late subscription {} for {}: {}", id, self.channel_id, e);
                    let store = self.store.clone();
                    tokio::spawn(async move { store.unsubscribe(id).await });
                }
            },
            LiveSignal::AttachFailed(e) => {
                warn!("Subscribing to {} failed: {}", self.channel_id, e);
                self.live_lost(e.to_string());
            }
            LiveSignal::Event(AppendEvent::Appended(entry)) => {
                if !self.live.accepts_deliveries() {
                    debug!("Dropping delivery of {} to {} while {}", entry.key, self.channel_id, self.live.state());
                    return;
                }
                match Message::from_entry(&self.channel_id, &entry) {
                    Ok(message) => self.append_live(message),
                    Err(e) => {
                        warn!("Skipping malformed live entry {} in {}: {}", entry.key, self.channel_id, e);
                        self.emit(TimelineEvent::EntrySkipped(e.into()));
                    }
                }
            }
            LiveSignal::Event(AppendEvent::Reconnecting { attempt }) => {
                debug!("Live tail of {} reconnecting (attempt {})", self.channel_id, attempt);
            }
            LiveSignal::Event(AppendEvent::Resubscribed) => {
                info!("Live tail of {} resubscribed", self.channel_id);
            }
            LiveSignal::Event(AppendEvent::Dropped { reason }) => {
                warn!("Live tail of {} dropped: {}", self.channel_id, reason);
                self.live_lost(reason);
            }
        }
    }

    fn live_lost(&mut self, reason: String) {
        if self.live.reset().is_ok() {
            self.forwarder = None;
            self.emit(TimelineEvent::LiveTail(LiveTailState::Idle));
            self.emit(TimelineEvent::LiveTailLost(SyncError::SubscriptionDropped(reason)));
        }
    }

    fn append_live(&mut self, message: Message) {
        match self.timeline.append_live(message) {
            AppendOutcome::Appended => {
                self.notify_messages_changed();
                self.notify_scroll_to_bottom();
            }
            AppendOutcome::Duplicate => {}
            AppendOutcome::OutOfOrder => {}
        }
    }

    // -- Reactions --

    fn react(&mut self, message_id: MessageId, emoji: String, user_id: UserId, reply: Reply<ReactionOutcome>) {
        let valid = self
            .session
            .require_user()
            .and_then(|_| reactions::validate_emoji(&emoji))
            .and_then(|_| reactions::validate_user(&user_id));
        if let Err(e) = valid {
            let _ = reply.send(Err(e));
            return;
        }
        let Some(undo) = self.timeline.apply_speculative_reaction(&message_id, &emoji, &user_id) else {
            let _ = reply.send(Err(SyncError::UnknownMessage(message_id)));
            return;
        };
        self.notify_messages_changed();

        let aggregator = self.reactions.clone();
        let channel_id = self.channel_id.clone();
        let tx = self.weak_tx.clone();
        let epoch = self.epoch;
        tokio::spawn(async move {
            let result = aggregator.add_reaction(&channel_id, &message_id, &emoji, &user_id).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(WorkerMsg::ReactionSettled {
                    epoch,
                    undo,
                    result,
                    reply,
                });
            }
        });
    }

    fn reaction_settled(&mut self, undo: ReactionUndo, result: Result<u64, SyncError>, reply: Reply<ReactionOutcome>) {
        let outcome = match result {
            Ok(count) => {
                self.timeline.confirm_reaction(&undo, count);
                Ok(ReactionOutcome::Confirmed { count })
            }
            Err(SyncError::ReactionFailed { committed: None, source }) => {
                debug!("Reaction on {} has unknown outcome ({}), showing last confirmed state", undo.message_id, source);
                self.timeline.revert_reaction(undo);
                Ok(ReactionOutcome::Unconfirmed)
            }
            Err(e) => {
                self.emit(TimelineEvent::ReactionReverted {
                    message_id: undo.message_id.clone(),
                    emoji: undo.emoji.clone(),
                });
                self.timeline.revert_reaction(undo);
                Err(e)
            }
        };
        self.notify_messages_changed();
        let _ = reply.send(outcome);
    }

    // -- Notifications --

    fn notify_messages_changed(&self) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for callback in &listeners.messages_changed {
            callback(&self.timeline);
        }
        drop(listeners);
        self.emit(TimelineEvent::MessagesChanged {
            len: self.timeline.len(),
        });
    }

    fn notify_scroll_to_bottom(&self) {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        for callback in &listeners.scroll_to_bottom {
            callback();
        }
        drop(listeners);
        self.emit(TimelineEvent::ScrollToBottomRequested);
    }

    fn emit(&self, event: TimelineEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    async fn shutdown(&mut self) {
        if self.live.state() == LiveTailState::Closed {
            return;
        }
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
        if let Some(id) = self.live.close() {
            self.store.unsubscribe(id).await;
        }
        for waiter in self.fetch_waiters.take().unwrap_or_default() {
            let _ = waiter.send(Err(SyncError::ChannelClosed));
        }
        info!("Closed channel {} (epoch {})", self.channel_id, self.epoch);
        self.emit(TimelineEvent::Closed);
    }
}
