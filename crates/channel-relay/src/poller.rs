//! The poll loop: fetch the latest message, relay its image, advance the cursor.
//!
//! A tick takes the current [`Cursor`] by value and hands back the next one,
//! so the loop in [`PollingScheduler::run`] holds the only in-memory copy and
//! the [`CursorStore`] is the only durable one.

use std::time::Duration;

use tokio::time::{self, MissedTickBehavior};

use crate::cursor::{Cursor, CursorStore};
use crate::error::{RelayError, Result};
use crate::feed::{FeedSource, MessageId};
use crate::filter;
use crate::template::{NameResolver, RenderContext};
use crate::transfer::{RemoteStore, TransferClient};

/// What a successful tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// The channel has no messages.
    Empty,
    /// The latest message is not newer than the cursor.
    Unchanged { latest: MessageId },
    /// A newer message without an image; the cursor moved past it.
    Skipped { id: MessageId },
    /// A newer message whose image was uploaded as `name`.
    Transferred { id: MessageId, name: String },
}

/// Everything one tick needs, wired together once at startup.
pub struct Relay<F, R, S> {
    feed: F,
    channel_id: String,
    resolver: NameResolver,
    transfer: TransferClient<R>,
    cursor_store: S,
}

impl<F, R, S> Relay<F, R, S>
where
    F: FeedSource,
    R: RemoteStore,
    S: CursorStore,
{
    pub fn new(
        feed: F,
        channel_id: impl Into<String>,
        resolver: NameResolver,
        transfer: TransferClient<R>,
        cursor_store: S,
    ) -> Self {
        Self {
            feed,
            channel_id: channel_id.into(),
            resolver,
            transfer,
            cursor_store,
        }
    }

    pub fn cursor_store(&self) -> &S {
        &self.cursor_store
    }

    /// Run one fetch/filter/transfer/advance pass.
    ///
    /// On error the cursor has not been written and the caller keeps the one
    /// it passed in, so the same message is tried again next tick.
    pub async fn tick(&mut self, cursor: Cursor) -> Result<(Cursor, TickOutcome)> {
        tracing::debug!("Check: starting (last_message_id={})", cursor);

        let Some(item) = self.feed.fetch_latest(&self.channel_id).await? else {
            tracing::info!("Check: no recent messages in channel {}", self.channel_id);
            return Ok((cursor, TickOutcome::Empty));
        };

        tracing::info!(
            message_id = %item.id,
            author = %item.author_id,
            created_at = %item.created_at.to_rfc3339(),
            attachments = item.attachments.len(),
            "Check: latest message"
        );

        if !filter::is_newer(&item, cursor) {
            tracing::debug!("Check: latest message is not newer than last_message_id");
            return Ok((cursor, TickOutcome::Unchanged { latest: item.id }));
        }

        let outcome = match filter::select_image(&item) {
            None => {
                tracing::info!("Check: message {} has no image attachments", item.id);
                TickOutcome::Skipped { id: item.id }
            }
            Some(attachment) => {
                let name = self.resolver.resolve(&RenderContext::new(&item, attachment))?;
                let bytes = self.feed.download(attachment).await?;
                tracing::info!(
                    "Check: relaying {} ({} bytes) as {}",
                    attachment.filename,
                    bytes.len(),
                    name
                );

                self.transfer.send(&name, &bytes).await?;
                TickOutcome::Transferred { id: item.id, name }
            }
        };

        self.cursor_store.save(item.id)?;
        tracing::info!("Check: state saved last_message_id={}", item.id);

        Ok((cursor.advance(item.id), outcome))
    }
}

/// Report a failed tick. Nothing here is fatal; the next tick is the retry.
fn log_tick_error(err: &RelayError) {
    let category = err.category();
    match err {
        RelayError::Fetch(e) => {
            tracing::warn!(category, "Check: fetch failed, retrying next interval: {}", e);
        }
        RelayError::Transfer(e) => {
            tracing::warn!(
                category,
                host = e.host(),
                "Check: transfer failed, message will be retried: {}",
                e
            );
        }
        RelayError::Template(e) => {
            tracing::error!(category, "Check: rename template is invalid: {}", e);
        }
        RelayError::State(e) => {
            tracing::error!(category, "Check: could not persist state: {}", e);
        }
    }
}

/// Drives [`Relay::tick`] on a fixed interval, one tick at a time.
pub struct PollingScheduler<F, R, S> {
    relay: Relay<F, R, S>,
    interval: Duration,
}

impl<F, R, S> PollingScheduler<F, R, S>
where
    F: FeedSource,
    R: RemoteStore,
    S: CursorStore,
{
    pub fn new(relay: Relay<F, R, S>, interval: Duration) -> Self {
        Self { relay, interval }
    }

    /// Tick forever. The first tick fires immediately.
    ///
    /// Ticks that would overlap a still-running one are skipped rather than
    /// queued, so a slow transfer never causes a burst afterwards.
    pub async fn run(mut self, mut cursor: Cursor) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::info!("Poller started (interval: {:?})", self.interval);

        loop {
            ticker.tick().await;

            match self.relay.tick(cursor).await {
                Ok((next, outcome)) => {
                    tracing::debug!("Check: done ({:?})", outcome);
                    cursor = next;
                }
                Err(e) => log_tick_error(&e),
            }
        }
    }

    /// Run a single tick and report its result.
    pub async fn run_once(mut self, cursor: Cursor) -> Result<(Cursor, TickOutcome)> {
        let result = self.relay.tick(cursor).await;
        if let Err(e) = &result {
            log_tick_error(e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FetchError, StateError};
    use crate::feed::{Attachment, Item};
    use crate::template::DEFAULT_TEMPLATE;
    use crate::transfer::testing::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Clone, Default)]
    struct FakeFeed {
        latest: Arc<Mutex<Option<Item>>>,
        fail_fetch: Arc<Mutex<bool>>,
        fetches: Arc<AtomicUsize>,
    }

    impl FakeFeed {
        fn post(&self, item: Item) {
            *self.latest.lock().unwrap() = Some(item);
        }

        fn set_fail_fetch(&self, fail: bool) {
            *self.fail_fetch.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl FeedSource for FakeFeed {
        async fn fetch_latest(&self, channel_id: &str) -> std::result::Result<Option<Item>, FetchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if *self.fail_fetch.lock().unwrap() {
                return Err(FetchError::Unauthorized {
                    channel_id: channel_id.to_string(),
                    status: 401,
                });
            }
            Ok(self.latest.lock().unwrap().clone())
        }

        async fn download(&self, attachment: &Attachment) -> std::result::Result<Vec<u8>, FetchError> {
            if attachment.url.contains("broken") {
                return Err(FetchError::Download {
                    filename: attachment.filename.clone(),
                    reason: "HTTP 404".to_string(),
                });
            }
            Ok(attachment.filename.as_bytes().to_vec())
        }
    }

    #[derive(Clone, Default)]
    struct MemoryCursorStore {
        saves: Arc<Mutex<Vec<MessageId>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl MemoryCursorStore {
        fn saves(&self) -> Vec<MessageId> {
            self.saves.lock().unwrap().clone()
        }
    }

    impl CursorStore for MemoryCursorStore {
        fn load(&self) -> std::result::Result<Cursor, StateError> {
            Ok(self
                .saves
                .lock()
                .unwrap()
                .last()
                .copied()
                .map(Cursor::at)
                .unwrap_or_default())
        }

        fn save(&mut self, id: MessageId) -> std::result::Result<(), StateError> {
            if *self.fail.lock().unwrap() {
                return Err(StateError::io("state.json", std::io::Error::other("disk full")));
            }
            self.saves.lock().unwrap().push(id);
            Ok(())
        }
    }

    fn message(id: u64, filenames: &[&str]) -> Item {
        Item {
            id: MessageId(id),
            created_at: Utc::now(),
            author_id: "555".to_string(),
            channel_id: "77".to_string(),
            attachments: filenames
                .iter()
                .map(|f| Attachment {
                    id: format!("{}-{}", id, f),
                    filename: f.to_string(),
                    content_type: None,
                    size: 0,
                    url: format!("https://cdn.example.com/{}", f),
                })
                .collect(),
        }
    }

    fn relay(
        feed: &FakeFeed,
        store: &MemoryStore,
        cursor_store: &MemoryCursorStore,
    ) -> Relay<FakeFeed, MemoryStore, MemoryCursorStore> {
        Relay::new(
            feed.clone(),
            "77",
            NameResolver::new("sched_{channel_id}_{message_id}").unwrap(),
            TransferClient::new(store.clone(), "/images", Duration::from_secs(5)),
            cursor_store.clone(),
        )
    }

    #[tokio::test]
    async fn test_unchanged_feed_is_idempotent() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        feed.post(message(42, &["cat.JPG"]));

        let (cursor, outcome) = assert_ok!(relay.tick(Cursor::empty()).await);
        assert_eq!(
            outcome,
            TickOutcome::Transferred {
                id: MessageId(42),
                name: "sched_77_42.JPG".to_string()
            }
        );
        assert_eq!(cursor, Cursor::at(MessageId(42)));

        let (cursor, outcome) = assert_ok!(relay.tick(cursor).await);
        assert_eq!(outcome, TickOutcome::Unchanged { latest: MessageId(42) });
        assert_eq!(cursor, Cursor::at(MessageId(42)));

        assert_eq!(store.uploads().len(), 1);
        assert_eq!(store.uploads()[0].0, "/images/sched_77_42.JPG");
        assert_eq!(cursors.saves(), vec![MessageId(42)]);
    }

    #[tokio::test]
    async fn test_non_image_advances_cursor_without_upload() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        feed.post(message(10, &["report.pdf"]));

        let (cursor, outcome) = relay.tick(Cursor::at(MessageId(5))).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped { id: MessageId(10) });
        assert_eq!(cursor, Cursor::at(MessageId(10)));
        assert!(store.uploads().is_empty());
        assert_eq!(cursors.saves(), vec![MessageId(10)]);
    }

    #[tokio::test]
    async fn test_message_without_attachments_is_skipped() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        feed.post(message(11, &[]));

        let (_, outcome) = relay.tick(Cursor::empty()).await.unwrap();
        assert_eq!(outcome, TickOutcome::Skipped { id: MessageId(11) });
        assert!(store.uploads().is_empty());
    }

    #[tokio::test]
    async fn test_transfer_failure_keeps_cursor_and_retries() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        feed.post(message(42, &["photo.png"]));
        store.set_fail_uploads(true);

        let start = Cursor::at(MessageId(41));
        let err = assert_err!(relay.tick(start).await);
        assert_eq!(err.category(), "transfer");
        assert!(cursors.saves().is_empty());

        // Next tick: same message, transfer works now.
        store.set_fail_uploads(false);
        let (cursor, outcome) = relay.tick(start).await.unwrap();
        assert!(matches!(outcome, TickOutcome::Transferred { id: MessageId(42), .. }));
        assert_eq!(cursor, Cursor::at(MessageId(42)));
        assert_eq!(store.uploads().len(), 1);
        assert_eq!(cursors.saves(), vec![MessageId(42)]);
    }

    #[tokio::test]
    async fn test_fetch_failure_changes_nothing() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        feed.post(message(42, &["photo.png"]));
        feed.set_fail_fetch(true);

        let err = relay.tick(Cursor::empty()).await.unwrap_err();
        assert!(matches!(err, RelayError::Fetch(FetchError::Unauthorized { .. })));
        assert!(store.uploads().is_empty());
        assert!(cursors.saves().is_empty());
    }

    #[tokio::test]
    async fn test_download_failure_is_a_fetch_error() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        let mut item = message(42, &["photo.png"]);
        item.attachments[0].url = "https://cdn.example.com/broken".to_string();
        feed.post(item);

        let err = relay.tick(Cursor::empty()).await.unwrap_err();
        assert_eq!(err.category(), "fetch");
        assert_eq!(store.recorded.lock().unwrap().connects, 0);
        assert!(cursors.saves().is_empty());
    }

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);
        let mut cursor = Cursor::empty();

        for (id, files) in [
            (5, vec!["report.pdf"]),
            (7, vec!["photo.png"]),
            (7, vec!["photo.png"]),
            // Newest message deleted; the feed now reports an older one.
            (6, vec!["older.png"]),
            (9, vec![]),
        ] {
            feed.post(message(id, &files));
            let previous = cursor;
            cursor = relay.tick(cursor).await.unwrap().0;
            assert!(cursor.last() >= previous.last());
        }

        assert_eq!(cursor, Cursor::at(MessageId(9)));
        assert_eq!(
            cursors.saves(),
            vec![MessageId(5), MessageId(7), MessageId(9)]
        );
        assert_eq!(store.uploads().len(), 1);
    }

    #[tokio::test]
    async fn test_crash_before_cursor_write_retransfers() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        feed.post(message(42, &["photo.png"]));
        *cursors.fail.lock().unwrap() = true;

        let mut first = relay(&feed, &store, &cursors);
        let err = first.tick(Cursor::empty()).await.unwrap_err();
        assert_eq!(err.category(), "state");
        assert_eq!(store.uploads().len(), 1);

        // "Restart": reload the cursor from the store and tick again.
        *cursors.fail.lock().unwrap() = false;
        let mut second = relay(&feed, &store, &cursors);
        let cursor = second.cursor_store().load().unwrap();
        assert_eq!(cursor, Cursor::empty());

        let (cursor, _) = second.tick(cursor).await.unwrap();
        assert_eq!(cursor, Cursor::at(MessageId(42)));
        // Accepted at-least-once window: the same image was written twice.
        assert_eq!(store.uploads().len(), 2);
        assert_eq!(store.uploads()[0].0, store.uploads()[1].0);
    }

    #[tokio::test]
    async fn test_empty_channel() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        let mut relay = relay(&feed, &store, &cursors);

        let (cursor, outcome) = relay.tick(Cursor::at(MessageId(3))).await.unwrap();
        assert_eq!(outcome, TickOutcome::Empty);
        assert_eq!(cursor, Cursor::at(MessageId(3)));
        assert!(cursors.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scheduler_ticks_on_interval_and_survives_errors() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        feed.post(message(42, &["photo.png"]));
        store.set_fail_connect(true);

        let scheduler = PollingScheduler::new(relay(&feed, &store, &cursors), Duration::from_secs(60));
        let fetches = feed.fetches.clone();

        tokio::select! {
            _ = scheduler.run(Cursor::empty()) => unreachable!("scheduler never returns"),
            _ = time::sleep(Duration::from_secs(150)) => {}
        }

        // Immediate tick plus t=60s and t=120s, all failing on connect.
        assert_eq!(fetches.load(Ordering::SeqCst), 3);
        assert!(cursors.saves().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transfer_skips_missed_ticks() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        feed.post(message(42, &["photo.png"]));
        store.set_upload_delay(Duration::from_secs(150));

        let relay = Relay::new(
            feed.clone(),
            "77",
            NameResolver::new(DEFAULT_TEMPLATE).unwrap(),
            TransferClient::new(store.clone(), "/images", Duration::from_secs(300)),
            cursors.clone(),
        );
        let scheduler = PollingScheduler::new(relay, Duration::from_secs(60));
        let handle = tokio::spawn(scheduler.run(Cursor::empty()));

        // The first tick is still uploading when the t=60s and t=120s firings
        // come due; they must not run back to back once it finishes.
        time::sleep(Duration::from_secs(170)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 1);
        assert_eq!(store.uploads().len(), 1);
        assert_eq!(cursors.saves(), vec![MessageId(42)]);

        // Next firing is the t=180s slot.
        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(feed.fetches.load(Ordering::SeqCst), 2);
        assert_eq!(store.uploads().len(), 1);

        handle.abort();
    }

    #[tokio::test]
    async fn test_run_once_returns_outcome() {
        let (feed, store, cursors): (FakeFeed, MemoryStore, MemoryCursorStore) =
            Default::default();
        feed.post(message(8, &["a.gif"]));

        let scheduler = PollingScheduler::new(relay(&feed, &store, &cursors), Duration::from_secs(60));
        let (cursor, outcome) = scheduler.run_once(Cursor::empty()).await.unwrap();
        assert_eq!(cursor, Cursor::at(MessageId(8)));
        assert!(matches!(outcome, TickOutcome::Transferred { .. }));
    }
}
