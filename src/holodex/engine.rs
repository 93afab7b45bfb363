use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::{HolodexConfig, PollingConfig};

use super::api::HolodexApi;
use super::directory::ChannelDirectory;
use super::error::{HolodexError, Result};
use super::realtime::{REALTIME_URL, RealtimeHandle};
use super::socketio::FeedEvent;
use super::tracker::StreamStateTracker;
use super::types::{ChannelRecord, ChatMessage, StreamEvent};

const FEED_EVENT_BUFFER: usize = 512;
const CHANNEL_PAGE_SIZE: usize = 100;

/// Consumer-facing delivery channels. Stream transitions go to `stream_tx`;
/// chat is split between broadcaster-authored messages (`vtuber_tx`) and
/// everything else (`chat_tx`). Send failures are logged where they happen
/// and never stall the loops.
#[derive(Clone)]
pub struct EventSinks {
    pub stream_tx: mpsc::Sender<StreamEvent>,
    pub chat_tx: mpsc::Sender<ChatMessage>,
    pub vtuber_tx: mpsc::Sender<ChatMessage>,
}

struct EngineShared {
    api: HolodexApi,
    directory: Mutex<ChannelDirectory>,
    tracker: Mutex<StreamStateTracker>,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    tracked: Mutex<HashSet<String>>,
    polling: PollingConfig,
}

/// Orchestrates the polling loop and the realtime connection over shared
/// state. One instance per process; everything it touches is bound at
/// construction.
pub struct HolodexEngine {
    shared: Arc<EngineShared>,
    chat_lang: String,
    running_tx: watch::Sender<bool>,
    running_rx: watch::Receiver<bool>,
    realtime: Option<RealtimeHandle>,
    sinks: Option<EventSinks>,
    tasks: Vec<JoinHandle<()>>,
}

impl HolodexEngine {
    pub fn new(config: HolodexConfig, polling: PollingConfig) -> Result<Self> {
        let api = HolodexApi::new(&config.api_key)?;
        let directory = ChannelDirectory::new(&config.cache_dir);
        let (running_tx, running_rx) = watch::channel(false);

        Ok(Self {
            shared: Arc::new(EngineShared {
                api,
                directory: Mutex::new(directory),
                tracker: Mutex::new(StreamStateTracker::new()),
                subscriptions: Arc::new(Mutex::new(HashSet::new())),
                tracked: Mutex::new(HashSet::new()),
                polling,
            }),
            chat_lang: config.chat_lang,
            running_tx,
            running_rx,
            realtime: None,
            sinks: None,
            tasks: Vec::new(),
        })
    }

    /// Bootstraps the channel directory and starts the polling loop and the
    /// realtime connection loop. Both run until `stop`.
    pub async fn start(&mut self, tracked: HashSet<String>, sinks: EventSinks) -> Result<()> {
        if self.realtime.is_some() {
            return Err(HolodexError::TaskComm("engine already started".to_string()));
        }

        tracing::info!(channels = tracked.len(), "Starting engine");
        self.running_tx.send_replace(true);
        *self.shared.tracked.lock().await = tracked;

        bootstrap_directory(&self.shared).await;

        let (event_tx, event_rx) = mpsc::channel(FEED_EVENT_BUFFER);
        let (realtime, realtime_task) = RealtimeHandle::spawn(
            REALTIME_URL.to_string(),
            self.chat_lang.clone(),
            Arc::clone(&self.shared.subscriptions),
            event_tx,
            self.running_rx.clone(),
        );

        let router_task = tokio::spawn(run_feed_router(
            Arc::clone(&self.shared),
            sinks.clone(),
            event_rx,
            self.running_rx.clone(),
        ));
        let poll_task = tokio::spawn(run_poll_loop(
            Arc::clone(&self.shared),
            realtime.clone(),
            sinks.stream_tx.clone(),
            self.running_rx.clone(),
        ));

        self.realtime = Some(realtime);
        self.sinks = Some(sinks);
        self.tasks = vec![realtime_task, router_task, poll_task];
        Ok(())
    }

    /// Replaces the tracked-channel set mid-run. Removed channels are
    /// purged from the snapshot at once, with unsubscribes issued; added
    /// channels trigger an immediate out-of-cycle poll so they don't wait a
    /// full interval.
    pub async fn update_tracked_channels(&self, new_set: HashSet<String>) {
        let (added, removed) = {
            let mut tracked = self.shared.tracked.lock().await;
            let added: Vec<String> = new_set.difference(&tracked).cloned().collect();
            let removed: HashSet<String> = tracked.difference(&new_set).cloned().collect();
            *tracked = new_set;
            (added, removed)
        };

        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "Stopped tracking channels");
            let to_unsubscribe = {
                let subscribed = self.shared.subscriptions.lock().await.clone();
                self.shared
                    .tracker
                    .lock()
                    .await
                    .purge_channels(&removed, &subscribed)
            };
            if !to_unsubscribe.is_empty() {
                let mut subscribed = self.shared.subscriptions.lock().await;
                for video_id in &to_unsubscribe {
                    subscribed.remove(video_id);
                }
            }
            if let Some(realtime) = &self.realtime {
                for video_id in &to_unsubscribe {
                    realtime.unsubscribe(video_id).await;
                }
            }
        }

        if !added.is_empty() {
            tracing::info!(count = added.len(), "Tracking additional channels");
            if let (Some(realtime), Some(sinks)) = (&self.realtime, &self.sinks) {
                run_poll_cycle(&self.shared, realtime, &sinks.stream_tx).await;
            }
        }

        let total = self.shared.tracked.lock().await.len();
        tracing::info!(total, "Tracked channel set updated");
    }

    /// Resolves a channel by display name, or by `@handle` via the lazily
    /// populated handle index with an API fallback.
    pub async fn channel_lookup(&self, name: &str) -> Option<ChannelRecord> {
        let resolved_name = if name.starts_with('@') {
            let cached = self.shared.directory.lock().await.by_handle(name).cloned();
            let record = match cached {
                Some(record) => record,
                None => {
                    let record = self.shared.api.fetch_by_handle(name).await?;
                    self.shared
                        .directory
                        .lock()
                        .await
                        .insert_handle(name, record.clone());
                    record
                }
            };
            record.name
        } else {
            name.to_string()
        };

        self.shared
            .directory
            .lock()
            .await
            .by_name(&resolved_name)
            .cloned()
    }

    /// Resolves a channel by id from the cached directory, falling back to
    /// a single-channel API lookup for channels outside the bulk listing.
    pub async fn channel_info(&self, channel_id: &str) -> Option<ChannelRecord> {
        let cached = self.shared.directory.lock().await.by_id(channel_id).cloned();
        match cached {
            Some(record) => Some(record),
            None => self.shared.api.fetch_channel(channel_id).await,
        }
    }

    /// Substring search over the cached channel directory.
    pub async fn search_channels(&self, query: &str) -> Vec<ChannelRecord> {
        self.shared.directory.lock().await.search(query)
    }

    /// Graceful shutdown: flips the running flag, which makes both loops
    /// exit at their next check point and closes the socket, then awaits
    /// the tasks.
    pub async fn stop(&mut self) {
        tracing::info!("Stopping engine");
        self.running_tx.send_replace(false);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Engine task ended abnormally");
            }
        }
        self.realtime = None;
        self.sinks = None;
        tracing::info!("Engine stopped");
    }
}

/// Loads the cached directory or refreshes it from the API when missing or
/// stale. A failed refresh falls back to stale records rather than leaving
/// the directory empty.
async fn bootstrap_directory(shared: &Arc<EngineShared>) {
    let stale = {
        let mut directory = shared.directory.lock().await;
        let loaded = directory.load();
        if loaded && directory.is_valid() {
            tracing::info!(channels = directory.len(), "Using existing channel cache");
            return;
        }
        if loaded {
            tracing::info!(
                channels = directory.len(),
                "Channel cache is stale, refreshing"
            );
            directory.channels().to_vec()
        } else {
            Vec::new()
        }
    };

    let fetched = shared.api.fetch_all_channels(CHANNEL_PAGE_SIZE).await;

    let mut directory = shared.directory.lock().await;
    if !fetched.is_empty() {
        directory.replace(fetched);
    } else if !stale.is_empty() {
        tracing::warn!("Channel fetch returned nothing, keeping stale cache");
        directory.replace(stale);
    } else {
        tracing::error!("Channel fetch failed and no cache exists");
    }
}

/// Next wall-clock instant that is `offset` seconds past a multiple of
/// `interval` seconds since UTC midnight, strictly after `now`. Keeps poll
/// timing stable across restarts instead of drifting with loop start time.
fn next_poll_instant(now: DateTime<Utc>, interval: Duration, offset: Duration) -> DateTime<Utc> {
    let interval = interval.as_secs().max(1) as i64;
    let offset = offset.as_secs() as i64 % interval;
    let midnight = now.date_naive().and_time(NaiveTime::MIN).and_utc();
    let elapsed = (now - midnight).num_seconds();

    let next_secs = if elapsed < offset {
        offset
    } else {
        ((elapsed - offset) / interval + 1) * interval + offset
    };
    midnight + ChronoDuration::seconds(next_secs)
}

async fn run_poll_loop(
    shared: Arc<EngineShared>,
    realtime: RealtimeHandle,
    stream_tx: mpsc::Sender<StreamEvent>,
    mut running_rx: watch::Receiver<bool>,
) {
    let interval = Duration::from_secs(shared.polling.interval_secs);
    let offset = Duration::from_secs(shared.polling.offset_secs);
    tracing::info!(?interval, ?offset, "Polling loop started");

    while *running_rx.borrow() {
        let now = Utc::now();
        let next = next_poll_instant(now, interval, offset);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!(next = %next, "Sleeping until next poll tick");

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        run_poll_cycle(&shared, &realtime, &stream_tx).await;
    }

    tracing::info!("Polling loop stopped");
}

/// One poll cycle: fetch live status, diff against the previous snapshot,
/// deliver transitions, and reconcile subscriptions. A failed fetch skips
/// the diff entirely so the previous snapshot stays authoritative.
async fn run_poll_cycle(
    shared: &Arc<EngineShared>,
    realtime: &RealtimeHandle,
    stream_tx: &mpsc::Sender<StreamEvent>,
) {
    let tracked = shared.tracked.lock().await.clone();
    if tracked.is_empty() {
        tracing::debug!("No tracked channels, skipping poll cycle");
        return;
    }

    let Some(events) = shared.api.fetch_live(&tracked).await else {
        tracing::warn!("Live status unavailable, keeping previous snapshot this cycle");
        return;
    };

    let outcome = {
        let subscribed = shared.subscriptions.lock().await.clone();
        shared
            .tracker
            .lock()
            .await
            .apply(events, &subscribed, Utc::now())
    };

    for event in outcome.transitions {
        if stream_tx.send(event).await.is_err() {
            tracing::warn!("Stream event consumer dropped, transition discarded");
        }
    }

    {
        let mut subscribed = shared.subscriptions.lock().await;
        for video_id in &outcome.subscribe {
            subscribed.insert(video_id.clone());
        }
        for video_id in &outcome.unsubscribe {
            subscribed.remove(video_id);
        }
    }

    for video_id in &outcome.subscribe {
        realtime.subscribe(video_id).await;
    }
    for video_id in &outcome.unsubscribe {
        realtime.unsubscribe(video_id).await;
    }
}

async fn run_feed_router(
    shared: Arc<EngineShared>,
    sinks: EventSinks,
    mut event_rx: mpsc::Receiver<FeedEvent>,
    mut running_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    break;
                }
            }
            event = event_rx.recv() => {
                match event {
                    Some(event) => route_feed_event(&shared, &sinks, event).await,
                    None => break,
                }
            }
        }
    }
    tracing::info!("Feed router stopped");
}

async fn route_feed_event(shared: &Arc<EngineShared>, sinks: &EventSinks, event: FeedEvent) {
    match event {
        FeedEvent::SubscribeSuccess { video_id } => {
            tracing::info!(video.id = ?video_id, "Chat subscription confirmed");
        }
        FeedEvent::SubscribeError { video_id, message } => {
            tracing::error!(video.id = ?video_id, message = ?message, "Chat subscription rejected");
            if let Some(video_id) = video_id {
                shared.subscriptions.lock().await.remove(&video_id);
            }
        }
        FeedEvent::ChatEnded { video_id } => {
            // The remote side already closed this chat; only local
            // bookkeeping, no unsubscribe frame.
            tracing::info!(video.id = %video_id, "Chat ended");
            shared.subscriptions.lock().await.remove(&video_id);
        }
        FeedEvent::Chat { video_id, payload } => {
            let channel_id = shared
                .tracker
                .lock()
                .await
                .channel_for(&video_id)
                .unwrap_or_default();
            let message = ChatMessage::from_payload(&video_id, &channel_id, payload);
            if message.text.trim().is_empty() {
                return;
            }

            let delivered = if message.is_vtuber {
                sinks.vtuber_tx.send(message).await
            } else {
                sinks.chat_tx.send(message).await
            };
            if delivered.is_err() {
                tracing::warn!(video.id = %video_id, "Chat consumer dropped, message discarded");
            }
        }
        FeedEvent::Ignored => {}
    }
}
