use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message,
};

use super::error::{HolodexError, Result};
use super::socketio::{self, FeedEvent, Frame};

pub const REALTIME_URL: &str = "wss://holodex.net/api/socket.io/?EIO=4&transport=websocket";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const RECONNECT_JITTER_MS: u64 = 250;
const COMMAND_BUFFER: usize = 64;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle state of the current socket connection; reset to disconnected
/// with no session id on every close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub connected: bool,
    pub session_id: Option<String>,
}

#[derive(Debug)]
enum RealtimeCommand {
    Subscribe { video_id: String },
    Unsubscribe { video_id: String },
}

/// Handle to the realtime connection task. Subscribe/unsubscribe are
/// fire-and-forget and safe to call from any task; when the feed is not
/// connected they are logged no-ops (reconnect resubscription covers the
/// gap).
#[derive(Clone, Debug)]
pub struct RealtimeHandle {
    sender: mpsc::Sender<RealtimeCommand>,
    session_rx: watch::Receiver<SessionState>,
}

impl RealtimeHandle {
    /// Spawns the connection loop. The loop runs until the running flag
    /// flips to false, reconnecting with exponential backoff in between.
    pub fn spawn(
        url: String,
        chat_lang: String,
        subscriptions: Arc<Mutex<HashSet<String>>>,
        event_tx: mpsc::Sender<FeedEvent>,
        running_rx: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (sender, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (session_tx, session_rx) = watch::channel(SessionState::default());

        let task = tokio::spawn(run_realtime_loop(
            url,
            chat_lang,
            subscriptions,
            command_rx,
            event_tx,
            running_rx,
            session_tx,
        ));

        (Self { sender, session_rx }, task)
    }

    pub fn session(&self) -> SessionState {
        self.session_rx.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        self.session_rx.borrow().connected
    }

    pub async fn subscribe(&self, video_id: &str) {
        if !self.is_connected() {
            tracing::debug!(video.id = %video_id, "Feed not connected, skipping subscribe frame");
            return;
        }
        let command = RealtimeCommand::Subscribe {
            video_id: video_id.to_string(),
        };
        if self.sender.send(command).await.is_err() {
            tracing::warn!(video.id = %video_id, "Realtime task gone, dropping subscribe");
        }
    }

    pub async fn unsubscribe(&self, video_id: &str) {
        if !self.is_connected() {
            tracing::debug!(video.id = %video_id, "Feed not connected, skipping unsubscribe frame");
            return;
        }
        let command = RealtimeCommand::Unsubscribe {
            video_id: video_id.to_string(),
        };
        if self.sender.send(command).await.is_err() {
            tracing::warn!(video.id = %video_id, "Realtime task gone, dropping unsubscribe");
        }
    }
}

/// Builds the subscribe frames re-issued after every successful handshake.
/// The server keeps no memory of pre-disconnect subscriptions, so every
/// entry of the set is sent again, each exactly once.
fn resubscribe_frames(subscriptions: &HashSet<String>, chat_lang: &str) -> Vec<String> {
    subscriptions
        .iter()
        .map(|video_id| socketio::encode_subscribe(video_id, chat_lang))
        .collect()
}

/// Doubles the backoff delay up to the cap; a successful handshake resets
/// it back to the base.
fn next_backoff_delay(current: Duration) -> Duration {
    (current * 2).min(RECONNECT_MAX_DELAY)
}

async fn run_realtime_loop(
    url: String,
    chat_lang: String,
    subscriptions: Arc<Mutex<HashSet<String>>>,
    mut command_rx: mpsc::Receiver<RealtimeCommand>,
    event_tx: mpsc::Sender<FeedEvent>,
    mut running_rx: watch::Receiver<bool>,
    session_tx: watch::Sender<SessionState>,
) {
    // This task is the sole owner of the socket, so at most one connection
    // attempt can ever be in flight.
    let mut delay = RECONNECT_BASE_DELAY;

    while *running_rx.borrow() {
        session_tx.send_replace(SessionState::default());

        let connected = tokio::select! {
            result = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&url)) => result,
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    break;
                }
                continue;
            }
        };

        match connected {
            Ok(Ok((ws, _))) => {
                tracing::info!("Realtime connection established");
                let outcome = drive_connection(
                    ws,
                    &chat_lang,
                    &subscriptions,
                    &mut command_rx,
                    &event_tx,
                    &mut running_rx,
                    &session_tx,
                    &mut delay,
                )
                .await;
                session_tx.send_replace(SessionState::default());
                match outcome {
                    Ok(()) => tracing::info!("Realtime connection closed"),
                    Err(e) => tracing::warn!(error = %e, "Realtime connection failed"),
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Realtime connection attempt failed");
            }
            Err(_) => {
                tracing::warn!(timeout = ?CONNECT_TIMEOUT, "Realtime connection attempt timed out");
            }
        }

        if !*running_rx.borrow() {
            break;
        }
        delay = wait_backoff(delay, &mut running_rx).await;
    }

    session_tx.send_replace(SessionState::default());
    tracing::info!("Realtime connection loop stopped");
}

/// Sleeps out the current backoff (with a little jitter) and returns the
/// next delay. A running-flag flip cuts the sleep short.
async fn wait_backoff(delay: Duration, running_rx: &mut watch::Receiver<bool>) -> Duration {
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..RECONNECT_JITTER_MS));
    let wait = delay + jitter;
    tracing::debug!(delay = ?wait, "Waiting before reconnect attempt");
    tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        _ = running_rx.changed() => {}
    }
    next_backoff_delay(delay)
}

/// Runs one connection from handshake to close. Returns Ok on an orderly
/// remote close and Err on transport/protocol failures; either way the
/// caller re-enters the reconnect loop.
#[allow(clippy::too_many_arguments)]
async fn drive_connection(
    mut ws: WsStream,
    chat_lang: &str,
    subscriptions: &Arc<Mutex<HashSet<String>>>,
    command_rx: &mut mpsc::Receiver<RealtimeCommand>,
    event_tx: &mpsc::Sender<FeedEvent>,
    running_rx: &mut watch::Receiver<bool>,
    session_tx: &watch::Sender<SessionState>,
    delay: &mut Duration,
) -> Result<()> {
    let sid = await_handshake(&mut ws).await?;
    send_frame(&mut ws, socketio::FRAME_CONNECT.to_string()).await?;

    session_tx.send_replace(SessionState {
        connected: true,
        session_id: Some(sid.clone()),
    });
    *delay = RECONNECT_BASE_DELAY;
    tracing::info!(session.id = %sid, "Realtime handshake complete");

    // The server forgot any previous subscriptions; re-issue them silently.
    let frames = {
        let subscribed = subscriptions.lock().await;
        resubscribe_frames(&subscribed, chat_lang)
    };
    if !frames.is_empty() {
        tracing::info!(count = frames.len(), "Re-issuing active subscriptions");
        for frame in frames {
            send_frame(&mut ws, frame).await?;
        }
    }

    loop {
        tokio::select! {
            _ = running_rx.changed() => {
                if !*running_rx.borrow() {
                    tracing::info!("Shutdown requested, closing realtime socket");
                    let _ = ws.close(None).await;
                    return Ok(());
                }
            }
            Some(command) = command_rx.recv() => {
                let frame = match command {
                    RealtimeCommand::Subscribe { video_id } => {
                        tracing::info!(video.id = %video_id, "Subscribing to chat");
                        socketio::encode_subscribe(&video_id, chat_lang)
                    }
                    RealtimeCommand::Unsubscribe { video_id } => {
                        tracing::info!(video.id = %video_id, "Unsubscribing from chat");
                        socketio::encode_unsubscribe(&video_id, chat_lang)
                    }
                };
                send_frame(&mut ws, frame).await?;
            }
            message = ws.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        handle_text_frame(&text, &mut ws, event_tx, chat_lang).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        ws.send(Message::Pong(data))
                            .await
                            .map_err(|e| HolodexError::Socket(e.to_string()))?;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!(frame = ?frame, "Realtime connection closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        return Err(HolodexError::Socket(e.to_string()));
                    }
                    None => {
                        tracing::warn!("Realtime stream ended");
                        return Ok(());
                    }
                }
            }
        }
    }
}

async fn handle_text_frame(
    text: &str,
    ws: &mut WsStream,
    event_tx: &mpsc::Sender<FeedEvent>,
    chat_lang: &str,
) -> Result<()> {
    match Frame::parse(text)? {
        Frame::Ping => {
            send_frame(ws, socketio::FRAME_PONG.to_string()).await?;
        }
        Frame::Pong | Frame::ConnectAck => {}
        Frame::Disconnect => {
            return Err(HolodexError::Protocol(
                "server sent a socket.io disconnect".to_string(),
            ));
        }
        Frame::Handshake { sid } => {
            tracing::debug!(session.id = %sid, "Ignoring repeated handshake frame");
        }
        Frame::Event { name, payload } => {
            match socketio::classify_event(&name, payload, chat_lang) {
                FeedEvent::Ignored => {
                    tracing::debug!(event = %name, "Ignoring realtime event");
                }
                event => {
                    if event_tx.send(event).await.is_err() {
                        return Err(HolodexError::TaskComm(
                            "feed event consumer dropped".to_string(),
                        ));
                    }
                }
            }
        }
        Frame::Other(raw) => {
            tracing::debug!(frame = %raw, "Unhandled realtime frame");
        }
    }
    Ok(())
}

async fn send_frame(ws: &mut WsStream, frame: String) -> Result<()> {
    ws.send(Message::Text(frame))
        .await
        .map_err(|e| HolodexError::Socket(e.to_string()))
}

/// Waits for the server's initial handshake frame and extracts the session
/// id. The frame must arrive within a fixed timeout or the attempt aborts.
async fn await_handshake(ws: &mut WsStream) -> Result<String> {
    let message = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws.next())
        .await
        .map_err(|_| HolodexError::Handshake("timed out waiting for handshake frame".to_string()))?;

    match message {
        Some(Ok(Message::Text(text))) => match Frame::parse(&text)? {
            Frame::Handshake { sid } => Ok(sid),
            other => Err(HolodexError::Handshake(format!(
                "expected handshake frame, got {:?}",
                other
            ))),
        },
        Some(Ok(other)) => Err(HolodexError::Handshake(format!(
            "expected text handshake frame, got {:?}",
            other
        ))),
        Some(Err(e)) => Err(HolodexError::Socket(e.to_string())),
        None => Err(HolodexError::Handshake(
            "connection closed before handshake".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut delay = RECONNECT_BASE_DELAY;
        delay = next_backoff_delay(delay);
        assert_eq!(delay, Duration::from_secs(2));
        delay = next_backoff_delay(delay);
        assert_eq!(delay, Duration::from_secs(4));
        for _ in 0..10 {
            delay = next_backoff_delay(delay);
        }
        assert_eq!(delay, RECONNECT_MAX_DELAY);
    }

    #[test]
    fn test_resubscribe_emits_each_id_exactly_once() {
        let subscriptions: HashSet<String> = ["vid1", "vid2", "vid3"]
            .into_iter()
            .map(str::to_string)
            .collect();

        let frames = resubscribe_frames(&subscriptions, "en");
        assert_eq!(frames.len(), 3, "one frame per subscribed id");

        for video_id in &subscriptions {
            let matching = frames
                .iter()
                .filter(|frame| frame.contains(&format!("\"video_id\":\"{}\"", video_id)))
                .count();
            assert_eq!(matching, 1, "{} should appear exactly once", video_id);
        }
    }

    #[test]
    fn test_resubscribe_with_empty_set_is_empty() {
        assert!(resubscribe_frames(&HashSet::new(), "en").is_empty());
    }
}
