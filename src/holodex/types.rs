use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic id the live endpoint uses to mark members-only streams.
pub const MEMBERS_ONLY_TOPIC: &str = "membersonly";

/// Cached metadata snapshot for a single broadcaster channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub english_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub org: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suborg: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Live,
    Upcoming,
    Ended,
}

impl StreamStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "live" => Some(Self::Live),
            "upcoming" => Some(Self::Upcoming),
            "ended" | "past" => Some(Self::Ended),
            _ => None,
        }
    }
}

/// A stream as reported by one poll of the live-status endpoint. Identity is
/// `video_id`; each poll's snapshot supersedes the previous one wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamEvent {
    pub video_id: String,
    pub channel_id: String,
    pub title: String,
    pub channel_name: String,
    pub thumbnail: String,
    pub status: StreamStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub live_viewers: Option<u64>,
    pub members_only: bool,
}

/// A chat/translation message decoded from a realtime event frame. Never
/// stored, only routed.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub video_id: String,
    pub channel_id: String,
    pub author: String,
    pub timestamp: i64,
    pub video_offset: f64,
    pub text: String,
    pub is_translator: bool,
    pub is_moderator: bool,
    pub is_vtuber: bool,
    pub is_verified: bool,
    pub source: String,
}

// --- Wire DTOs ----------------------------------------------------------
// Provider JSON is decoded into these at the boundary; unknown fields are
// ignored, and records missing required fields are dropped at conversion.

#[derive(Debug, Clone, Deserialize)]
pub struct ApiChannel {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub english_name: Option<String>,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub suborg: Option<String>,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub inactive: bool,
}

impl ApiChannel {
    /// Converts to a [`ChannelRecord`], requiring both id and name.
    pub fn into_record(self) -> Option<ChannelRecord> {
        let id = self.id.filter(|s| !s.is_empty())?;
        let name = self.name.filter(|s| !s.is_empty())?;
        Some(ChannelRecord {
            id,
            name,
            english_name: self.english_name,
            handle: None,
            org: self.org,
            suborg: self.suborg,
            avatar_url: self.photo,
            kind: self.kind,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiVideoChannel {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiVideo {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub channel: ApiVideoChannel,
    pub status: String,
    #[serde(default)]
    pub start_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_actual: Option<DateTime<Utc>>,
    #[serde(default)]
    pub live_viewers: Option<u64>,
    #[serde(default)]
    pub topic_id: Option<String>,
}

impl StreamEvent {
    /// Builds a [`StreamEvent`] from a live-status entry. Entries with an
    /// unrecognized status are dropped.
    pub fn from_api(video: ApiVideo) -> Option<Self> {
        let status = StreamStatus::parse(&video.status)?;
        let thumbnail = format!("https://i.ytimg.com/vi/{}/mqdefault.jpg", video.id);
        Some(Self {
            thumbnail,
            video_id: video.id,
            channel_id: video.channel.id,
            title: video.title,
            channel_name: video.channel.name,
            status,
            start_time: video.start_scheduled.or(video.start_actual),
            live_viewers: video.live_viewers,
            members_only: video.topic_id.as_deref() == Some(MEMBERS_ONLY_TOPIC),
        })
    }
}

/// Payload of a per-stream chat event frame.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub video_offset: Option<f64>,
    #[serde(default)]
    pub is_tl: bool,
    #[serde(default)]
    pub is_moderator: bool,
    #[serde(default)]
    pub is_vtuber: bool,
    #[serde(default)]
    pub is_verified: bool,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl ChatPayload {
    /// End-of-chat marker: the remote side has closed the chat for this
    /// stream.
    pub fn is_end_marker(&self) -> bool {
        self.kind.as_deref() == Some("end")
    }
}

impl ChatMessage {
    pub fn from_payload(video_id: &str, channel_id: &str, payload: ChatPayload) -> Self {
        Self {
            video_id: video_id.to_string(),
            channel_id: channel_id.to_string(),
            author: payload.name.unwrap_or_else(|| "Unknown".to_string()),
            timestamp: payload.timestamp.unwrap_or(0),
            video_offset: payload.video_offset.unwrap_or(0.0),
            text: payload.message.unwrap_or_default(),
            is_translator: payload.is_tl,
            is_moderator: payload.is_moderator,
            is_vtuber: payload.is_vtuber,
            is_verified: payload.is_verified,
            source: payload.source.unwrap_or_default(),
        }
    }
}
