use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::types::{StreamEvent, StreamStatus};

/// Upcoming streams scheduled further out than this are suppressed on the
/// very first poll after startup.
const SUPPRESSION_WINDOW_HOURS: i64 = 24;

/// What one poll cycle decided: transitions to report and subscription
/// changes to issue.
#[derive(Debug, Default)]
pub struct PollOutcome {
    pub transitions: Vec<StreamEvent>,
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

/// Holds the last-known stream snapshot and diffs each new poll against it.
/// Purely synchronous; the engine owns the locking around it.
#[derive(Debug, Default)]
pub struct StreamStateTracker {
    snapshot: Option<HashMap<String, StreamEvent>>,
}

impl StreamStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_snapshot(&self) -> bool {
        self.snapshot.is_some()
    }

    /// Channel id for a currently known stream, used to enrich chat
    /// messages.
    pub fn channel_for(&self, video_id: &str) -> Option<String> {
        self.snapshot
            .as_ref()?
            .get(video_id)
            .map(|event| event.channel_id.clone())
    }

    /// Replaces the retained snapshot with the new one and reports
    /// transitions plus subscription changes.
    ///
    /// A transition is any stream that is new or whose status changed. On
    /// the very first successful poll only, upcoming streams scheduled more
    /// than 24 hours out do not fire a transition (startup noise from
    /// long-scheduled frames). Subscription eligibility is evaluated for
    /// every entry of the snapshot, transition or not, so missed or dropped
    /// subscriptions heal on the next cycle.
    pub fn apply(
        &mut self,
        events: Vec<StreamEvent>,
        subscribed: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> PollOutcome {
        let first_poll = self.snapshot.is_none();
        let previous = self.snapshot.take().unwrap_or_default();

        let new_snapshot: HashMap<String, StreamEvent> = events
            .into_iter()
            .map(|event| (event.video_id.clone(), event))
            .collect();

        let mut outcome = PollOutcome::default();

        for (video_id, event) in &new_snapshot {
            let transitioned = previous
                .get(video_id)
                .map(|prev| prev.status != event.status)
                .unwrap_or(true);

            if transitioned {
                if first_poll && is_distant_upcoming(event, now) {
                    tracing::debug!(
                        video.id = %video_id,
                        channel = %event.channel_name,
                        "Suppressing far-future upcoming stream on initial poll"
                    );
                } else {
                    tracing::info!(
                        video.id = %video_id,
                        channel = %event.channel_name,
                        status = ?event.status,
                        "Stream transition detected"
                    );
                    outcome.transitions.push(event.clone());
                }
            }

            let eligible = matches!(event.status, StreamStatus::Live | StreamStatus::Upcoming)
                && !event.members_only;
            if eligible && !subscribed.contains(video_id) {
                outcome.subscribe.push(video_id.clone());
            }
            if event.members_only && subscribed.contains(video_id) {
                outcome.unsubscribe.push(video_id.clone());
            }
        }

        // Streams gone from the snapshot have ended or left the tracked set.
        for video_id in previous.keys() {
            if !new_snapshot.contains_key(video_id) && subscribed.contains(video_id) {
                tracing::info!(video.id = %video_id, "Stream ended or no longer tracked");
                outcome.unsubscribe.push(video_id.clone());
            }
        }

        self.snapshot = Some(new_snapshot);
        outcome
    }

    /// Drops every stream belonging to one of the removed channels from the
    /// snapshot, returning the video ids that need an unsubscribe. Runs
    /// immediately when the tracked set shrinks, without waiting for the
    /// next poll.
    pub fn purge_channels(
        &mut self,
        removed_channels: &HashSet<String>,
        subscribed: &HashSet<String>,
    ) -> Vec<String> {
        let Some(snapshot) = self.snapshot.as_mut() else {
            return Vec::new();
        };

        let mut unsubscribe = Vec::new();
        snapshot.retain(|video_id, event| {
            if removed_channels.contains(&event.channel_id) {
                tracing::info!(
                    video.id = %video_id,
                    channel = %event.channel_name,
                    "Purging stream from untracked channel"
                );
                if subscribed.contains(video_id) {
                    unsubscribe.push(video_id.clone());
                }
                false
            } else {
                true
            }
        });
        unsubscribe
    }
}

fn is_distant_upcoming(event: &StreamEvent, now: DateTime<Utc>) -> bool {
    if event.status != StreamStatus::Upcoming {
        return false;
    }
    match event.start_time {
        Some(start) => start > now + ChronoDuration::hours(SUPPRESSION_WINDOW_HOURS),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(video_id: &str, channel_id: &str, status: StreamStatus) -> StreamEvent {
        StreamEvent {
            video_id: video_id.to_string(),
            channel_id: channel_id.to_string(),
            title: format!("Stream {}", video_id),
            channel_name: format!("Channel {}", channel_id),
            thumbnail: String::new(),
            status,
            start_time: None,
            live_viewers: None,
            members_only: false,
        }
    }

    fn now() -> DateTime<Utc> {
        "2024-05-01T12:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_new_stream_fires_exactly_one_transition() {
        let mut tracker = StreamStateTracker::new();
        let mut subscribed = HashSet::new();

        // Prime the snapshot with A live.
        let outcome = tracker.apply(
            vec![stream("A", "C1", StreamStatus::Live)],
            &subscribed,
            now(),
        );
        assert_eq!(outcome.transitions.len(), 1);
        subscribed.extend(outcome.subscribe);

        // A unchanged, B appears: exactly one transition, for B.
        let outcome = tracker.apply(
            vec![
                stream("A", "C1", StreamStatus::Live),
                stream("B", "C2", StreamStatus::Upcoming),
            ],
            &subscribed,
            now(),
        );
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].video_id, "B");
        assert_eq!(outcome.subscribe, vec!["B".to_string()]);
    }

    #[test]
    fn test_vanished_stream_is_unsubscribed() {
        let mut tracker = StreamStateTracker::new();
        let mut subscribed = HashSet::new();

        let outcome = tracker.apply(
            vec![stream("A", "C1", StreamStatus::Live)],
            &subscribed,
            now(),
        );
        subscribed.extend(outcome.subscribe);
        assert!(subscribed.contains("A"));

        let outcome = tracker.apply(vec![], &subscribed, now());
        assert!(outcome.transitions.is_empty());
        assert_eq!(outcome.unsubscribe, vec!["A".to_string()]);
    }

    #[test]
    fn test_status_change_fires_transition_without_resubscribe() {
        let mut tracker = StreamStateTracker::new();
        let mut subscribed = HashSet::new();

        let outcome = tracker.apply(
            vec![stream("A", "C1", StreamStatus::Upcoming)],
            &subscribed,
            now(),
        );
        subscribed.extend(outcome.subscribe);

        let outcome = tracker.apply(
            vec![stream("A", "C1", StreamStatus::Live)],
            &subscribed,
            now(),
        );
        assert_eq!(outcome.transitions.len(), 1);
        assert_eq!(outcome.transitions[0].status, StreamStatus::Live);
        assert!(outcome.subscribe.is_empty(), "already subscribed");
        assert!(outcome.unsubscribe.is_empty());
    }

    #[test]
    fn test_members_only_flip_unsubscribes_without_new_subscribe() {
        let mut tracker = StreamStateTracker::new();
        let mut subscribed = HashSet::new();

        let outcome = tracker.apply(
            vec![stream("A", "C1", StreamStatus::Live)],
            &subscribed,
            now(),
        );
        subscribed.extend(outcome.subscribe);

        let mut flipped = stream("A", "C1", StreamStatus::Live);
        flipped.members_only = true;
        let outcome = tracker.apply(vec![flipped], &subscribed, now());

        assert!(
            outcome.transitions.is_empty(),
            "status itself did not change"
        );
        assert_eq!(outcome.unsubscribe, vec!["A".to_string()]);
        assert!(outcome.subscribe.is_empty());
    }

    // The suppression only guards the very first poll of the process; the
    // same far-future stream re-detected on a later poll does fire.
    #[test]
    fn test_distant_upcoming_suppressed_only_on_initial_poll() {
        let mut tracker = StreamStateTracker::new();
        let subscribed = HashSet::new();

        let mut distant = stream("A", "C1", StreamStatus::Upcoming);
        distant.start_time = Some(now() + ChronoDuration::hours(48));

        let outcome = tracker.apply(vec![distant.clone()], &subscribed, now());
        assert!(
            outcome.transitions.is_empty(),
            "first-poll far-future upcoming is startup noise"
        );
        assert_eq!(
            outcome.subscribe,
            vec!["A".to_string()],
            "suppression hides the event, not the subscription"
        );

        // Stream drops out, then reappears on a later poll: not suppressed.
        tracker.apply(vec![], &subscribed, now());
        let outcome = tracker.apply(vec![distant], &subscribed, now());
        assert_eq!(outcome.transitions.len(), 1);
    }

    #[test]
    fn test_near_upcoming_not_suppressed_on_initial_poll() {
        let mut tracker = StreamStateTracker::new();
        let subscribed = HashSet::new();

        let mut soon = stream("A", "C1", StreamStatus::Upcoming);
        soon.start_time = Some(now() + ChronoDuration::hours(2));

        let outcome = tracker.apply(vec![soon], &subscribed, now());
        assert_eq!(outcome.transitions.len(), 1);
    }

    #[test]
    fn test_purge_channels_removes_streams_and_reports_unsubscribes() {
        let mut tracker = StreamStateTracker::new();
        let mut subscribed = HashSet::new();

        let outcome = tracker.apply(
            vec![
                stream("V1", "C1", StreamStatus::Live),
                stream("V2", "C2", StreamStatus::Live),
            ],
            &subscribed,
            now(),
        );
        subscribed.extend(outcome.subscribe);

        let removed: HashSet<String> = ["C1".to_string()].into();
        let unsubscribe = tracker.purge_channels(&removed, &subscribed);

        assert_eq!(unsubscribe, vec!["V1".to_string()]);
        assert!(tracker.channel_for("V1").is_none());
        assert_eq!(tracker.channel_for("V2").as_deref(), Some("C2"));
    }

    #[test]
    fn test_members_only_stream_never_subscribed() {
        let mut tracker = StreamStateTracker::new();
        let subscribed = HashSet::new();

        let mut members = stream("A", "C1", StreamStatus::Live);
        members.members_only = true;
        let outcome = tracker.apply(vec![members], &subscribed, now());

        assert_eq!(outcome.transitions.len(), 1, "transition still reported");
        assert!(outcome.subscribe.is_empty());
        assert!(outcome.unsubscribe.is_empty(), "was not subscribed");
    }
}
