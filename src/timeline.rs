//! Interaction timeline and engagement stats.
//!
//! Normalizes messages, meetings and documents into one `Interaction`
//! sequence, newest first, and derives the profile summary numbers.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};

use crate::types::{
    CustomerProfile, Direction, Document, Importance, Interaction, InteractionDetails, Meeting,
    ProfileMessage, ProfileStats,
};

/// Interactions newer than this count toward the recency part of the score.
const RECENT_WINDOW_DAYS: i64 = 30;
const POINTS_PER_RECENT_INTERACTION: usize = 10;
const MAX_RECENCY_POINTS: usize = 70;
const PRESENCE_POINTS: usize = 30;
const MAX_ENGAGEMENT_SCORE: usize = 100;

/// Meetings with more attendees than this are flagged high importance.
const LARGE_MEETING_ATTENDEES: usize = 5;

/// Shown when no inbound→outbound reply pair can be correlated by thread.
pub const RESPONSE_TIME_PLACEHOLDER: &str = "n/a";

#[derive(Debug, Clone, PartialEq)]
pub struct Timeline {
    pub interactions: Vec<Interaction>,
    pub stats: ProfileStats,
}

pub fn build(
    messages: &[ProfileMessage],
    meetings: &[Meeting],
    documents: &[Document],
    now: DateTime<Utc>,
) -> Timeline {
    let mut interactions: Vec<Interaction> =
        Vec::with_capacity(messages.len() + meetings.len() + documents.len());
    interactions.extend(messages.iter().map(from_message));
    interactions.extend(meetings.iter().map(from_meeting));
    interactions.extend(documents.iter().map(from_document));

    // Stable: equal timestamps keep source order.
    interactions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let inbound_messages = messages
        .iter()
        .filter(|m| m.direction == Direction::Inbound)
        .count();

    let stats = ProfileStats {
        total_messages: messages.len(),
        total_meetings: meetings.len(),
        total_documents: documents.len(),
        total_calls: 0,
        total_interactions: interactions.len(),
        inbound_messages,
        outbound_messages: messages.len() - inbound_messages,
        unread_messages: messages.iter().filter(|m| !m.message.is_read).count(),
        last_interaction: interactions.first().map(|i| i.timestamp),
        engagement_score: engagement_score(&interactions, now),
        response_time: response_time(messages),
    };

    Timeline {
        interactions,
        stats,
    }
}

/// Re-derive a profile's timeline and stats from its record lists.
pub fn rebuild_profile(profile: &mut CustomerProfile, now: DateTime<Utc>) {
    let timeline = build(&profile.messages, &profile.meetings, &profile.documents, now);
    profile.interactions = timeline.interactions;
    profile.stats = timeline.stats;
}

/// `min(recent * 10, 70) + (any ? 30 : 0)`, capped at 100.
pub fn engagement_score(interactions: &[Interaction], now: DateTime<Utc>) -> u8 {
    let cutoff = now - Duration::days(RECENT_WINDOW_DAYS);
    let recent = interactions.iter().filter(|i| i.timestamp > cutoff).count();

    let recency = recent
        .saturating_mul(POINTS_PER_RECENT_INTERACTION)
        .min(MAX_RECENCY_POINTS);
    let presence = if interactions.is_empty() {
        0
    } else {
        PRESENCE_POINTS
    };

    (recency + presence).min(MAX_ENGAGEMENT_SCORE) as u8
}

/// Median delay between an inbound message and the next outbound message in
/// the same thread.
fn response_time(messages: &[ProfileMessage]) -> String {
    let mut threads: HashMap<&str, Vec<&ProfileMessage>> = HashMap::new();
    for m in messages {
        if let Some(thread) = m.message.thread_id.as_deref() {
            threads.entry(thread).or_default().push(m);
        }
    }

    let mut delays: Vec<i64> = Vec::new();
    for thread in threads.values_mut() {
        thread.sort_by_key(|m| m.message.received_at);
        let mut waiting_since: Option<DateTime<Utc>> = None;
        for m in thread.iter() {
            match m.direction {
                Direction::Inbound => {
                    waiting_since.get_or_insert(m.message.received_at);
                }
                Direction::Outbound => {
                    if let Some(asked) = waiting_since.take() {
                        delays.push((m.message.received_at - asked).num_seconds());
                    }
                }
            }
        }
    }

    if delays.is_empty() {
        return RESPONSE_TIME_PLACEHOLDER.to_string();
    }
    delays.sort_unstable();
    format_delay(delays[delays.len() / 2])
}

fn format_delay(secs: i64) -> String {
    if secs < 3_600 {
        format!("{}m", secs / 60)
    } else if secs < 2 * 86_400 {
        format!("{:.1}h", secs as f64 / 3_600.0)
    } else {
        format!("{}d", secs / 86_400)
    }
}

fn from_message(m: &ProfileMessage) -> Interaction {
    Interaction {
        id: m.message.id.clone(),
        title: m.message.subject.clone(),
        description: m.message.preview.clone(),
        timestamp: m.message.received_at,
        importance: m.message.importance,
        details: InteractionDetails::Message {
            direction: m.direction,
            has_attachments: m.message.has_attachments,
            is_read: m.message.is_read,
        },
    }
}

fn from_meeting(m: &Meeting) -> Interaction {
    let importance = if m.attendees.len() > LARGE_MEETING_ATTENDEES {
        Importance::High
    } else {
        Importance::Normal
    };

    Interaction {
        id: m.id.clone(),
        title: m.title.clone(),
        description: m.description.clone(),
        timestamp: m.start,
        importance,
        details: InteractionDetails::Meeting {
            attendee_count: m.attendees.len(),
            duration_minutes: m.end.map(|end| (end - m.start).num_minutes()),
        },
    }
}

fn from_document(d: &Document) -> Interaction {
    Interaction {
        id: d.id.clone(),
        title: d.title.clone(),
        description: d.description.clone(),
        timestamp: d.shared_at,
        importance: Importance::Normal,
        details: InteractionDetails::Document {
            url: d.url.clone(),
            mime_type: d.mime_type.clone(),
        },
    }
}
