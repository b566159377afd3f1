//! Typed chat events built from raw IRC lines.

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use super::irc::IrcMessage;

const ACTION_PREFIX: &str = "\u{1}ACTION ";
const ACTION_SUFFIX: char = '\u{1}';

/// An emote annotated inline by the platform itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeEmote {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub room_id: String,
    pub channel: String,
    pub user_id: String,
    pub login: String,
    pub display_name: String,
    pub color: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    /// `(name, version)` pairs in tag order.
    pub badges: Vec<(String, String)>,
    pub badge_info: Vec<(String, String)>,
    /// Ordered by first appearance in the text, one per name.
    pub emotes: Vec<NativeEmote>,
}

impl ChatMessage {
    /// Build from a `PRIVMSG`. Messages without an id or room id are rejected.
    pub fn from_irc(msg: &IrcMessage) -> Option<Self> {
        if msg.command != "PRIVMSG" {
            return None;
        }

        let raw_text = msg.trailing()?;
        // `/me` text arrives wrapped in CTCP ACTION; only the inner text is kept.
        let text = raw_text
            .strip_prefix(ACTION_PREFIX)
            .map(|t| t.strip_suffix(ACTION_SUFFIX).unwrap_or(t))
            .unwrap_or(raw_text)
            .to_string();

        let login = msg.nick().unwrap_or_default().to_string();
        let display_name = msg
            .tag_value("display-name")
            .map(str::to_string)
            .unwrap_or_else(|| login.clone());

        Some(Self {
            id: msg.tag_value("id")?.to_string(),
            room_id: msg.tag_value("room-id")?.to_string(),
            channel: msg.channel().unwrap_or_default().to_string(),
            user_id: msg.tag("user-id").unwrap_or_default().to_string(),
            display_name,
            login,
            color: msg.tag("color").unwrap_or_default().to_string(),
            emotes: parse_emotes(msg.tag("emotes").unwrap_or_default(), &text),
            text,
            timestamp: parse_sent_ts(msg.tag("tmi-sent-ts")),
            badges: parse_badges(msg.tag("badges").unwrap_or_default()),
            badge_info: parse_badges(msg.tag("badge-info").unwrap_or_default()),
        })
    }

    pub fn badge(&self, name: &str) -> Option<&str> {
        find_badge(&self.badges, name)
    }

    pub fn badge_info(&self, name: &str) -> Option<&str> {
        find_badge(&self.badge_info, name)
    }
}

/// A moderation clear (ban, timeout or full chat clear).
///
/// Serialized form is hashed into the dedup key, so field order matters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearChat {
    pub room_id: String,
    pub channel: String,
    pub target_user_id: String,
    pub target_login: String,
    pub ban_duration: Option<u64>,
    pub sent_ts: String,
}

impl ClearChat {
    pub fn from_irc(msg: &IrcMessage) -> Option<Self> {
        if msg.command != "CLEARCHAT" {
            return None;
        }

        Some(Self {
            room_id: msg.tag("room-id").unwrap_or_default().to_string(),
            channel: msg.channel().unwrap_or_default().to_string(),
            target_user_id: msg.tag("target-user-id").unwrap_or_default().to_string(),
            target_login: msg.trailing().unwrap_or_default().to_string(),
            ban_duration: msg.tag_value("ban-duration").and_then(|d| d.parse().ok()),
            sent_ts: msg.tag("tmi-sent-ts").unwrap_or_default().to_string(),
        })
    }
}

fn find_badge<'a>(badges: &'a [(String, String)], name: &str) -> Option<&'a str> {
    badges
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn parse_badges(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter(|b| !b.is_empty())
        .map(|b| {
            let (name, version) = b.split_once('/').unwrap_or((b, ""));
            (name.to_string(), version.to_string())
        })
        .collect()
}

fn parse_sent_ts(raw: Option<&str>) -> DateTime<Utc> {
    raw.and_then(|ts| ts.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// `id:start-end,start-end/id:start-end` where positions index unicode scalars.
fn parse_emotes(raw: &str, text: &str) -> Vec<NativeEmote> {
    let chars: Vec<char> = text.chars().collect();
    let mut found: Vec<(usize, NativeEmote)> = Vec::new();

    for group in raw.split('/').filter(|g| !g.is_empty()) {
        let Some((id, ranges)) = group.split_once(':') else {
            continue;
        };
        for range in ranges.split(',') {
            let Some((start, end)) = range.split_once('-') else {
                continue;
            };
            let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
                continue;
            };
            if start > end || end >= chars.len() {
                continue;
            }
            let name: String = chars[start..=end].iter().collect();
            found.push((
                start,
                NativeEmote {
                    id: id.to_string(),
                    name,
                },
            ));
        }
    }

    found.sort_by_key(|(start, _)| *start);

    let mut emotes: Vec<NativeEmote> = Vec::new();
    for (_, emote) in found {
        if !emotes.iter().any(|e| e.name == emote.name) {
            emotes.push(emote);
        }
    }
    emotes
}
