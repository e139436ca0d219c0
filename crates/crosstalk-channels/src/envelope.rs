//! Envelope identity and text-level markers.
//!
//! Three concerns live here: the deterministic coalesce key the debouncer
//! buckets on, the prompt-header markers injected ahead of agent prompts
//! (and their removal before text is handed back to consumers), and
//! [`combine_entries`] which folds a coalesced bucket into one envelope.

use chrono::SecondsFormat;

use crate::types::{Attachment, Envelope};

/// Canonical coalesce key for the debouncer. Rules, in order of preference:
///
/// 1. Balloon carriers group with the message they decorate.
/// 2. A stable provider message id groups edits/fragments of one message.
/// 3. Fall back to the conversation: channel + account + scope key + sender.
pub fn coalesce_key(envelope: &Envelope) -> String {
    let account = envelope.sender.account_id.as_deref().unwrap_or("default");

    if envelope.balloon_bundle_id.is_some() {
        if let Some(assoc) = &envelope.associated_message_id {
            return format!("{}:{}:balloon:{}", envelope.channel, account, assoc);
        }
    }

    if let Some(message_id) = &envelope.message_id {
        return format!("{}:{}:msg:{}", envelope.channel, account, message_id);
    }

    format!(
        "{}:{}:{}:{}",
        envelope.channel,
        account,
        scope_key(envelope),
        envelope.sender.id
    )
}

/// First non-empty of `chat_guid | chat_identifier | chat_id | "dm"`.
pub fn scope_key(envelope: &Envelope) -> &str {
    for candidate in [
        envelope.chat_guid.as_deref(),
        envelope.chat_identifier.as_deref(),
        envelope.chat_id.as_deref(),
    ]
    .into_iter()
    .flatten()
    {
        if !candidate.is_empty() {
            return candidate;
        }
    }
    "dm"
}

/// Prompt header injected ahead of the message text:
/// `[<Channel> <ChatLabel> id:<chatId> +<age>? <iso8601>]`
pub fn format_header(envelope: &Envelope, chat_label: &str, age: Option<&str>) -> String {
    let mut channel_tag = envelope.channel.clone();
    if let Some(first) = channel_tag.get_mut(..1) {
        first.make_ascii_uppercase();
    }
    let ts = envelope
        .received_at
        .to_rfc3339_opts(SecondsFormat::Secs, true);
    match age {
        Some(age) => format!(
            "[{} {} id:{} +{} {}]",
            channel_tag,
            chat_label,
            scope_key(envelope),
            age,
            ts
        ),
        None => format!(
            "[{} {} id:{} {}]",
            channel_tag,
            chat_label,
            scope_key(envelope),
            ts
        ),
    }
}

/// Reply-context marker: `[Replying to <sender> id:<mid>]`
pub fn format_reply_context(sender: &str, message_id: &str) -> String {
    format!("[Replying to {} id:{}]", sender, message_id)
}

/// Media marker lines for the prompt.
///
/// Audio attachments whose transcript is already inlined elsewhere in the
/// prompt are dropped to save tokens. The audio decision keys off the
/// declared per-attachment MIME only.
pub fn format_media_lines(attachments: &[Attachment]) -> Vec<String> {
    let visible: Vec<&Attachment> = attachments
        .iter()
        .filter(|a| {
            let is_audio = a
                .mime
                .as_deref()
                .is_some_and(|m| m.starts_with("audio/"));
            !(is_audio && a.transcript.is_some())
        })
        .collect();

    match visible.len() {
        0 => Vec::new(),
        1 => vec![media_line(visible[0])],
        n => {
            let mut lines = Vec::with_capacity(n + 1);
            lines.push(format!("[media attached: {} files]", n));
            lines.extend(visible.iter().copied().map(media_line));
            lines
        }
    }
}

fn media_line(a: &Attachment) -> String {
    match (&a.path, &a.url) {
        (Some(path), Some(url)) => format!(
            "[media attached: {} ({}) | {}]",
            path,
            a.mime.as_deref().unwrap_or("unknown"),
            url
        ),
        (Some(path), None) => format!(
            "[media attached: {} ({})]",
            path,
            a.mime.as_deref().unwrap_or("unknown")
        ),
        (None, Some(url)) => format!("[media attached: {}]", url),
        (None, None) => "[media attached: (no source)]".to_string(),
    }
}

/// Remove generated leading markers from `text`.
///
/// A marker is a leading `[...]` segment containing an `id:` token — the
/// prompt header and the reply-context line both match. All stacked leading
/// markers are removed, which is what makes the operation idempotent.
pub fn strip_envelope(text: &str) -> String {
    let mut rest = text.trim_start();
    loop {
        match leading_marker_len(rest) {
            Some(len) => rest = rest[len..].trim_start(),
            None => break,
        }
    }
    rest.to_string()
}

/// Length of a recognized leading marker, or None.
fn leading_marker_len(text: &str) -> Option<usize> {
    if !text.starts_with('[') {
        return None;
    }
    let close = text.find(']')?;
    let inside = &text[1..close];
    // Headers carry "id:<n>"; anything else in brackets is user text.
    let has_id = inside
        .split_whitespace()
        .any(|tok| tok.starts_with("id:") && tok.len() > 3);
    if !has_id {
        return None;
    }
    Some(close + 1)
}

/// Fold a coalesced debounce bucket into one logical envelope.
///
/// Contract:
/// - texts concatenate in arrival order, skipping case-insensitive
///   duplicates (the URL-text + URL-balloon case);
/// - attachments concatenate and are re-indexed globally;
/// - timestamp is the max of the bucket;
/// - the primary `message_id` and reply context come from the first entry
///   that has them;
/// - the balloon bundle id is cleared — the result is no longer a balloon.
pub fn combine_entries(mut entries: Vec<Envelope>) -> Option<Envelope> {
    if entries.is_empty() {
        return None;
    }
    if entries.len() == 1 {
        return entries.pop();
    }

    let mut combined = entries[0].clone();

    let mut seen_lower: Vec<String> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    let mut attachments: Vec<Attachment> = Vec::new();
    let mut latest = combined.received_at;
    let mut reply_to = None;
    let mut message_id = None;
    let mut associated = None;
    let mut mentioned = false;

    for entry in &entries {
        let trimmed = entry.text.trim();
        if !trimmed.is_empty() {
            let lower = trimmed.to_lowercase();
            if !seen_lower.contains(&lower) {
                seen_lower.push(lower);
                texts.push(trimmed.to_string());
            }
        }

        attachments.extend(entry.attachments.iter().cloned());

        if entry.received_at > latest {
            latest = entry.received_at;
        }
        if message_id.is_none() {
            message_id = entry.message_id.clone();
        }
        if reply_to.is_none() {
            reply_to = entry.reply_to.clone();
        }
        if associated.is_none() {
            associated = entry.associated_message_id.clone();
        }
        mentioned |= entry.was_mentioned;
    }

    for (global_index, attachment) in attachments.iter_mut().enumerate() {
        attachment.index = global_index;
    }

    combined.text = texts.join(" ");
    combined.attachments = attachments;
    combined.received_at = latest;
    combined.message_id = message_id;
    combined.reply_to = reply_to;
    combined.associated_message_id = associated;
    combined.was_mentioned = mentioned;
    combined.balloon_bundle_id = None;
    Some(combined)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AttachmentKind, Envelope};
    use chrono::{Duration, Utc};

    fn attachment(kind: AttachmentKind, index: usize) -> Attachment {
        Attachment {
            kind,
            path: Some(format!("/tmp/a{index}")),
            url: None,
            mime: Some("image/png".to_string()),
            index,
            transcript: None,
        }
    }

    #[test]
    fn balloon_key_wins_over_message_id() {
        let mut env = Envelope::text_message("imessage", "alice", "https://ex.com");
        env.sender.account_id = Some("acct".to_string());
        env.message_id = Some("m2".to_string());
        env.balloon_bundle_id = Some("b".to_string());
        env.associated_message_id = Some("g1".to_string());

        assert_eq!(coalesce_key(&env), "imessage:acct:balloon:g1");
    }

    #[test]
    fn message_id_key_when_no_balloon() {
        let mut env = Envelope::text_message("imessage", "alice", "hi");
        env.sender.account_id = Some("acct".to_string());
        env.message_id = Some("m1".to_string());

        assert_eq!(coalesce_key(&env), "imessage:acct:msg:m1");
    }

    #[test]
    fn fallback_key_uses_scope_and_sender() {
        let mut env = Envelope::text_message("telegram", "bob", "hi");
        env.chat_id = Some("c9".to_string());

        assert_eq!(coalesce_key(&env), "telegram:default:c9:bob");
    }

    #[test]
    fn scope_key_prefers_guid_then_identifier_then_chat_id() {
        let mut env = Envelope::text_message("imessage", "a", "x");
        env.chat_id = Some("cid".to_string());
        env.chat_identifier = Some("ident".to_string());
        assert_eq!(scope_key(&env), "ident");

        env.chat_guid = Some("guid".to_string());
        assert_eq!(scope_key(&env), "guid");

        env.chat_guid = Some(String::new());
        assert_eq!(scope_key(&env), "ident");
    }

    #[test]
    fn strip_removes_header_marker() {
        let text = "[Imessage Family id:chat42 +2m 2026-07-01T10:00:00Z] hello there";
        assert_eq!(strip_envelope(text), "hello there");
    }

    #[test]
    fn strip_removes_stacked_markers() {
        let text = "[Imessage Family id:chat42 2026-07-01T10:00:00Z]\n[Replying to Bob id:m7]\nok";
        assert_eq!(strip_envelope(text), "ok");
    }

    #[test]
    fn strip_is_idempotent() {
        let text = "[Telegram dm id:55 2026-07-01T10:00:00Z] look [brackets] stay";
        let once = strip_envelope(text);
        assert_eq!(strip_envelope(&once), once);
    }

    #[test]
    fn strip_leaves_user_brackets_alone() {
        let text = "[just some aside] real content";
        assert_eq!(strip_envelope(text), text);
    }

    #[test]
    fn header_contains_scope_and_timestamp() {
        let mut env = Envelope::text_message("telegram", "bob", "hi");
        env.chat_id = Some("c9".to_string());
        let header = format_header(&env, "dm", Some("2m"));
        assert!(header.starts_with("[Telegram dm id:c9 +2m "));
        assert!(header.ends_with(']'));
    }

    #[test]
    fn media_lines_single_and_multi() {
        let one = format_media_lines(&[attachment(AttachmentKind::Image, 0)]);
        assert_eq!(one, vec!["[media attached: /tmp/a0 (image/png)]"]);

        let many = format_media_lines(&[
            attachment(AttachmentKind::Image, 0),
            attachment(AttachmentKind::File, 1),
        ]);
        assert_eq!(many[0], "[media attached: 2 files]");
        assert_eq!(many.len(), 3);
    }

    #[test]
    fn transcribed_audio_is_dropped_from_media_lines() {
        let mut audio = attachment(AttachmentKind::Audio, 0);
        audio.mime = Some("audio/ogg".to_string());
        audio.transcript = Some("hello".to_string());

        // a sniffed/fallback mime must not trigger the drop
        let mut untagged = attachment(AttachmentKind::Audio, 1);
        untagged.mime = None;
        untagged.transcript = Some("hello".to_string());

        let lines = format_media_lines(&[audio, untagged]);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("/tmp/a1"));
    }

    #[test]
    fn combine_url_preview_case() {
        // S1: text event + balloon URL event with the same association.
        let t0 = Utc::now();
        let mut a = Envelope::text_message("imessage", "alice", "look here");
        a.message_id = Some("m1".to_string());
        a.received_at = t0;

        let mut b = Envelope::text_message("imessage", "alice", "https://ex.com");
        b.message_id = Some("m2".to_string());
        b.balloon_bundle_id = Some("b".to_string());
        b.associated_message_id = Some("g1".to_string());
        b.received_at = t0 + Duration::milliseconds(120);

        let combined = combine_entries(vec![a, b]).unwrap();
        assert_eq!(combined.text, "look here https://ex.com");
        assert_eq!(combined.message_id.as_deref(), Some("m1"));
        assert!(combined.balloon_bundle_id.is_none());
        assert_eq!(combined.received_at, t0 + Duration::milliseconds(120));
    }

    #[test]
    fn combine_dedupes_repeated_text_case_insensitive() {
        let a = Envelope::text_message("imessage", "alice", "HTTPS://EX.COM");
        let b = Envelope::text_message("imessage", "alice", "https://ex.com");
        let combined = combine_entries(vec![a, b]).unwrap();
        assert_eq!(combined.text, "HTTPS://EX.COM");
    }

    #[test]
    fn combine_reindexes_attachments_globally() {
        let mut a = Envelope::text_message("imessage", "alice", "one");
        a.attachments = vec![attachment(AttachmentKind::Image, 0)];
        let mut b = Envelope::text_message("imessage", "alice", "two");
        b.attachments = vec![
            attachment(AttachmentKind::File, 0),
            attachment(AttachmentKind::Video, 1),
        ];

        let combined = combine_entries(vec![a, b]).unwrap();
        let indices: Vec<usize> = combined.attachments.iter().map(|a| a.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
    }
}
