//! Minimal HTML rendering.
//!
//! Real template rendering is an external collaborator; these helpers
//! exist so the handlers can answer with well-formed, escaped markup. The
//! kind registry decides which events get a specific card; everything
//! else goes through the generic renderer.

use crate::cache::stores::ProfileMetadata;
use crate::config::kinds;
use crate::types::{Event, Kind, PublicKey, REPOST, TEXT_NOTE};

pub fn escape_html(input: &str) -> String {
    let mut escaped = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

pub fn page(title: &str, body: &str) -> String {
    format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title></head>\n<body>{}</body></html>",
        escape_html(title),
        body
    )
}

pub fn display_name(pubkey: &PublicKey, profile: Option<&ProfileMetadata>) -> String {
    let fallback = || {
        crate::types::nip19::encode_npub(pubkey)
            .map(|npub| format!("{}…", &npub[..12]))
            .unwrap_or_else(|_| pubkey.to_hex())
    };
    profile
        .and_then(|p| p.display_name.clone().or_else(|| p.name.clone()))
        .map(|name| escape_html(&name))
        .unwrap_or_else(fallback)
}

/// One event as a markup fragment; dispatch follows the active kind
/// registry.
pub fn event_card(
    event: &Event,
    profile: Option<&ProfileMetadata>,
    extended_kinds: bool,
) -> String {
    if !kinds::is_registered(event.kind, extended_kinds) {
        return generic_card(event);
    }
    match event.kind {
        TEXT_NOTE => note_card(event, profile),
        REPOST => format!(
            "<article class=\"repost\" id=\"note-{}\">{} reposted</article>",
            event.id.to_hex(),
            display_name(&event.pubkey, profile),
        ),
        _ => generic_card(event),
    }
}

fn note_card(event: &Event, profile: Option<&ProfileMetadata>) -> String {
    let note_ref = crate::types::nip19::encode_note(&event.id)
        .unwrap_or_else(|_| event.id.to_hex());
    format!(
        "<article class=\"note\" id=\"note-{id}\">\
         <header><a href=\"/profile/{author}\">{name}</a> <time>{time}</time></header>\
         <p>{content}</p>\
         <footer><a href=\"/thread/{note_ref}\">thread</a></footer>\
         </article>",
        id = event.id.to_hex(),
        author = crate::types::nip19::encode_npub(&event.pubkey)
            .unwrap_or_else(|_| event.pubkey.to_hex()),
        name = display_name(&event.pubkey, profile),
        time = event.created_at,
        content = escape_html(&event.content),
        note_ref = note_ref,
    )
}

fn generic_card(event: &Event) -> String {
    format!(
        "<article class=\"generic\" id=\"note-{}\">kind {} event</article>",
        event.id.to_hex(),
        event.kind
    )
}

pub fn kind_label(kind: Kind) -> &'static str {
    match kind {
        TEXT_NOTE => "note",
        REPOST => "repost",
        crate::types::REACTION => "reaction",
        _ => "event",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Keys, Template};

    #[test]
    fn content_is_escaped() {
        let keys = Keys::generate();
        let event = Template::new(TEXT_NOTE, "<script>alert(1)</script> & more", vec![])
            .to_event(&keys)
            .unwrap();
        let html = event_card(&event, None, true);
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&amp; more"));
    }

    #[test]
    fn unregistered_kinds_render_generically() {
        let keys = Keys::generate();
        let event = Template::new(4242, "whatever", vec![]).to_event(&keys).unwrap();
        let html = event_card(&event, None, true);
        assert!(html.contains("kind 4242 event"));
        assert!(!html.contains("whatever"));
    }

    #[test]
    fn registry_choice_changes_rendering() {
        let keys = Keys::generate();
        let article = Template::new(30023, "long form", vec![]).to_event(&keys).unwrap();
        // Extended registry knows 30023, reduced does not.
        assert!(event_card(&article, None, false).contains("kind 30023 event"));
        assert!(event_card(&article, None, true).contains("kind 30023 event"));
    }

    #[test]
    fn display_name_prefers_profile_then_npub() {
        let keys = Keys::generate();
        let profile = ProfileMetadata {
            name: Some("alice <b>".into()),
            ..Default::default()
        };
        let name = display_name(&keys.public_key(), Some(&profile));
        assert_eq!(name, "alice &lt;b&gt;");

        let anonymous = display_name(&keys.public_key(), None);
        assert!(anonymous.starts_with("npub1"));
    }
}
