//! Pure functions implementing spec section 4.4. No component here touches
//! the network, a database, or Redis — this is the easiest module to test
//! exhaustively without infrastructure, so it carries the heaviest coverage
//! in the crate (spec section 8).

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;
use uuid::Uuid;

static ANCHOR_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<a\b[^>]*>.*?</a>").unwrap());
static HREF_ATTR: Lazy<Regex> = Lazy::new(|| Regex::new(r#"(?is)href\s*=\s*(["'])(.*?)\1"#).unwrap());
static BARE_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(https?://[^\s<>\x22\x27]+|//[A-Za-z0-9][^\s<>\x22\x27]*|www\.[A-Za-z0-9][^\s<>\x22\x27]*|\b[A-Za-z0-9][A-Za-z0-9\-\.]*\.(?:com|net|org|io|co|dev)(?:/[^\s<>\x22\x27]*)?)").unwrap()
});
static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)<[^>]*>").unwrap());
static BODY_CLOSE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)</body\s*>").unwrap());

/// Stage 1: auto-link bare URL-looking tokens that aren't already inside an
/// `<a>` tag. Restricted to text, never CSS/attribute content (spec section
/// 9's recommended resolution of the inline-style ambiguity — documented in
/// DESIGN.md).
pub fn autolink(html: &str) -> String {
    // Split the document into anchor-tag spans and the text between them;
    // only the "between" spans are candidates for autolinking.
    let mut out = String::with_capacity(html.len());
    let mut last = 0;
    for m in ANCHOR_TAG.find_iter(html) {
        out.push_str(&autolink_segment(&html[last..m.start()]));
        out.push_str(m.as_str());
        last = m.end();
    }
    out.push_str(&autolink_segment(&html[last..]));
    out
}

fn autolink_segment(segment: &str) -> String {
    BARE_URL
        .replace_all(segment, |caps: &regex::Captures| {
            let token = &caps[0];
            let href = normalize_href(token);
            format!(r#"<a href="{href}">{token}</a>"#)
        })
        .into_owned()
}

fn normalize_href(token: &str) -> String {
    if token.starts_with("//") {
        format!("https:{token}")
    } else if token.starts_with("http://") || token.starts_with("https://") {
        token.to_string()
    } else {
        format!("http://{token}")
    }
}

/// Stage 2: rewrite every `href` pointing at `http(s)` into a click-tracking
/// redirect, preserving the attribute's quote style. `mailto:`, `tel:`, and
/// fragment-only hrefs are left untouched.
pub fn rewrite_links_for_tracking(html: &str, base_url: &str, campaign_id: Uuid, contact_id: Uuid) -> String {
    HREF_ATTR
        .replace_all(html, |caps: &regex::Captures| {
            let quote = &caps[1];
            let url = &caps[2];
            let lower = url.to_ascii_lowercase();
            if lower.starts_with("mailto:") || lower.starts_with("tel:") || url.starts_with('#') {
                return caps[0].to_string();
            }
            if !(lower.starts_with("http://") || lower.starts_with("https://")) {
                return caps[0].to_string();
            }
            let encoded = URL_SAFE_NO_PAD.encode(url.as_bytes());
            let tracked = format!(
                "{base_url}/api/track/click/{campaign_id}/{contact_id}?u={encoded}&o=1"
            );
            format!("href={quote}{tracked}{quote}")
        })
        .into_owned()
}

/// Stage 3: inject a 1x1 open-pixel immediately before `</body>`, or append
/// one if the document has no body tag.
pub fn inject_open_pixel(html: &str, base_url: &str, campaign_id: Uuid, contact_id: Uuid, now_ms: i64) -> String {
    let pixel = format!(
        r#"<img src="{base_url}/api/track/open/{campaign_id}/{contact_id}?t={now_ms}" width="1" height="1" alt="" style="display:none" />"#
    );
    if let Some(m) = BODY_CLOSE.find(html) {
        let mut out = String::with_capacity(html.len() + pixel.len());
        out.push_str(&html[..m.start()]);
        out.push_str(&pixel);
        out.push_str(&html[m.start()..]);
        out
    } else {
        format!("{html}{pixel}")
    }
}

/// Runs all three rewrite stages in the order spec section 4.4 specifies.
pub fn rewrite(html: &str, base_url: &str, campaign_id: Uuid, contact_id: Uuid, now_ms: i64) -> String {
    let linked = autolink(html);
    let tracked = rewrite_links_for_tracking(&linked, base_url, campaign_id, contact_id);
    inject_open_pixel(&tracked, base_url, campaign_id, contact_id, now_ms)
}

/// Stage 4: plain-text fallback. Anchors expand to `text (href)`; everything
/// else simply loses its tags.
pub fn to_plain_text(html: &str) -> String {
    let with_anchors = ANCHOR_TAG
        .replace_all(html, |caps: &regex::Captures| {
            let anchor = &caps[0];
            let href = HREF_ATTR
                .captures(anchor)
                .map(|c| c[2].to_string())
                .unwrap_or_default();
            let text = TAG.replace_all(anchor, "").into_owned();
            if href.is_empty() {
                text
            } else {
                format!("{text} ({href})")
            }
        })
        .into_owned();
    let stripped = TAG.replace_all(&with_anchors, "").into_owned();
    let collapsed: Vec<&str> = stripped.split_whitespace().collect();
    collapsed.join(" ")
}

/// Counterpart to [`rewrite_links_for_tracking`]'s encoding: the click
/// decoder contract from spec section 4.4. Tries a fixed sequence of
/// interpretations and returns the first that yields an `http(s)` URL.
pub fn decode_click_target(u: &str) -> Option<String> {
    let trimmed = u.trim();

    // 1. URL-safe base64, repairing missing padding and +/space confusion.
    if let Some(url) = try_base64_decode(trimmed) {
        if is_http_url(&url) {
            return Some(url);
        }
    }

    // 2. Already a full URL.
    if is_http_url(trimmed) {
        return Some(trimmed.to_string());
    }

    // 3. Bare `www.*`.
    if trimmed.to_ascii_lowercase().starts_with("www.") {
        return Some(format!("http://{trimmed}"));
    }

    None
}

fn try_base64_decode(raw: &str) -> Option<String> {
    let repaired: String = raw.chars().map(|c| if c == ' ' { '+' } else { c }).collect();
    let repaired = repaired.trim();
    for candidate in [repaired.to_string(), pad_base64(repaired)] {
        if let Ok(bytes) = URL_SAFE_NO_PAD.decode(candidate.trim_end_matches('=')) {
            if let Ok(s) = String::from_utf8(bytes) {
                return Some(s);
            }
        }
        use base64::engine::general_purpose::STANDARD;
        if let Ok(bytes) = STANDARD.decode(&candidate) {
            if let Ok(s) = String::from_utf8(bytes) {
                return Some(s);
            }
        }
    }
    None
}

fn pad_base64(s: &str) -> String {
    let rem = s.len() % 4;
    if rem == 0 {
        s.to_string()
    } else {
        format!("{s}{}", "=".repeat(4 - rem))
    }
}

fn is_http_url(s: &str) -> bool {
    let lower = s.to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autolinks_bare_host_outside_anchors() {
        let html = "visit example.com today";
        let out = autolink(html);
        assert!(out.contains(r#"<a href="http://example.com">example.com</a>"#));
    }

    #[test]
    fn autolink_leaves_existing_anchors_untouched() {
        let html = r#"<a href="https://example.com">example.com</a>"#;
        let out = autolink(html);
        assert_eq!(out, html);
    }

    #[test]
    fn autolink_normalizes_protocol_relative() {
        let out = autolink("check //example.com/path out");
        assert!(out.contains(r#"href="https://example.com/path""#));
    }

    #[test]
    fn rewrite_links_preserves_quote_style() {
        let html = "<a href='https://example.com/a'>x</a>";
        let out = rewrite_links_for_tracking(html, "https://track.test", Uuid::nil(), Uuid::nil());
        assert!(out.starts_with("<a href='https://track.test/api/track/click/"));
        assert!(out.ends_with("'>x</a>"));
    }

    #[test]
    fn rewrite_links_skips_mailto_and_tel_and_fragment() {
        let html = r#"<a href="mailto:a@b.com">m</a><a href="tel:123">t</a><a href="#top">f</a>"#;
        let out = rewrite_links_for_tracking(html, "https://track.test", Uuid::nil(), Uuid::nil());
        assert_eq!(out, html);
    }

    #[test]
    fn injects_pixel_before_body_close() {
        let html = "<html><body>hi</body></html>";
        let out = inject_open_pixel(html, "https://track.test", Uuid::nil(), Uuid::nil(), 1);
        assert!(out.contains("<img src=\"https://track.test/api/track/open/"));
        assert!(out.find("<img").unwrap() < out.find("</body>").unwrap());
    }

    #[test]
    fn injects_pixel_appended_when_no_body() {
        let html = "<p>hi</p>";
        let out = inject_open_pixel(html, "https://track.test", Uuid::nil(), Uuid::nil(), 1);
        assert!(out.ends_with("/>"));
    }

    #[test]
    fn plain_text_expands_anchors() {
        let html = r#"<p>Hi <a href="https://example.com">click here</a></p>"#;
        let out = to_plain_text(html);
        assert_eq!(out, "Hi click here (https://example.com)");
    }

    #[test]
    fn decode_is_left_inverse_of_rewrite_encoding() {
        let url = "https://example.com/path?a=b&c=d";
        let html = format!(r#"<a href="{url}">go</a>"#);
        let rewritten = rewrite_links_for_tracking(&html, "https://track.test", Uuid::nil(), Uuid::nil());
        let encoded = HREF_ATTR.captures(&rewritten).unwrap()[2].to_string();
        let u_param = encoded.split("u=").nth(1).unwrap().split('&').next().unwrap();
        assert_eq!(decode_click_target(u_param).unwrap(), url);
    }

    #[test]
    fn decode_tolerates_missing_padding_and_plus_space_confusion() {
        let url = "https://example.com/x";
        let encoded = URL_SAFE_NO_PAD.encode(url.as_bytes());
        let with_space_for_plus = encoded.replace('+', " ");
        assert_eq!(decode_click_target(&with_space_for_plus).unwrap(), url);
    }

    #[test]
    fn decode_passes_through_full_url() {
        assert_eq!(
            decode_click_target("https://example.com/already").unwrap(),
            "https://example.com/already"
        );
    }

    #[test]
    fn decode_passes_through_bare_www() {
        assert_eq!(decode_click_target("www.example.com").unwrap(), "http://www.example.com");
    }

    #[test]
    fn decode_fails_on_garbage() {
        assert!(decode_click_target("not a url at all").is_none());
    }
}
