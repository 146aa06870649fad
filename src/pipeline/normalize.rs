//! Content normalizer: raw body → canonical plain text.
//!
//! Steps, in order:
//! 1. Pick the source: markup converted to text, else plain body, else fallback
//! 2. Normalize line endings and intra-line whitespace
//! 3. Until nothing changes: cut quoted replies and signatures, remove
//!    boilerplate phrases
//! 4. Drop short lines and unsubscribe/preferences lines
//! 5. Collapse blank runs to a single blank line
//! 6. Tag absolute URLs as `[link: URL]`
//!
//! Output is idempotent: normalizing canonical text returns it unchanged.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;

use regex::{Captures, Regex};
use scraper::{ElementRef, Html};
use tracing::warn;

use crate::config::{NormalizerConfig, compile_patterns};
use crate::error::ConfigError;

static URL_OR_MARKER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\[link: (?P<tagged>https?://[^\s\]]+)\]|(?P<url>https?://[^\s<>"'\)\]]+)"#)
        .unwrap()
});

/// Invisible characters newsletters use to pad preheaders.
const INVISIBLE: &[char] = &[
    '\u{200b}', '\u{200c}', '\u{200d}', '\u{2060}', '\u{feff}', '\u{034f}', '\u{00ad}',
];

/// Elements whose content is never text.
const SKIPPED_ELEMENTS: &[&str] = &[
    "head", "script", "style", "title", "meta", "link", "noscript", "template", "svg", "iframe",
    "object",
];

const BLOCK_ELEMENTS: &[&str] = &[
    "p", "div", "section", "article", "header", "footer", "main", "aside", "nav", "table",
    "blockquote", "pre", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "hr", "center",
];

const LINE_ELEMENTS: &[&str] = &["li", "tr", "dt", "dd"];

/// Turns message bodies into canonical text.
#[derive(Debug, Clone)]
pub struct Normalizer {
    phrases: Vec<Regex>,
    line_drops: Vec<Regex>,
    quote_cutoffs: Vec<Regex>,
    signatures: Vec<Regex>,
    min_line_chars: usize,
}

impl Normalizer {
    pub fn new(config: &NormalizerConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            phrases: compile_patterns(&config.boilerplate_patterns)?,
            line_drops: compile_patterns(&config.line_drop_patterns)?,
            quote_cutoffs: compile_patterns(&config.quote_cutoff_patterns)?,
            signatures: compile_patterns(&config.signature_patterns)?,
            min_line_chars: config.min_line_chars,
        })
    }

    /// Canonical text for a message. Never fails; garbage in gives "".
    pub fn normalize(&self, plain: &str, markup: &str, fallback: &str) -> String {
        let source = non_blank(markup)
            .and_then(markup_to_text)
            .and_then(|t| non_blank(&t).map(str::to_string))
            .or_else(|| non_blank(plain).map(str::to_string))
            .or_else(|| non_blank(fallback).map(str::to_string));

        match source {
            Some(text) => self.normalize_text(&text),
            None => String::new(),
        }
    }

    /// Normalize already-extracted plain text.
    pub fn normalize_text(&self, text: &str) -> String {
        let mut text = collapse_whitespace(&normalize_line_endings(text));

        loop {
            let stripped = collapse_whitespace(&self.remove_phrases(&self.strip_replies(&text)));
            if stripped == text {
                break;
            }
            text = stripped;
        }

        let kept: Vec<&str> = text.lines().filter(|line| self.keep_line(line)).collect();
        tag_urls(&collapse_blank_lines(&kept))
    }

    /// Drop `>` lines and cut at the first reply header or signature opener.
    fn strip_replies(&self, text: &str) -> String {
        let mut kept = Vec::new();
        for (index, line) in text.split('\n').enumerate() {
            if line.starts_with('>') {
                continue;
            }
            if self.quote_cutoffs.iter().any(|re| re.is_match(line))
                || (index > 0 && self.signatures.iter().any(|re| re.is_match(line)))
            {
                break;
            }
            kept.push(line);
        }
        kept.join("\n")
    }

    fn remove_phrases(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.phrases {
            out = re.replace_all(&out, "").into_owned();
        }
        out
    }

    fn keep_line(&self, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        line.chars().count() >= self.min_line_chars
            && !self.line_drops.iter().any(|re| re.is_match(line))
    }
}

fn non_blank(s: &str) -> Option<&str> {
    if s.trim().is_empty() { None } else { Some(s) }
}

fn normalize_line_endings(text: &str) -> String {
    text.replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|c| !INVISIBLE.contains(c))
        .collect()
}

/// Trim each line and squeeze whitespace runs to one space.
fn collapse_whitespace(text: &str) -> String {
    text.split('\n')
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Join lines, keeping at most one blank line in a row and none at the edges.
fn collapse_blank_lines(lines: &[&str]) -> String {
    let mut out: Vec<&str> = Vec::with_capacity(lines.len());
    for line in lines {
        if line.is_empty() && out.last().is_none_or(|l| l.is_empty()) {
            continue;
        }
        out.push(line);
    }
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.join("\n")
}

/// Wrap bare absolute URLs in `[link: URL]`; existing markers are left alone.
fn tag_urls(text: &str) -> String {
    URL_OR_MARKER
        .replace_all(text, |caps: &Captures| {
            if caps.name("tagged").is_some() {
                return caps[0].to_string();
            }
            let raw = &caps["url"];
            let url = raw.trim_end_matches(['.', ',', ';', ':', '!', '?']);
            if url.split_once("://").is_none_or(|(_, rest)| rest.is_empty()) {
                return raw.to_string();
            }
            format!("[link: {url}]{}", &raw[url.len()..])
        })
        .into_owned()
}

// ── Markup conversion ───────────────────────────────────────────────

/// Plain text from markup, paragraph breaks preserved.
///
/// `None` if the parser panics or nothing textual is left.
pub fn markup_to_text(markup: &str) -> Option<String> {
    let converted = catch_unwind(AssertUnwindSafe(|| {
        let document = Html::parse_document(markup);
        let mut out = String::with_capacity(markup.len() / 2);
        walk(document.root_element(), &mut out);
        out
    }));

    match converted {
        Ok(text) if !text.trim().is_empty() => Some(text),
        Ok(_) => None,
        Err(_) => {
            warn!("Markup parser panicked, ignoring markup body");
            None
        }
    }
}

fn walk(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(el) = ElementRef::wrap(child) {
            let name = el.value().name();
            if SKIPPED_ELEMENTS.contains(&name) {
                continue;
            }
            match name {
                "br" => out.push('\n'),
                "a" => {
                    let mut inner = String::new();
                    walk(el, &mut inner);
                    out.push_str(&inner);
                    if let Some(href) = el.value().attr("href").map(str::trim)
                        && is_absolute_http(href)
                        && !inner.contains(href)
                    {
                        out.push_str(" [link: ");
                        out.push_str(href);
                        out.push_str("] ");
                    }
                }
                "td" | "th" => {
                    walk(el, out);
                    out.push(' ');
                }
                _ if LINE_ELEMENTS.contains(&name) => {
                    ensure_newline(out);
                    walk(el, out);
                    ensure_newline(out);
                }
                _ if BLOCK_ELEMENTS.contains(&name) => {
                    ensure_blank_line(out);
                    walk(el, out);
                    ensure_blank_line(out);
                }
                _ => walk(el, out),
            }
        } else if let Some(text) = child.value().as_text() {
            out.extend(text.chars().map(|c| if c.is_whitespace() { ' ' } else { c }));
        }
    }
}

fn is_absolute_http(href: &str) -> bool {
    let lower = href.to_ascii_lowercase();
    (lower.starts_with("http://") || lower.starts_with("https://"))
        && !href.contains(|c: char| c.is_whitespace() || c == ']')
}

fn ensure_newline(out: &mut String) {
    if !out.is_empty() && !out.ends_with('\n') {
        out.push('\n');
    }
}

fn ensure_blank_line(out: &mut String) {
    if out.is_empty() {
        return;
    }
    ensure_newline(out);
    if !out.ends_with("\n\n") {
        out.push('\n');
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalizer() -> Normalizer {
        Normalizer::new(&NormalizerConfig::default()).unwrap()
    }

    // ── Source selection ────────────────────────────────────────────

    #[test]
    fn markup_preferred_over_plain() {
        let n = normalizer();
        let out = n.normalize("plain version", "<p>Markup version</p>", "");
        assert_eq!(out, "Markup version");
    }

    #[test]
    fn plain_used_when_markup_missing() {
        assert_eq!(normalizer().normalize("Plain body", "", ""), "Plain body");
    }

    #[test]
    fn fallback_used_when_both_empty() {
        assert_eq!(normalizer().normalize("  ", "", "Fallback text"), "Fallback text");
        assert_eq!(normalizer().normalize("", "", ""), "");
    }

    #[test]
    fn empty_markup_falls_through_to_plain() {
        let out = normalizer().normalize("Plain body", "<img src=\"x.png\">", "");
        assert_eq!(out, "Plain body");
    }

    // ── Markup conversion ───────────────────────────────────────────

    #[test]
    fn markup_blocks_become_paragraphs() {
        let markup = "<html><head><style>p { color: red }</style><title>T</title></head>\
            <body><p>First paragraph</p><script>alert('x')</script>\
            <div>Second<br>line</div><ul><li>One</li><li>Two</li></ul></body></html>";
        let out = normalizer().normalize("", markup, "");
        assert_eq!(out, "First paragraph\n\nSecond\nline\n\nOne\nTwo");
    }

    #[test]
    fn anchors_surface_absolute_links() {
        let markup = r#"<p>Read <a href="https://example.com/story">the story</a> now</p>
            <p><a href="/relative">Relative link</a></p>"#;
        let out = normalizer().normalize("", markup, "");
        assert_eq!(
            out,
            "Read the story [link: https://example.com/story] now\n\nRelative link"
        );
    }

    #[test]
    fn anchor_text_equal_to_href_is_not_doubled() {
        let markup = r#"<p><a href="https://example.com/">https://example.com/</a></p>"#;
        let out = normalizer().normalize("", markup, "");
        assert_eq!(out, "[link: https://example.com/]");
    }

    // ── Text cleanup ────────────────────────────────────────────────

    #[test]
    fn whitespace_and_line_endings_are_normalized() {
        let out = normalizer().normalize_text("  Hello \t  world \r\n\r\n\r\n\r\nNext\u{200b} line  ");
        assert_eq!(out, "Hello world\n\nNext line");
    }

    #[test]
    fn urls_are_tagged_once() {
        let n = normalizer();
        let out = n.normalize_text("See https://example.com/a, and [link: https://x.org/b].");
        assert_eq!(
            out,
            "See [link: https://example.com/a], and [link: https://x.org/b]."
        );
    }

    #[test]
    fn scheme_without_host_is_not_tagged() {
        let n = normalizer();
        assert_eq!(n.normalize_text("Broken link https://. here"), "Broken link https://. here");
        assert_eq!(n.normalize_text("Ends with https://"), "Ends with https://");
    }

    #[test]
    fn quoted_reply_is_cut() {
        let n = normalizer();
        let text = "Thanks for the update on the release.
            > earlier quoted line
            Second line of my own text.
            On Tue, 14 May 2024, Alice wrote:
            Everything she said before";
        assert_eq!(
            n.normalize_text(text),
            "Thanks for the update on the release.
Second line of my own text."
        );
    }

    #[test]
    fn czech_reply_header_is_cut() {
        let n = normalizer();
        let text = "Díky za zprávu.
Dne 14. 5. 2024 v 10:00 Jan Novák napsal(a):
Původní text";
        assert_eq!(n.normalize_text(text), "Díky za zprávu.");
    }

    #[test]
    fn signature_is_cut_after_first_line() {
        let n = normalizer();
        assert_eq!(
            n.normalize_text("Main story of the week

S pozdravem
Redakce"),
            "Main story of the week"
        );
        assert_eq!(
            n.normalize_text("Main story of the week
-- 
Sent from my phone"),
            "Main story of the week"
        );
        // A first line that opens like a signature is content.
        assert_eq!(
            n.normalize_text("Best, worst and weirdest crates of 2024"),
            "Best, worst and weirdest crates of 2024"
        );
    }

    #[test]
    fn boilerplate_phrases_removed_in_both_languages() {
        let n = normalizer();
        let text = "Nezobrazuje se vám newsletter správně? Zobrazit v prohlížeči\n\
            View in browser\n\
            Hlavní zprávy týdne\n\
            If you are having trouble viewing this email, Big news today";
        assert_eq!(n.normalize_text(text), "Hlavní zprávy týdne\nBig news today");
    }

    #[test]
    fn unsubscribe_and_short_lines_dropped() {
        let n = normalizer();
        let text = "Real content line\nok\nYou can unsubscribe at any time\nOdhlásit se z odběru\nManage preferences\nAnother line";
        assert_eq!(n.normalize_text(text), "Real content line\nAnother line");
    }

    #[test]
    fn phrase_removal_reaches_fixed_point() {
        let n = normalizer();
        // Removing the inner phrase reassembles the outer one.
        let text = "Story: view in view in browser browser today";
        assert_eq!(n.normalize_text(text), "Story: today");
    }

    #[test]
    fn normalization_is_idempotent() {
        let n = normalizer();
        let inputs = [
            "Plain text with https://example.com/x. And more.\n\n\n\nSecond   paragraph",
            "[link: https://a.b/c] already tagged\nhttps://bare.example.org/path?q=1",
            "View in browser: https://x.com/web\nContent here\n\n\nUnsubscribe: https://x.com/u",
            "x\n\n\n\ny\n\nzzz",
            "[https://bracketed.example.com]",
            "Reply above\n> quoted\nOn Monday Bob wrote:\nold text",
            "Intro line here\nok\nBest, the team",
            "https://. and https://",
            "",
        ];
        for input in inputs {
            let once = n.normalize_text(input);
            assert_eq!(n.normalize_text(&once), once, "not idempotent for {input:?}");
        }

        let markup = r#"<div><p>Hello <a href="https://e.com/unsubscribe:now">there</a></p><p>Body text</p></div>"#;
        let once = n.normalize("", markup, "");
        assert_eq!(n.normalize(&once, "", ""), once);
    }

    #[test]
    fn garbled_markup_does_not_panic() {
        let n = normalizer();
        let out = n.normalize("", "<<<<>>>><p <div><//a>&&&;&#xffffff;<td>Cell", "");
        assert!(out.contains("Cell"));
    }
}
