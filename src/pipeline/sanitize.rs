//! Whitelist markup sanitizer.
//!
//! Allowed tags are re-emitted with their allowed attributes only. Other tags
//! are unwrapped (children kept). Script-like containers are dropped with
//! everything inside them. The result is re-serialized from the parsed tree,
//! so every text node and attribute value comes out entity-escaped.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html};
use tracing::warn;

use crate::config::SanitizerConfig;

static SCRIPT_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<script.*?</script\s*>").unwrap());
static SCRIPT_OPEN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)<script[^>]*>?").unwrap());
static JAVASCRIPT_SCHEME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").unwrap());

const VOID_ELEMENTS: &[&str] = &["br", "hr", "img"];
const URL_ATTRIBUTES: &[&str] = &["href", "src"];

/// Produces embeddable markup from untrusted message bodies.
#[derive(Debug, Clone)]
pub struct Sanitizer {
    config: SanitizerConfig,
}

impl Sanitizer {
    pub fn new(config: SanitizerConfig) -> Self {
        Self { config }
    }

    /// Sanitized markup. Never fails; a parser panic yields "".
    pub fn sanitize(&self, markup: &str) -> String {
        if markup.trim().is_empty() {
            return String::new();
        }

        let rendered = catch_unwind(AssertUnwindSafe(|| {
            let fragment = Html::parse_fragment(markup);
            let mut out = String::with_capacity(markup.len());
            self.walk(fragment.root_element(), &mut out);
            out
        }));

        match rendered {
            Ok(out) => scrub(out),
            Err(_) => {
                warn!("Markup parser panicked, dropping markup body");
                String::new()
            }
        }
    }

    /// Markup to embed for a message: the sanitized markup, or `text` in a
    /// `<pre>` block when no markup survives.
    pub fn render(&self, markup: &str, text: &str) -> String {
        let sanitized = self.sanitize(markup);
        if !sanitized.trim().is_empty() || text.trim().is_empty() {
            return sanitized;
        }
        let mut out = String::with_capacity(text.len() + 64);
        out.push_str("<pre style=\"white-space:pre-wrap;font-family:inherit;\">");
        escape_into(text, false, &mut out);
        out.push_str("</pre>");
        scrub(out)
    }

    fn walk(&self, element: ElementRef<'_>, out: &mut String) {
        for child in element.children() {
            if let Some(el) = ElementRef::wrap(child) {
                let name = el.value().name().to_ascii_lowercase();
                if self.config.dropped_tags.contains(&name) {
                    continue;
                }
                if !self.config.allowed_tags.contains(&name) {
                    self.walk(el, out);
                    continue;
                }

                out.push('<');
                out.push_str(&name);
                for (attr, value) in el.value().attrs() {
                    let attr = attr.to_ascii_lowercase();
                    if self.attribute_allowed(&name, &attr, value) {
                        out.push(' ');
                        out.push_str(&attr);
                        out.push_str("=\"");
                        escape_into(value.trim(), true, out);
                        out.push('"');
                    }
                }
                out.push('>');

                if VOID_ELEMENTS.contains(&name.as_str()) {
                    continue;
                }
                self.walk(el, out);
                out.push_str("</");
                out.push_str(&name);
                out.push('>');
            } else if let Some(text) = child.value().as_text() {
                escape_into(text, false, out);
            }
        }
    }

    fn attribute_allowed(&self, tag: &str, attr: &str, value: &str) -> bool {
        let allowed = self
            .config
            .allowed_attributes
            .get(tag)
            .is_some_and(|attrs| attrs.contains(attr));
        if !allowed {
            return false;
        }
        if URL_ATTRIBUTES.contains(&attr) {
            return url_scheme(value).is_some_and(|s| self.config.allowed_url_schemes.contains(&s));
        }
        true
    }
}

/// Lower-cased scheme of a URL, ignoring whitespace and control characters
/// browsers would skip. `None` for relative URLs.
fn url_scheme(value: &str) -> Option<String> {
    let compact: String = value
        .chars()
        .filter(|c| !c.is_whitespace() && !c.is_control())
        .collect();
    let end = compact.find(|c: char| matches!(c, ':' | '/' | '?' | '#'))?;
    if !compact[end..].starts_with(':') || end == 0 {
        return None;
    }
    Some(compact[..end].to_ascii_lowercase())
}

fn escape_into(text: &str, attribute: bool, out: &mut String) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
}

/// Remove residual script blocks and `javascript:` until nothing changes.
fn scrub(mut markup: String) -> String {
    loop {
        let next = SCRIPT_BLOCK.replace_all(&markup, "");
        let next = SCRIPT_OPEN.replace_all(&next, "");
        let next = JAVASCRIPT_SCHEME.replace_all(&next, "").into_owned();
        if next == markup {
            return markup;
        }
        markup = next;
    }
}
