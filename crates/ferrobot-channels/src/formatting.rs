//! Markdown → Telegram HTML.
//!
//! Telegram parses only a narrow HTML subset, so LM output gets converted
//! in staged passes over the text:
//!
//! 1. stow code regions (fenced blocks, then spans) behind placeholders
//! 2. drop block markers Telegram can't render (headings, quote prefixes)
//! 3. escape HTML entities
//! 4. restyle inline markdown (links, bold, italic, strikethrough) and
//!    turn list dashes into dots
//! 5. restore the stowed code as `<pre><code>`/`<code>` nodes
//!
//! Stowing must come first or markdown inside code gets restyled, and the
//! quote pass must precede escaping or `>` markers turn into `&gt;` before
//! they can be recognized.

use regex::{Captures, Regex};

/// Placeholder delimiters for stowed code. Private-use codepoints never
/// occur in model output, so restoring by literal replacement is safe.
const STOW_OPEN: char = '\u{e000}';
const STOW_CLOSE: char = '\u{e001}';

/// Code regions lifted out of the text before any rewriting touches it.
#[derive(Default)]
struct CodeStash {
    fenced: Vec<String>,
    spans: Vec<String>,
}

impl CodeStash {
    /// Replace code regions with placeholders, remembering their bodies.
    fn stow(&mut self, markdown: &str) -> String {
        let fenced_re = Regex::new(r"(?s)```(?:\w+)?\n?(.*?)```").unwrap();
        let after_fenced = fenced_re
            .replace_all(markdown, |caps: &Captures| {
                self.fenced.push(caps[1].to_string());
                format!("{STOW_OPEN}f{}{STOW_CLOSE}", self.fenced.len() - 1)
            })
            .into_owned();

        let span_re = Regex::new(r"`([^`]+)`").unwrap();
        span_re
            .replace_all(&after_fenced, |caps: &Captures| {
                self.spans.push(caps[1].to_string());
                format!("{STOW_OPEN}s{}{STOW_CLOSE}", self.spans.len() - 1)
            })
            .into_owned()
    }

    /// Swap the placeholders back in as escaped Telegram code nodes.
    fn restore(self, mut html: String) -> String {
        for (n, body) in self.spans.iter().enumerate() {
            html = html.replace(
                &format!("{STOW_OPEN}s{n}{STOW_CLOSE}"),
                &format!("<code>{}</code>", escape_entities(body)),
            );
        }
        for (n, body) in self.fenced.iter().enumerate() {
            html = html.replace(
                &format!("{STOW_OPEN}f{n}{STOW_CLOSE}"),
                &format!("<pre><code>{}</code></pre>", escape_entities(body)),
            );
        }
        html
    }
}

fn escape_entities(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// Drop block markers that have no Telegram equivalent, keeping their
/// text: heading hashes and blockquote prefixes.
fn drop_block_markers(text: &str) -> String {
    let heading = Regex::new(r"(?m)^#{1,6}[ \t]+").unwrap();
    let after_headings = heading.replace_all(text, "");

    let quote = Regex::new(r"(?m)^>[ \t]?").unwrap();
    quote.replace_all(&after_headings, "").into_owned()
}

/// Rewrite inline markdown on already-escaped text.
fn restyle_inline(text: &str) -> String {
    let link = Regex::new(r"\[([^\]]+)\]\(([^)]+)\)").unwrap();
    let text = link.replace_all(text, r#"<a href="$2">$1</a>"#);

    let bold = Regex::new(r"\*\*(.+?)\*\*|__(.+?)__").unwrap();
    let text = bold.replace_all(&text, |caps: &Captures| {
        let inner = caps
            .get(1)
            .or_else(|| caps.get(2))
            .map(|m| m.as_str())
            .unwrap_or_default();
        format!("<b>{inner}</b>")
    });

    // Emphasis only at word edges, so snake_case identifiers survive.
    // The regex crate has no lookbehind; capture the neighbors instead.
    let italic = Regex::new(r"(^|[^\w])_([^_]+?)_($|[^\w])").unwrap();
    let text = italic.replace_all(&text, |caps: &Captures| {
        format!("{}<i>{}</i>{}", &caps[1], &caps[2], &caps[3])
    });

    let strike = Regex::new(r"~~(.+?)~~").unwrap();
    let text = strike.replace_all(&text, "<s>$1</s>");

    let bullet = Regex::new(r"(?m)^[ \t]*[-*][ \t]+").unwrap();
    bullet.replace_all(&text, "• ").into_owned()
}

/// Convert markdown to Telegram-ready HTML.
///
/// Callers fall back to plain text if Telegram rejects the result.
pub fn to_telegram_html(markdown: &str) -> String {
    let mut stash = CodeStash::default();
    let stowed = stash.stow(markdown);
    let stripped = drop_block_markers(&stowed);
    let escaped = escape_entities(&stripped);
    let styled = restyle_inline(&escaped);
    stash.restore(styled)
}

/// Split text into chunks of at most `limit` bytes for platforms with a
/// message-length cap.
///
/// Whole lines are packed greedily; a single line longer than the limit
/// is hard-split (on a char boundary).
pub fn split_chunks(text: &str, limit: usize) -> Vec<String> {
    if text.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut current = String::new();

    for line in text.split('\n') {
        if !current.is_empty() && current.len() + 1 + line.len() > limit {
            chunks.push(std::mem::take(&mut current));
        }

        if line.len() > limit {
            if !current.is_empty() {
                chunks.push(std::mem::take(&mut current));
            }
            let mut rest = line;
            while rest.len() > limit {
                let mut cut = limit;
                while !rest.is_char_boundary(cut) {
                    cut -= 1;
                }
                let (head, tail) = rest.split_at(cut);
                chunks.push(head.to_string());
                rest = tail;
            }
            current.push_str(rest);
        } else {
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(line);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

// ─────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────
