//! HTML fragment → ordered document elements.
//!
//! [`render`] walks the parsed tree recursively, carrying the inherited block
//! and inline style. Block tags emit elements; inline tags return markup to
//! their caller; unknown tags are transparent. The function is pure: the
//! result is composed from the children's results, nothing is accumulated in
//! shared state, and identical input always yields identical output.

use scraper::{ElementRef, Html, Node};

use crate::markup;

/// Paragraph-level style of an element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Body,
    Heading(u8),
    ListItem,
    Blockquote,
    Code,
    Preformatted,
    /// Document title (assignment name, page name, course pages title).
    Title,
    /// Per-page heading in a combined document; captured for the table of contents.
    PageTitle,
    /// Clickable line (TOC entries, "View on Canvas").
    Link,
}

/// One element of an output document.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentElement {
    Heading { level: u8, text: String, style: Style },
    Paragraph { markup: String, style: Style },
    ListBlock { ordered: bool, items: Vec<String> },
    /// Vertical gap in points.
    Spacer(f32),
    PageBreak,
}

impl DocumentElement {
    pub fn paragraph(markup: impl Into<String>) -> Self {
        DocumentElement::Paragraph {
            markup: markup.into(),
            style: Style::Body,
        }
    }

    pub fn styled(markup: impl Into<String>, style: Style) -> Self {
        DocumentElement::Paragraph {
            markup: markup.into(),
            style,
        }
    }
}

/// Inline attributes inherited from enclosing tags.
#[derive(Debug, Clone, Copy, Default)]
struct InlineStyle {
    bold: bool,
    italic: bool,
    underline: bool,
    monospace: bool,
}

#[derive(Debug, Clone, Copy)]
struct Context {
    block: Option<Style>,
    inline: InlineStyle,
}

impl Context {
    fn root() -> Self {
        Self {
            block: None,
            inline: InlineStyle::default(),
        }
    }

    fn with_block(self, style: Style) -> Self {
        Self {
            block: Some(style),
            ..self
        }
    }

    fn with_inline(self, f: impl FnOnce(&mut InlineStyle)) -> Self {
        let mut inline = self.inline;
        f(&mut inline);
        Self { inline, ..self }
    }
}

/// Result of visiting a subtree: inline markup for the caller plus any block elements emitted.
#[derive(Debug, Default)]
struct Fragment {
    inline: String,
    blocks: Vec<DocumentElement>,
}

impl Fragment {
    fn inline(text: String) -> Self {
        Self {
            inline: text,
            blocks: Vec::new(),
        }
    }

    fn absorb(&mut self, other: Fragment) {
        self.inline.push_str(&other.inline);
        self.blocks.extend(other.blocks);
    }
}

const BLOCK_TAGS: &[&str] = &[
    "p", "div", "h1", "h2", "h3", "h4", "h5", "h6", "ul", "ol", "li", "blockquote", "pre",
    "code", "table", "tr",
];

fn is_block_tag(name: &str) -> bool {
    BLOCK_TAGS.contains(&name)
}

fn heading_level(name: &str) -> Option<u8> {
    match name {
        "h1" => Some(1),
        "h2" => Some(2),
        "h3" => Some(3),
        "h4" => Some(4),
        "h5" => Some(5),
        "h6" => Some(6),
        _ => None,
    }
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !last_was_space {
                out.push(' ');
            }
            last_was_space = true;
        } else {
            out.push(c);
            last_was_space = false;
        }
    }
    out
}

fn wrap_inline(text: String, style: InlineStyle) -> String {
    let mut out = text;
    if style.underline {
        out = format!("<u>{out}</u>");
    }
    if style.italic {
        out = format!("<i>{out}</i>");
    }
    if style.bold {
        out = format!("<b>{out}</b>");
    }
    if style.monospace {
        out = format!("<code>{out}</code>");
    }
    out
}

/// Emit `element` followed by a spacer when `content` has visible text.
fn block(content: &str, spacing: f32, make: impl FnOnce(String) -> DocumentElement) -> Vec<DocumentElement> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    vec![make(trimmed.to_string()), DocumentElement::Spacer(spacing)]
}

fn visit_children(element: ElementRef<'_>, ctx: Context) -> Fragment {
    let mut fragment = Fragment::default();
    for child in element.children() {
        let result = match child.value() {
            Node::Text(text) => visit_text(text, ctx),
            Node::Element(_) => match ElementRef::wrap(child) {
                Some(el) => visit_element(el, ctx),
                None => Fragment::default(),
            },
            _ => Fragment::default(),
        };
        fragment.absorb(result);
    }
    fragment
}

fn visit_text(text: &str, ctx: Context) -> Fragment {
    let collapsed = collapse_whitespace(text);
    if collapsed.trim().is_empty() {
        // Keep a separating space between inline siblings.
        return Fragment::inline(if collapsed.is_empty() { String::new() } else { " ".into() });
    }
    Fragment::inline(wrap_inline(markup::escape(&collapsed), ctx.inline))
}

fn visit_element(element: ElementRef<'_>, ctx: Context) -> Fragment {
    let name = element.value().name();

    if let Some(level) = heading_level(name) {
        let style = Style::Heading(level);
        let inner = visit_children(element, ctx.with_block(style));
        let mut blocks = inner.blocks;
        blocks.extend(block(&inner.inline, 12.0, |text| DocumentElement::Heading {
            level,
            text,
            style,
        }));
        return Fragment {
            inline: String::new(),
            blocks,
        };
    }

    match name {
        "p" | "div" | "tr" => {
            let inner = visit_children(element, ctx);
            let style = ctx.block.unwrap_or(Style::Body);
            let mut blocks = inner.blocks;
            blocks.extend(block(&inner.inline, 6.0, |markup| DocumentElement::Paragraph {
                markup,
                style,
            }));
            Fragment {
                inline: String::new(),
                blocks,
            }
        }
        "blockquote" => {
            let inner = visit_children(element, ctx.with_block(Style::Blockquote));
            let mut blocks = inner.blocks;
            blocks.extend(block(&inner.inline, 6.0, |markup| DocumentElement::Paragraph {
                markup,
                style: Style::Blockquote,
            }));
            Fragment {
                inline: String::new(),
                blocks,
            }
        }
        "ul" | "ol" => visit_list(element, ctx, name == "ol"),
        "pre" => visit_preformatted(element, Style::Preformatted),
        "strong" | "b" => visit_children(element, ctx.with_inline(|s| s.bold = true)),
        "em" | "i" => visit_children(element, ctx.with_inline(|s| s.italic = true)),
        "u" => visit_children(element, ctx.with_inline(|s| s.underline = true)),
        "code" | "kbd" | "samp" | "tt" => {
            visit_children(element, ctx.with_inline(|s| s.monospace = true))
        }
        "br" => Fragment::inline("<br/>".into()),
        "a" => visit_anchor(element, ctx),
        "td" | "th" => {
            let mut inner = visit_children(element, ctx);
            inner.inline.push(' ');
            inner
        }
        "script" | "style" | "head" | "title" | "noscript" => Fragment::default(),
        // `li` reached outside a list, and anything unrecognised: transparent.
        _ => visit_children(element, ctx),
    }
}

fn visit_anchor(element: ElementRef<'_>, ctx: Context) -> Fragment {
    let mut inner = visit_children(element, ctx);
    let href = element.value().attr("href").unwrap_or("").trim();
    if inner.inline.trim().is_empty() || href.is_empty() || href.starts_with('#') {
        // In-document fragment links degrade to plain text.
        return inner;
    }
    inner.inline = markup::link(href, &inner.inline);
    inner
}

fn visit_list(element: ElementRef<'_>, ctx: Context, ordered: bool) -> Fragment {
    let mut blocks = Vec::new();
    let mut items = Vec::new();
    let item_ctx = ctx.with_block(Style::ListItem);
    for child in element.children().filter_map(ElementRef::wrap) {
        if child.value().name() != "li" {
            continue;
        }
        let inner = visit_children(child, item_ctx);
        blocks.extend(inner.blocks);
        let text = inner.inline.trim();
        if !text.is_empty() {
            items.push(text.to_string());
        }
    }
    if !items.is_empty() {
        blocks.push(DocumentElement::ListBlock { ordered, items });
        blocks.push(DocumentElement::Spacer(6.0));
    }
    Fragment {
        inline: String::new(),
        blocks,
    }
}

fn visit_preformatted(element: ElementRef<'_>, style: Style) -> Fragment {
    let raw: String = element.text().collect();
    let trimmed = raw.trim_matches('\n');
    if trimmed.trim().is_empty() {
        return Fragment::default();
    }
    let markup = trimmed
        .lines()
        .map(markup::escape)
        .collect::<Vec<_>>()
        .join("<br/>");
    Fragment {
        inline: String::new(),
        blocks: vec![
            DocumentElement::Paragraph { markup, style },
            DocumentElement::Spacer(6.0),
        ],
    }
}

fn flush(buffer: &mut String, out: &mut Vec<DocumentElement>, trailing_spacer: bool) {
    let text = buffer.trim();
    if !text.is_empty() {
        out.push(DocumentElement::paragraph(text));
        if trailing_spacer {
            out.push(DocumentElement::Spacer(6.0));
        }
    }
    buffer.clear();
}

/// Render an HTML fragment into document elements.
///
/// Bare text and inline tags at the top level are buffered and emitted as one
/// paragraph before the next block sibling, and once more at the end.
pub fn render(html: &str) -> Vec<DocumentElement> {
    if html.trim().is_empty() {
        return Vec::new();
    }
    let document = Html::parse_fragment(html);
    let root = document.root_element();
    let ctx = Context::root();

    let mut out = Vec::new();
    let mut buffer = String::new();

    for child in root.children() {
        match child.value() {
            Node::Text(text) => buffer.push_str(&visit_text(text, ctx).inline),
            Node::Element(el) => {
                let Some(element) = ElementRef::wrap(child) else {
                    continue;
                };
                let name = el.name();
                if is_block_tag(name) {
                    flush(&mut buffer, &mut out, true);
                    let fragment = match name {
                        "code" => visit_preformatted(element, Style::Code),
                        "li" => {
                            let inner = visit_children(element, ctx.with_block(Style::ListItem));
                            let mut blocks = inner.blocks;
                            blocks.extend(block(&inner.inline, 6.0, |markup| {
                                DocumentElement::Paragraph {
                                    markup,
                                    style: Style::ListItem,
                                }
                            }));
                            Fragment {
                                inline: String::new(),
                                blocks,
                            }
                        }
                        _ => visit_element(element, ctx),
                    };
                    out.extend(fragment.blocks);
                } else {
                    let fragment = visit_element(element, ctx);
                    if !fragment.blocks.is_empty() {
                        flush(&mut buffer, &mut out, true);
                        out.extend(fragment.blocks);
                    }
                    buffer.push_str(&fragment.inline);
                }
            }
            _ => {}
        }
    }
    flush(&mut buffer, &mut out, false);
    out
}

/// All visible text of an HTML fragment, whitespace-collapsed.
pub fn plain_text(html: &str) -> String {
    let document = Html::parse_fragment(html);
    let joined = document
        .root_element()
        .text()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    collapse_whitespace(&joined)
}

/// Render `html`; when that yields nothing, fall back to its escaped plain text in `style`.
pub fn render_or_plain(html: &str, style: Style) -> Vec<DocumentElement> {
    let elements = render(html);
    if !elements.is_empty() {
        return elements;
    }
    let plain = plain_text(html);
    if plain.is_empty() {
        return Vec::new();
    }
    vec![DocumentElement::styled(markup::escape(&plain), style)]
}
