//! Inline markup carried inside rendered paragraphs.
//!
//! A tiny tag language: `<b>`, `<i>`, `<u>`, `<code>`, `<link href="..">` and
//! `<br/>`. Text is entity-escaped (`&amp;`, `&lt;`, `&gt;`, `&quot;`) so source
//! content can never be mistaken for a tag.

use regex::Regex;
use std::sync::OnceLock;

/// Escape text so it can be embedded in markup.
pub fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

/// Escape an attribute value (also quotes).
pub fn escape_attr(text: &str) -> String {
    escape(text).replace('"', "&quot;")
}

pub fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Wrap markup in an external hyperlink.
pub fn link(href: &str, inner: &str) -> String {
    format!("<link href=\"{}\">{}</link>", escape_attr(href), inner)
}

/// A maximal stretch of text sharing one set of inline attributes.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Run {
    pub text: String,
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub monospace: bool,
    pub link: Option<String>,
}

/// Either a styled run or a forced line break.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Text(Run),
    LineBreak,
}

fn tag_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"<br/>|<(/?)(b|i|u|code|link)(?:\s+href="([^"]*)")?>"#)
            .expect("static regex is valid")
    })
}

#[derive(Default)]
struct State {
    bold: u32,
    italic: u32,
    underline: u32,
    monospace: u32,
    links: Vec<String>,
}

impl State {
    fn run(&self, text: String) -> Run {
        Run {
            text,
            bold: self.bold > 0,
            italic: self.italic > 0,
            underline: self.underline > 0,
            monospace: self.monospace > 0,
            link: self.links.last().cloned(),
        }
    }
}

/// Split markup into styled runs. Unbalanced closing tags are ignored.
pub fn tokenize(markup: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut state = State::default();
    let mut cursor = 0;

    for caps in tag_pattern().captures_iter(markup) {
        let whole = caps.get(0).expect("group 0 always matches");
        if whole.start() > cursor {
            let text = unescape(&markup[cursor..whole.start()]);
            tokens.push(Token::Text(state.run(text)));
        }
        cursor = whole.end();

        let Some(name) = caps.get(2).map(|m| m.as_str()) else {
            tokens.push(Token::LineBreak);
            continue;
        };
        let closing = caps.get(1).is_some_and(|m| !m.as_str().is_empty());
        let counter = match name {
            "b" => &mut state.bold,
            "i" => &mut state.italic,
            "u" => &mut state.underline,
            "code" => &mut state.monospace,
            _ => {
                if closing {
                    state.links.pop();
                } else {
                    let href = caps.get(3).map(|m| unescape(m.as_str())).unwrap_or_default();
                    state.links.push(href);
                }
                continue;
            }
        };
        if closing {
            *counter = counter.saturating_sub(1);
        } else {
            *counter += 1;
        }
    }
    if cursor < markup.len() {
        let text = unescape(&markup[cursor..]);
        tokens.push(Token::Text(state.run(text)));
    }
    tokens
}

/// Markup reduced to its visible text; line breaks become spaces.
pub fn to_plain(markup: &str) -> String {
    let mut out = String::new();
    for token in tokenize(markup) {
        match token {
            Token::Text(run) => out.push_str(&run.text),
            Token::LineBreak => out.push(' '),
        }
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escaped_text_is_not_parsed_as_tags() {
        let markup = format!("{} and <b>bold</b>", escape("<b>literal</b> & co"));
        let tokens = tokenize(&markup);
        let Token::Text(first) = &tokens[0] else {
            panic!("expected text");
        };
        assert_eq!(first.text, "<b>literal</b> & co and ");
        assert!(!first.bold);
        let Token::Text(second) = &tokens[1] else {
            panic!("expected text");
        };
        assert_eq!(second.text, "bold");
        assert!(second.bold);
    }

    #[test]
    fn nested_styles_and_links() {
        let tokens = tokenize(r#"<b><i>x</i></b><br/><link href="https://a.b/?q=1&amp;r=2">y</link>"#);
        assert_eq!(tokens.len(), 3);
        let Token::Text(x) = &tokens[0] else { panic!() };
        assert!(x.bold && x.italic);
        assert_eq!(tokens[1], Token::LineBreak);
        let Token::Text(y) = &tokens[2] else { panic!() };
        assert_eq!(y.link.as_deref(), Some("https://a.b/?q=1&r=2"));
    }

    #[test]
    fn plain_text_drops_tags() {
        assert_eq!(to_plain("Hello <b>World</b> &amp; more"), "Hello World & more");
    }
}
