//! Final document assembly: lays [`DocumentElement`]s onto US-Letter pages and
//! writes them with `printpdf`.
//!
//! Layout runs before any PDF bytes exist so that placement side effects can be
//! observed: every [`Style::PageTitle`] paragraph or heading that lands on a
//! page is given the next anchor key (`h1`, `h2`, ...) and recorded as a
//! [`TocEntry`] with its final page. Those entries become outline bookmarks, and
//! internal `#hN` links in the table of contents get the resolved page number.
//!
//! Every link run becomes a clickable annotation over its text: `#key` targets
//! jump to the page the anchor landed on, anything else opens as a URI.

use printpdf::{
    Actions, BuiltinFont, Color, Destination, LinkAnnotation, Mm, Op, PdfDocument, PdfPage,
    PdfSaveOptions, Point, Pt, Rect, Rgb, TextItem,
};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::RenderError;
use crate::markup::{self, Run, Token};
use crate::render::{DocumentElement, Style};

const PAGE_WIDTH: f32 = 612.0;
const PAGE_HEIGHT: f32 = 792.0;
const MARGIN: f32 = 72.0;
const CONTENT_WIDTH: f32 = PAGE_WIDTH - 2.0 * MARGIN;

/// A captured heading: anchor key, visible title and 1-based page number.
#[derive(Debug, Clone, PartialEq)]
pub struct TocEntry {
    pub key: String,
    pub title: String,
    pub page: usize,
}

/// Output of [`assemble`].
#[derive(Debug, Clone)]
pub struct AssembledDocument {
    pub bytes: Vec<u8>,
    pub page_count: usize,
    pub toc: Vec<TocEntry>,
}

#[derive(Debug, Clone, Copy)]
struct Metrics {
    size: f32,
    leading: f32,
    left_indent: f32,
    right_indent: f32,
    bold: bool,
    monospace: bool,
    colour: (f32, f32, f32),
}

fn metrics(style: Style) -> Metrics {
    let base = Metrics {
        size: 10.0,
        leading: 12.0,
        left_indent: 0.0,
        right_indent: 0.0,
        bold: false,
        monospace: false,
        colour: (0.0, 0.0, 0.0),
    };
    match style {
        Style::Body => base,
        Style::Heading(level) => {
            let size = match level {
                1 => 18.0,
                2 => 16.0,
                3 => 14.0,
                4 => 12.0,
                5 => 11.0,
                _ => 10.0,
            };
            Metrics {
                size,
                leading: size * 1.2,
                bold: true,
                ..base
            }
        }
        Style::ListItem => Metrics {
            left_indent: 15.0,
            ..base
        },
        Style::Blockquote => Metrics {
            left_indent: 20.0,
            right_indent: 20.0,
            ..base
        },
        Style::Code | Style::Preformatted => Metrics {
            size: 9.0,
            leading: 11.0,
            left_indent: 10.0,
            monospace: true,
            ..base
        },
        Style::Title => Metrics {
            size: 16.0,
            leading: 20.0,
            bold: true,
            ..base
        },
        Style::PageTitle => Metrics {
            size: 14.0,
            leading: 17.0,
            bold: true,
            ..base
        },
        Style::Link => Metrics {
            colour: (0.0, 0.0, 1.0),
            ..base
        },
    }
}

/// One positioned piece of text.
#[derive(Debug, Clone, PartialEq)]
struct Segment {
    text: String,
    font: BuiltinFont,
    size: f32,
    colour: (f32, f32, f32),
    link: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
struct PlacedLine {
    x: f32,
    /// Baseline, measured from the bottom of the page.
    y: f32,
    segments: Vec<Segment>,
}

#[derive(Debug, Default)]
struct LaidOutPage {
    lines: Vec<PlacedLine>,
}

fn font_for(bold: bool, italic: bool, monospace: bool) -> BuiltinFont {
    match (monospace, bold, italic) {
        (true, false, false) => BuiltinFont::Courier,
        (true, true, false) => BuiltinFont::CourierBold,
        (true, false, true) => BuiltinFont::CourierOblique,
        (true, true, true) => BuiltinFont::CourierBoldOblique,
        (false, false, false) => BuiltinFont::Helvetica,
        (false, true, false) => BuiltinFont::HelveticaBold,
        (false, false, true) => BuiltinFont::HelveticaOblique,
        (false, true, true) => BuiltinFont::HelveticaBoldOblique,
    }
}

/// Approximate advance width; built-in fonts carry no metrics we can query cheaply.
fn text_width(text: &str, font: BuiltinFont, size: f32) -> f32 {
    let factor = match font {
        BuiltinFont::Courier
        | BuiltinFont::CourierBold
        | BuiltinFont::CourierOblique
        | BuiltinFont::CourierBoldOblique => 0.6,
        BuiltinFont::HelveticaBold | BuiltinFont::HelveticaBoldOblique => 0.56,
        _ => 0.5,
    };
    text.chars().count() as f32 * size * factor
}

struct Layout<'a> {
    pages: Vec<LaidOutPage>,
    cursor: f32,
    pending_bookmarks: Vec<String>,
    anchors: HashMap<String, usize>,
    toc: Vec<TocEntry>,
    resolved: Option<&'a HashMap<String, usize>>,
}

impl<'a> Layout<'a> {
    fn new(resolved: Option<&'a HashMap<String, usize>>) -> Self {
        Self {
            pages: vec![LaidOutPage::default()],
            cursor: PAGE_HEIGHT - MARGIN,
            pending_bookmarks: Vec::new(),
            anchors: HashMap::new(),
            toc: Vec::new(),
            resolved,
        }
    }

    fn page_number(&self) -> usize {
        self.pages.len()
    }

    fn current_page_is_empty(&self) -> bool {
        self.pages.last().map_or(true, |p| p.lines.is_empty())
    }

    fn new_page(&mut self) {
        self.pages.push(LaidOutPage::default());
        self.cursor = PAGE_HEIGHT - MARGIN;
    }

    fn space(&mut self, height: f32) {
        self.cursor -= height;
        if self.cursor < MARGIN {
            self.new_page();
        }
    }

    fn place_line(&mut self, x: f32, leading: f32, segments: Vec<Segment>) {
        if self.cursor - leading < MARGIN && !self.current_page_is_empty() {
            self.new_page();
        }
        self.cursor -= leading;
        let page = self.page_number();
        for key in self.pending_bookmarks.drain(..) {
            self.anchors.insert(key, page);
        }
        if let Some(current) = self.pages.last_mut() {
            current.lines.push(PlacedLine {
                x,
                y: self.cursor,
                segments,
            });
        }
    }

    /// Turn a TOC forward link (`#hN`) into a trailing page reference once pages are known.
    fn annotate_internal_links(&self, tokens: Vec<Token>) -> Vec<Token> {
        let Some(resolved) = self.resolved else {
            return tokens;
        };
        let mut out = Vec::with_capacity(tokens.len() + 1);
        let mut target = None;
        for token in tokens {
            if let Token::Text(run) = &token {
                if let Some(key) = run.link.as_deref().and_then(|l| l.strip_prefix('#')) {
                    target = resolved.get(key).copied();
                }
            }
            out.push(token);
        }
        if let Some(page) = target {
            out.push(Token::Text(Run {
                text: format!("  (p. {page})"),
                ..Run::default()
            }));
        }
        out
    }

    fn place_markup(&mut self, markup_text: &str, metrics: Metrics, prefix: Option<String>) {
        let tokens = self.annotate_internal_links(markup::tokenize(markup_text));
        let first_x = MARGIN + metrics.left_indent;
        let width = CONTENT_WIDTH - metrics.left_indent - metrics.right_indent;

        let mut line: Vec<Segment> = Vec::new();
        let mut line_width = 0.0;
        if let Some(prefix) = prefix {
            let font = font_for(metrics.bold, false, metrics.monospace);
            line_width = text_width(&prefix, font, metrics.size);
            line.push(Segment {
                text: prefix,
                font,
                size: metrics.size,
                colour: metrics.colour,
                link: None,
            });
        }

        for token in tokens {
            let run = match token {
                Token::LineBreak => {
                    self.place_line(first_x, metrics.leading, std::mem::take(&mut line));
                    line_width = 0.0;
                    continue;
                }
                Token::Text(run) => run,
            };
            let font = font_for(
                run.bold || metrics.bold,
                run.italic,
                run.monospace || metrics.monospace,
            );
            let colour = if run.link.is_some() {
                (0.0, 0.0, 1.0)
            } else {
                metrics.colour
            };
            // Split on spaces but keep them attached so adjacent runs join naturally.
            for word in run.text.split_inclusive(' ') {
                let w = text_width(word, font, metrics.size);
                if line_width + w > width && line_width > 0.0 {
                    self.place_line(first_x, metrics.leading, std::mem::take(&mut line));
                    line_width = 0.0;
                }
                let word = if line_width == 0.0 { word.trim_start() } else { word };
                if word.is_empty() {
                    continue;
                }
                line_width += text_width(word, font, metrics.size);
                match line.last_mut() {
                    Some(last) if last.font == font && last.colour == colour && last.link == run.link => {
                        last.text.push_str(word)
                    }
                    _ => line.push(Segment {
                        text: word.to_string(),
                        font,
                        size: metrics.size,
                        colour,
                        link: run.link.clone(),
                    }),
                }
            }
        }
        if !line.is_empty() {
            self.place_line(first_x, metrics.leading, line);
        }
    }

    fn capture_heading(&mut self, markup_text: &str, style: Style) {
        if style != Style::PageTitle {
            return;
        }
        let key = format!("h{}", self.toc.len() + 1);
        self.pending_bookmarks.push(key.clone());
        // Page is fixed up once the first line is placed.
        self.toc.push(TocEntry {
            key,
            title: markup::to_plain(markup_text),
            page: 0,
        });
    }

    fn place(&mut self, element: &DocumentElement) {
        match element {
            DocumentElement::Heading { text, style, .. } => {
                self.capture_heading(text, *style);
                self.place_markup(text, metrics(*style), None);
            }
            DocumentElement::Paragraph { markup, style } => {
                self.capture_heading(markup, *style);
                self.place_markup(markup, metrics(*style), None);
            }
            DocumentElement::ListBlock { ordered, items } => {
                let item_metrics = metrics(Style::ListItem);
                for (idx, item) in items.iter().enumerate() {
                    let bullet = if *ordered {
                        format!("{}. ", idx + 1)
                    } else {
                        "- ".to_string()
                    };
                    self.place_markup(item, item_metrics, Some(bullet));
                }
            }
            DocumentElement::Spacer(height) => self.space(*height),
            DocumentElement::PageBreak => {
                if !self.current_page_is_empty() {
                    self.new_page();
                }
            }
        }
    }

    fn finish(mut self) -> (Vec<LaidOutPage>, Vec<TocEntry>, HashMap<String, usize>) {
        for entry in &mut self.toc {
            entry.page = self.anchors.get(&entry.key).copied().unwrap_or(1);
        }
        while self.pages.len() > 1 && self.current_page_is_empty() {
            self.pages.pop();
        }
        (self.pages, self.toc, self.anchors)
    }
}

fn layout(
    elements: &[DocumentElement],
    resolved: Option<&HashMap<String, usize>>,
) -> (Vec<LaidOutPage>, Vec<TocEntry>, HashMap<String, usize>) {
    let mut layout = Layout::new(resolved);
    for element in elements {
        layout.place(element);
    }
    layout.finish()
}

/// Where a link run points: a resolved anchor page or an external URI.
fn link_action(target: &str, anchors: &HashMap<String, usize>) -> Option<Actions> {
    match target.strip_prefix('#') {
        Some(key) => anchors.get(key).map(|&page| {
            Actions::Goto(Destination::Xyz {
                page,
                left: None,
                top: None,
                zoom: None,
            })
        }),
        None if !target.trim().is_empty() => Some(Actions::Uri(target.to_string())),
        None => None,
    }
}

fn link_annotations(line: &PlacedLine, anchors: &HashMap<String, usize>) -> Vec<Op> {
    let mut ops = Vec::new();
    let mut x = line.x;
    for segment in &line.segments {
        let width = text_width(&segment.text, segment.font, segment.size);
        let action = segment
            .link
            .as_deref()
            .and_then(|target| link_action(target, anchors));
        if let Some(actions) = action {
            let rect = Rect {
                x: Pt(x),
                y: Pt(line.y - segment.size * 0.25),
                width: Pt(width),
                height: Pt(segment.size * 1.2),
            };
            ops.push(Op::LinkAnnotation {
                link: LinkAnnotation::new(rect, actions, None, None, None),
            });
        }
        x += width;
    }
    ops
}

fn page_ops(page: &LaidOutPage, anchors: &HashMap<String, usize>) -> Vec<Op> {
    let mut ops = Vec::new();
    for line in &page.lines {
        ops.push(Op::StartTextSection);
        ops.push(Op::SetTextCursor {
            pos: Point {
                x: Pt(line.x),
                y: Pt(line.y),
            },
        });
        for segment in &line.segments {
            let (r, g, b) = segment.colour;
            ops.push(Op::SetFillColor {
                col: Color::Rgb(Rgb {
                    r,
                    g,
                    b,
                    icc_profile: None,
                }),
            });
            ops.push(Op::SetFontSizeBuiltinFont {
                size: Pt(segment.size),
                font: segment.font,
            });
            ops.push(Op::WriteTextBuiltinFont {
                items: vec![TextItem::Text(segment.text.clone())],
                font: segment.font,
            });
        }
        ops.push(Op::EndTextSection);
        ops.extend(link_annotations(line, anchors));
    }
    ops
}

/// Lay out `elements` and produce PDF bytes, resolving the table of contents.
pub fn assemble(title: &str, elements: &[DocumentElement]) -> Result<AssembledDocument, RenderError> {
    if elements.is_empty() {
        return Err(RenderError::EmptyDocument);
    }
    // First pass discovers where anchors land; second pass prints their page numbers.
    let (_, _, anchors) = layout(elements, None);
    let (pages, toc, anchors) = layout(elements, Some(&anchors));
    debug!(title, pages = pages.len(), toc_entries = toc.len(), "Laid out document");

    let mut doc = PdfDocument::new(title);
    let pdf_pages = pages
        .iter()
        .map(|page| PdfPage::new(Mm(215.9), Mm(279.4), page_ops(page, &anchors)))
        .collect();
    doc.with_pages(pdf_pages);
    for entry in &toc {
        doc.add_bookmark(&entry.title, entry.page);
    }

    let mut warnings = Vec::new();
    let bytes = doc.save(&PdfSaveOptions::default(), &mut warnings);
    if !warnings.is_empty() {
        warn!(title, count = warnings.len(), "PDF writer reported warnings");
    }
    Ok(AssembledDocument {
        bytes,
        page_count: pages.len(),
        toc,
    })
}

/// [`assemble`] and write the bytes to `path`.
pub fn write_pdf(
    path: &Path,
    title: &str,
    elements: &[DocumentElement],
) -> Result<AssembledDocument, RenderError> {
    let document = assemble(title, elements)?;
    std::fs::write(path, &document.bytes)?;
    Ok(document)
}
