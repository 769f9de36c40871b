//! Builds the element sequences for every derived artifact before assembly.
//!
//! - assignment documents (header fields, rubric, rendered description)
//! - single page documents
//! - the combined "All Pages" document with its table of contents
//! - JSON exports of auxiliary records

use serde_json::Value;

use crate::discovery::{Assignment, CanvasPage};
use crate::error::RenderError;
use crate::markup::{self, escape};
use crate::render::{self, DocumentElement, Style};

const SEPARATOR: &str = "________________________________________________________________";

fn spacer(height: f32) -> DocumentElement {
    DocumentElement::Spacer(height)
}

fn value_text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Rendered HTML in italics, falling back to the stripped text when rendering yields nothing.
fn italic_html(html: &str) -> Vec<DocumentElement> {
    let elements = render::render(&format!("<i>{html}</i>"));
    if !elements.is_empty() {
        return elements;
    }
    let plain = render::plain_text(html);
    if plain.is_empty() {
        Vec::new()
    } else {
        vec![DocumentElement::paragraph(format!("<i>{}</i>", escape(&plain)))]
    }
}

/// Distinct, non-blank extra description worth showing under a label.
fn extra_description<'a>(candidate: Option<&'a str>, label: &str) -> Option<&'a str> {
    candidate.filter(|d| !d.trim().is_empty() && *d != label)
}

/// Rubric criteria and their ratings.
///
/// Anything other than a list of criteria is an error; the caller turns it
/// into an inline note instead of failing the document.
pub fn rubric_elements(rubric: &Value) -> Result<Vec<DocumentElement>, String> {
    let criteria = rubric
        .as_array()
        .ok_or_else(|| format!("expected a list of criteria, found {}", json_kind(rubric)))?;
    let mut out = Vec::new();
    for criterion in criteria.iter().filter_map(Value::as_object) {
        let description = criterion
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        let points = value_text(criterion.get("points")).unwrap_or_else(|| "0".into());
        if !description.is_empty() {
            out.push(DocumentElement::paragraph(format!(
                "<b>{}</b> ({} points)",
                escape(description),
                escape(&points)
            )));
            let long = criterion.get("long_description").and_then(Value::as_str);
            if let Some(long) = extra_description(long, description) {
                out.extend(italic_html(long));
            }
            out.push(spacer(3.0));
        }
        let ratings = criterion.get("ratings").and_then(Value::as_array);
        for rating in ratings.into_iter().flatten().filter_map(Value::as_object) {
            let label = rating.get("description").and_then(Value::as_str).unwrap_or("");
            if label.is_empty() {
                continue;
            }
            let points = value_text(rating.get("points")).unwrap_or_else(|| "0".into());
            out.push(DocumentElement::paragraph(format!(
                "  \u{2022} {} ({} points)",
                escape(label),
                escape(&points)
            )));
            let long = rating.get("long_description").and_then(Value::as_str);
            let small = rating.get("small_description").and_then(Value::as_str);
            if let Some(extra) =
                extra_description(long, label).or_else(|| extra_description(small, label))
            {
                out.extend(italic_html(extra));
                out.push(spacer(2.0));
            }
        }
        out.push(spacer(6.0));
    }
    Ok(out)
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "an object",
    }
}

fn has_rubric(rubric: Option<&Value>) -> bool {
    match rubric {
        None | Some(Value::Null) => false,
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(map)) => !map.is_empty(),
        Some(_) => true,
    }
}

/// Title, due date, points, rubric, separator and rendered description.
pub fn assignment_document(assignment: &Assignment) -> Vec<DocumentElement> {
    let name = assignment.name.as_deref().unwrap_or("Untitled Assignment");
    let mut out = vec![DocumentElement::styled(escape(name), Style::Title), spacer(12.0)];

    let due = assignment.due_at.as_deref().filter(|d| !d.is_empty());
    out.push(DocumentElement::paragraph(format!(
        "<b>Due:</b> {}",
        due.map(escape).unwrap_or_else(|| "N/A".into())
    )));
    out.push(spacer(6.0));
    let points = assignment
        .points_possible
        .filter(|p| *p != 0.0)
        .map(|p| p.to_string());
    out.push(DocumentElement::paragraph(format!(
        "<b>Points:</b> {}",
        points.as_deref().map(escape).unwrap_or_else(|| "N/A".into())
    )));
    out.push(spacer(12.0));

    if has_rubric(assignment.rubric.as_ref()) {
        out.push(DocumentElement::paragraph("<b>Rubric:</b>"));
        out.push(spacer(6.0));
        match assignment.rubric.as_ref().map(rubric_elements) {
            Some(Ok(elements)) => out.extend(elements),
            Some(Err(message)) => out.push(DocumentElement::paragraph(format!(
                "<i>Error processing rubric: {}</i>",
                escape(&message)
            ))),
            None => {}
        }
        out.push(spacer(12.0));
    }

    out.push(DocumentElement::paragraph(SEPARATOR));
    out.push(spacer(12.0));
    if let Some(description) = assignment.description.as_deref() {
        out.extend(render::render(description));
    }
    out
}

fn canvas_link(url: &str) -> DocumentElement {
    DocumentElement::styled(markup::link(url, "View on Canvas"), Style::Link)
}

/// A single page: title, optional link back to Canvas, rendered body.
pub fn page_document(title: &str, link: Option<&str>, body: &str) -> Vec<DocumentElement> {
    let mut out = vec![DocumentElement::styled(escape(title), Style::Title), spacer(12.0)];
    if let Some(url) = link {
        out.push(canvas_link(url));
        out.push(spacer(6.0));
    }
    out.extend(render::render_or_plain(body, Style::Body));
    out
}

/// Every page of a course in one document.
///
/// The table of contents links to `#h1`, `#h2`, ... in page order; assembly
/// assigns those keys to the page titles as it places them.
pub fn combined_pages_document(
    course_name: &str,
    pages: &[(CanvasPage, Option<String>)],
) -> Vec<DocumentElement> {
    let mut out = vec![
        DocumentElement::styled(escape(&format!("{course_name} \u{2014} Pages")), Style::Title),
        spacer(12.0),
        DocumentElement::styled("Table of Contents", Style::Heading(2)),
        spacer(4.0),
    ];
    for (idx, (page, _)) in pages.iter().enumerate() {
        out.push(DocumentElement::styled(
            markup::link(&format!("#h{}", idx + 1), &escape(page.display_title())),
            Style::Link,
        ));
    }
    out.push(DocumentElement::PageBreak);

    for (idx, (page, link)) in pages.iter().enumerate() {
        out.push(DocumentElement::styled(escape(page.display_title()), Style::PageTitle));
        out.push(spacer(6.0));
        if let Some(url) = link {
            out.push(canvas_link(url));
        }
        if let Some(body) = page.body.as_deref() {
            out.extend(render::render_or_plain(body, Style::Body));
        }
        if idx + 1 < pages.len() {
            out.push(DocumentElement::PageBreak);
        }
    }
    out
}

/// Pretty-printed JSON bytes for an auxiliary export.
pub fn json_report(payload: &Value) -> Result<Vec<u8>, RenderError> {
    let mut bytes = serde_json::to_vec_pretty(payload)?;
    bytes.push(b'\n');
    Ok(bytes)
}
