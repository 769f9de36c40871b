//! Resource discovery over the Canvas course structure, page merging and file dedup.
//!
//! Listings come back as raw JSON and are decoded leniently into the types
//! below: an entry that fails to decode is logged and dropped rather than
//! failing the whole listing.

use regex::Regex;
use scraper::{Html, Selector};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use tracing::{debug, warn};
use url::Url;

use crate::change;
use crate::config::ExportToggles;
use crate::contract::{RecordKind, SourceRecord};

#[derive(Debug, Clone, Deserialize)]
pub struct Course {
    pub id: Option<u64>,
    pub name: Option<String>,
    #[serde(default)]
    pub course_code: Option<String>,
    #[serde(default)]
    pub access_restricted_by_date: bool,
}

impl Course {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unnamed")
    }
}

/// Courses that can be synced: those with an id and not restricted by date.
pub fn available_courses(raw: Vec<Value>) -> Vec<Course> {
    decode_all::<Course>(raw, "course")
        .into_iter()
        .filter(|c| c.id.is_some() && !c.access_restricted_by_date)
        .collect()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Assignment {
    pub id: u64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub due_at: Option<String>,
    pub points_possible: Option<f64>,
    /// Kept raw: malformed rubric data is reported inside the document instead of rejected here.
    pub rubric: Option<Value>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CanvasFile {
    pub id: u64,
    pub display_name: Option<String>,
    pub url: Option<String>,
    pub size: Option<u64>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CanvasPage {
    #[serde(default)]
    pub page_id: Option<u64>,
    pub title: Option<String>,
    pub body: Option<String>,
    pub updated_at: Option<String>,
    pub html_url: Option<String>,
    /// The page slug.
    pub url: Option<String>,
    #[serde(default)]
    pub page_url: Option<String>,
}

impl CanvasPage {
    /// Merge key: slug, then alternate slug, then title.
    pub fn merge_key(&self) -> Option<&str> {
        [&self.url, &self.page_url, &self.title]
            .into_iter()
            .find_map(|v| v.as_deref().filter(|s| !s.is_empty()))
    }

    pub fn display_title(&self) -> &str {
        self.title
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or("Untitled Page")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Module {
    pub id: u64,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ModuleItem {
    pub id: u64,
    #[serde(rename = "type")]
    pub kind: String,
    pub title: Option<String>,
    /// API URL of the referenced resource.
    pub url: Option<String>,
    pub page_url: Option<String>,
    pub content_id: Option<u64>,
}

/// Decode every value as `T`, dropping and logging entries that do not fit.
pub fn decode_all<T: DeserializeOwned>(raw: Vec<Value>, what: &str) -> Vec<T> {
    raw.into_iter()
        .filter_map(|value| match serde_json::from_value::<T>(value) {
            Ok(item) => Some(item),
            Err(e) => {
                warn!(what, error = %e, "Skipping undecodable record");
                None
            }
        })
        .collect()
}

impl From<&CanvasFile> for SourceRecord {
    fn from(file: &CanvasFile) -> Self {
        SourceRecord {
            id: file.id.to_string(),
            kind: RecordKind::File,
            title: file.display_name.clone().unwrap_or_default(),
            body: None,
            size: file.size,
            updated_at: file.updated_at.clone(),
        }
    }
}

impl From<&Assignment> for SourceRecord {
    fn from(assignment: &Assignment) -> Self {
        SourceRecord {
            id: assignment.id.to_string(),
            kind: RecordKind::Assignment,
            title: assignment.name.clone().unwrap_or_default(),
            body: assignment.description.clone(),
            size: None,
            updated_at: assignment.updated_at.clone(),
        }
    }
}

impl From<&CanvasPage> for SourceRecord {
    fn from(page: &CanvasPage) -> Self {
        SourceRecord {
            id: page
                .page_id
                .map(|id| id.to_string())
                .or_else(|| page.merge_key().map(str::to_string))
                .unwrap_or_default(),
            kind: RecordKind::Page,
            title: page.display_title().to_string(),
            body: page.body.clone(),
            size: None,
            updated_at: page.updated_at.clone(),
        }
    }
}

/// Auxiliary export payload as records of `kind`. A single object counts as one record.
///
/// Each record's `updated_at` is the latest of its known timestamp fields.
pub fn auxiliary_records(kind: RecordKind, payload: &Value) -> Vec<SourceRecord> {
    let records: &[Value] = match payload {
        Value::Array(items) => items,
        other => std::slice::from_ref(other),
    };
    records
        .iter()
        .filter(|record| record.is_object())
        .map(|record| {
            let text = |key: &str| record.get(key).and_then(Value::as_str).map(str::to_string);
            SourceRecord {
                id: match record.get("id") {
                    Some(Value::String(id)) => id.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
                kind,
                title: text("title")
                    .or_else(|| text("name"))
                    .or_else(|| text("subject"))
                    .unwrap_or_default(),
                body: None,
                size: None,
                updated_at: change::latest_record_timestamp(std::slice::from_ref(record))
                    .map(|t| t.to_rfc3339()),
            }
        })
        .collect()
}

/// Merge pages found by the direct listing and via modules.
///
/// Keyed by [`CanvasPage::merge_key`]; a direct-listing entry always wins over
/// a module entry with the same key. The result is ordered by lower-cased title.
pub fn merge_pages(direct: Vec<CanvasPage>, via_modules: Vec<CanvasPage>) -> Vec<CanvasPage> {
    let mut merged: HashMap<String, CanvasPage> = HashMap::new();
    for page in direct {
        if let Some(key) = page.merge_key().map(str::to_string) {
            merged.entry(key).or_insert(page);
        }
    }
    for page in via_modules {
        if let Some(key) = page.merge_key().map(str::to_string) {
            merged.entry(key).or_insert(page);
        }
    }
    let mut pages: Vec<CanvasPage> = merged.into_values().collect();
    pages.sort_by(|a, b| {
        let ka = a.title.as_deref().unwrap_or("").to_lowercase();
        let kb = b.title.as_deref().unwrap_or("").to_lowercase();
        ka.cmp(&kb).then_with(|| a.merge_key().cmp(&b.merge_key()))
    });
    pages
}

fn file_reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"/files/(\d+)").expect("static regex is valid"))
}

fn anchor_selector() -> &'static Selector {
    static SELECTOR: OnceLock<Selector> = OnceLock::new();
    SELECTOR.get_or_init(|| Selector::parse("a[href]").expect("static selector is valid"))
}

/// File ids referenced by anchors in `html`, in document order, without repeats.
pub fn embedded_file_ids(html: &str) -> Vec<u64> {
    let document = Html::parse_fragment(html);
    let mut seen = HashSet::new();
    document
        .select(anchor_selector())
        .filter_map(|a| a.value().attr("href"))
        .filter_map(|href| file_reference_pattern().captures(href))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u64>().ok())
        .filter(|id| seen.insert(*id))
        .collect()
}

/// Per-course traversal state: which file ids have already been handled this run.
#[derive(Debug)]
pub struct TraversalContext {
    pub course_id: u64,
    pub course_name: String,
    processed: HashSet<u64>,
}

impl TraversalContext {
    pub fn new(course_id: u64, course_name: impl Into<String>) -> Self {
        Self {
            course_id,
            course_name: course_name.into(),
            processed: HashSet::new(),
        }
    }

    /// Marks `file_id` as processed; true only the first time it is seen.
    pub fn first_visit(&mut self, file_id: u64) -> bool {
        let first = self.processed.insert(file_id);
        if !first {
            debug!(course = %self.course_name, file_id, "File already processed this run");
        }
        first
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

/// Per-course auxiliary record sets exported as JSON reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxiliaryResource {
    Announcements,
    Discussions,
    Quizzes,
    Enrollments,
    Calendar,
    Groups,
    Analytics,
    Submissions,
}

impl AuxiliaryResource {
    pub const ALL: [AuxiliaryResource; 8] = [
        AuxiliaryResource::Announcements,
        AuxiliaryResource::Discussions,
        AuxiliaryResource::Quizzes,
        AuxiliaryResource::Enrollments,
        AuxiliaryResource::Calendar,
        AuxiliaryResource::Groups,
        AuxiliaryResource::Analytics,
        AuxiliaryResource::Submissions,
    ];

    pub fn name(self) -> &'static str {
        match self {
            AuxiliaryResource::Announcements => "announcements",
            AuxiliaryResource::Discussions => "discussions",
            AuxiliaryResource::Quizzes => "quizzes",
            AuxiliaryResource::Enrollments => "enrollments",
            AuxiliaryResource::Calendar => "calendar",
            AuxiliaryResource::Groups => "groups",
            AuxiliaryResource::Analytics => "analytics",
            AuxiliaryResource::Submissions => "submissions",
        }
    }

    pub fn filename(self) -> String {
        format!("{}.json", self.name())
    }

    pub fn kind(self) -> RecordKind {
        match self {
            AuxiliaryResource::Announcements => RecordKind::Announcement,
            AuxiliaryResource::Discussions => RecordKind::Discussion,
            AuxiliaryResource::Quizzes => RecordKind::Quiz,
            AuxiliaryResource::Enrollments => RecordKind::Enrollment,
            AuxiliaryResource::Calendar => RecordKind::CalendarEvent,
            AuxiliaryResource::Groups => RecordKind::Group,
            AuxiliaryResource::Analytics => RecordKind::AnalyticsEvent,
            AuxiliaryResource::Submissions => RecordKind::Submission,
        }
    }

    /// Analytics is a single document; everything else is a paginated listing.
    pub fn is_listing(self) -> bool {
        !matches!(self, AuxiliaryResource::Analytics)
    }

    pub fn enabled(self, toggles: &ExportToggles) -> bool {
        match self {
            AuxiliaryResource::Announcements => toggles.announcements,
            AuxiliaryResource::Discussions => toggles.discussions,
            AuxiliaryResource::Quizzes => toggles.quizzes,
            AuxiliaryResource::Enrollments => toggles.enrollments,
            AuxiliaryResource::Calendar => toggles.calendar,
            AuxiliaryResource::Groups => toggles.groups,
            AuxiliaryResource::Analytics => toggles.analytics,
            AuxiliaryResource::Submissions => toggles.submissions,
        }
    }
}

/// URL builders for every endpoint the engine reads.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Self {
        Self {
            base: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn api(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    pub fn courses(&self) -> String {
        self.api("/courses")
    }

    pub fn assignments(&self, course_id: u64) -> String {
        self.api(&format!("/courses/{course_id}/assignments?include[]=rubric"))
    }

    pub fn modules(&self, course_id: u64) -> String {
        self.api(&format!("/courses/{course_id}/modules"))
    }

    pub fn module_items(&self, course_id: u64, module_id: u64) -> String {
        self.api(&format!("/courses/{course_id}/modules/{module_id}/items"))
    }

    pub fn pages(&self, course_id: u64) -> String {
        self.api(&format!("/courses/{course_id}/pages?include[]=body"))
    }

    pub fn file(&self, file_id: u64) -> String {
        self.api(&format!("/files/{file_id}"))
    }

    pub fn conversations(&self) -> String {
        self.api("/conversations")
    }

    pub fn auxiliary(&self, resource: AuxiliaryResource, course_id: u64) -> String {
        match resource {
            AuxiliaryResource::Announcements => {
                self.api(&format!("/announcements?context_codes[]=course_{course_id}"))
            }
            AuxiliaryResource::Discussions => {
                self.api(&format!("/courses/{course_id}/discussion_topics"))
            }
            AuxiliaryResource::Quizzes => self.api(&format!("/courses/{course_id}/quizzes")),
            AuxiliaryResource::Enrollments => {
                self.api(&format!("/courses/{course_id}/enrollments"))
            }
            AuxiliaryResource::Calendar => self.api(&format!(
                "/calendar_events?context_codes[]=course_{course_id}&all_events=true"
            )),
            AuxiliaryResource::Groups => self.api(&format!("/courses/{course_id}/groups")),
            AuxiliaryResource::Analytics => {
                self.api(&format!("/courses/{course_id}/analytics/activity"))
            }
            AuxiliaryResource::Submissions => self.api(&format!(
                "/courses/{course_id}/students/submissions?student_ids[]=self"
            )),
        }
    }

    /// Browser link to a page: its `html_url`, else built from the site origin and slug.
    pub fn page_link(&self, course_id: u64, page: &CanvasPage) -> Option<String> {
        if let Some(url) = page.html_url.as_deref().filter(|u| !u.is_empty()) {
            return Some(url.to_string());
        }
        let slug = page.url.as_deref().filter(|s| !s.is_empty())?;
        let base = Url::parse(&self.base).ok()?;
        base.join(&format!("/courses/{course_id}/pages/{slug}"))
            .ok()
            .map(String::from)
    }
}
