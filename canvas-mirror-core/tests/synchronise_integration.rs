use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::tempdir;

use canvas_mirror_core::config::{
    CanvasConfig, ExportToggles, PerformanceConfig, StorageConfig, SyncConfig,
};
use canvas_mirror_core::contract::{
    DestinationDescriptor, ListingPage, MockStorage, SourceApi,
};
use canvas_mirror_core::discovery::{available_courses, Course};
use canvas_mirror_core::error::{SourceError, StorageError};
use canvas_mirror_core::storage::LocalStore;
use canvas_mirror_core::synchronise::synchronise;

const BASE: &str = "https://lms.test";

fn api(path: &str) -> String {
    format!("{BASE}/api/v1{path}")
}

/// In-memory Canvas: JSON routes, downloadable bodies and a download log.
#[derive(Default)]
struct FakeCanvas {
    json: Mutex<HashMap<String, Value>>,
    bodies: Mutex<HashMap<String, Vec<u8>>>,
    failing: Mutex<HashSet<String>>,
    downloads: Mutex<Vec<String>>,
}

impl FakeCanvas {
    fn route(&self, url: impl Into<String>, value: Value) {
        self.json.lock().unwrap().insert(url.into(), value);
    }

    fn body(&self, url: impl Into<String>, bytes: &[u8]) {
        self.bodies.lock().unwrap().insert(url.into(), bytes.to_vec());
    }

    fn fail(&self, url: impl Into<String>) {
        self.failing.lock().unwrap().insert(url.into());
    }

    fn downloads_of(&self, url: &str) -> usize {
        self.downloads.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    fn check(&self, url: &str) -> Result<(), SourceError> {
        if self.failing.lock().unwrap().contains(url) {
            return Err(SourceError::Status {
                url: url.to_string(),
                status: 500,
                attempts: 4,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SourceApi for FakeCanvas {
    async fn fetch_page(&self, url: &str) -> Result<ListingPage, SourceError> {
        self.check(url)?;
        let items = match self.json.lock().unwrap().get(url) {
            Some(Value::Array(items)) => items.clone(),
            Some(other) => vec![other.clone()],
            None => Vec::new(),
        };
        Ok((items, None))
    }

    async fn get_json(&self, url: &str) -> Result<Value, SourceError> {
        self.check(url)?;
        self.json
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| SourceError::Status {
                url: url.to_string(),
                status: 404,
                attempts: 1,
            })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64, SourceError> {
        self.check(url)?;
        let bytes = self
            .bodies
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| SourceError::Status {
                url: url.to_string(),
                status: 404,
                attempts: 1,
            })?;
        std::fs::write(dest, &bytes)?;
        self.downloads.lock().unwrap().push(url.to_string());
        Ok(bytes.len() as u64)
    }
}

fn file_json(id: u64, name: &str, size: usize) -> Value {
    json!({
        "id": id,
        "display_name": name,
        "url": format!("{BASE}/files/{id}/download?verifier=x"),
        "size": size,
        "updated_at": "2024-01-01T00:00:00Z"
    })
}

fn add_file(canvas: &FakeCanvas, id: u64, name: &str, bytes: &[u8]) {
    canvas.route(api(&format!("/files/{id}")), file_json(id, name, bytes.len()));
    canvas.route(
        api(&format!("/courses/1/files/{id}")),
        file_json(id, name, bytes.len()),
    );
    canvas.body(format!("{BASE}/files/{id}/download?verifier=x"), bytes);
}

fn essay(updated_at: &str) -> Value {
    json!([{
        "id": 100,
        "name": "Essay",
        "description": "<p>See the <a href=\"/courses/1/files/10/download\">brief</a>.</p>",
        "due_at": "2024-05-01T00:00:00Z",
        "points_possible": 10,
        "rubric": [{
            "description": "Argument",
            "points": 10,
            "ratings": [{"description": "Strong", "points": 10}]
        }],
        "updated_at": updated_at
    }])
}

/// Course "Bio" (id 1): one assignment, one module with two files and a page,
/// a direct page listing and announcements.
fn bio_course() -> FakeCanvas {
    let canvas = FakeCanvas::default();
    canvas.route(
        api("/courses/1/assignments?include[]=rubric"),
        essay("2024-01-01T00:00:00Z"),
    );
    add_file(&canvas, 10, "brief.pdf", b"hello");
    add_file(&canvas, 11, "notes.txt", b"abc");
    add_file(&canvas, 12, "reading.txt", b"xyz");

    canvas.route(api("/courses/1/modules"), json!([{"id": 7, "name": "Week 1"}]));
    canvas.route(
        api("/courses/1/modules/7/items"),
        json!([
            {"id": 1, "type": "File", "content_id": 10, "url": api("/courses/1/files/10")},
            {"id": 2, "type": "Page", "page_url": "intro", "url": api("/courses/1/pages/intro")},
            {"id": 3, "type": "File", "content_id": 11, "url": api("/courses/1/files/11")},
            {"id": 4, "type": "SubHeader", "title": "Readings"}
        ]),
    );
    canvas.route(
        api("/courses/1/pages/intro"),
        json!({
            "page_id": 5,
            "url": "intro",
            "title": "Intro",
            "body": "<p>Welcome. <a href=\"/courses/1/files/12\">reading</a></p>",
            "updated_at": "2024-01-01T00:00:00Z",
            "html_url": format!("{BASE}/courses/1/pages/intro")
        }),
    );
    canvas.route(
        api("/courses/1/pages?include[]=body"),
        json!([
            {"page_id": 5, "url": "intro", "title": "Intro", "body": "<p>direct</p>", "updated_at": "2024-01-01T00:00:00Z"},
            {"page_id": 6, "url": "syllabus", "title": "Syllabus", "body": "<h2>Plan</h2><ul><li>a</li><li>b</li></ul>", "updated_at": "2024-01-03T00:00:00Z"}
        ]),
    );
    canvas.route(
        api("/announcements?context_codes[]=course_1"),
        json!([{"id": 1, "title": "Hi", "posted_at": "2024-01-02T00:00:00Z"}]),
    );
    canvas
}

fn config(root: &Path) -> SyncConfig {
    SyncConfig {
        canvas: CanvasConfig {
            api_url: format!("{BASE}/"),
            api_key: "key".into(),
        },
        storage: StorageConfig::Local {
            root_dir: root.to_path_buf(),
        },
        export: ExportToggles {
            announcements: true,
            ..ExportToggles::content_only()
        },
        performance: PerformanceConfig::default(),
        force_regenerate: false,
    }
}

fn courses() -> Vec<Course> {
    available_courses(vec![json!({"id": 1, "name": "Bio"})])
}

#[tokio::test]
async fn first_run_creates_the_expected_layout() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    let store = LocalStore::new(&root).unwrap();

    let report = synchronise(&config(&root), &canvas, &store, &courses())
        .await
        .expect("run completes");

    assert_eq!(report.total_failed(), 0);
    for path in [
        "Bio/Assignments/Essay/Essay.pdf",
        "Bio/Assignments/Essay/brief.pdf",
        "Bio/notes.txt",
        "Bio/Intro/Intro.pdf",
        "Bio/Intro/reading.txt",
        "Bio/Pages/All Pages.pdf",
        "Bio/Reports/announcements.json",
    ] {
        assert!(root.join(path).is_file(), "missing {path}");
    }
    assert_eq!(report.summary.total(), 7);
    assert_eq!(
        report.summary.entries("Bio", "Bio/Pages")[0].action,
        "created"
    );
    let pdf = std::fs::read(root.join("Bio/Pages/All Pages.pdf")).unwrap();
    assert!(pdf.starts_with(b"%PDF"));
}

#[tokio::test]
async fn second_run_against_unchanged_source_writes_nothing() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    let store = LocalStore::new(&root).unwrap();
    let config = config(&root);

    let first = synchronise(&config, &canvas, &store, &courses()).await.unwrap();
    assert!(first.summary.has_changes());

    let second = synchronise(&config, &canvas, &store, &courses()).await.unwrap();
    assert!(!second.summary.has_changes(), "{}", second.summary);
    assert_eq!(second.total_failed(), 0);
    assert_eq!(second.courses[0].written, 0);
    assert!(second.courses[0].skipped >= 7);
}

#[tokio::test]
async fn file_linked_from_assignment_and_module_is_processed_once() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    let store = LocalStore::new(&root).unwrap();

    synchronise(&config(&root), &canvas, &store, &courses())
        .await
        .unwrap();

    assert_eq!(canvas.downloads_of(&format!("{BASE}/files/10/download?verifier=x")), 1);
    // The assignment reached it first, so the module item is a no-op.
    assert!(root.join("Bio/Assignments/Essay/brief.pdf").is_file());
    assert!(!root.join("Bio/brief.pdf").exists());
}

#[tokio::test]
async fn file_reachable_from_module_and_page_body_is_upserted_once() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    // The page now links the same file the module lists directly.
    canvas.route(
        api("/courses/1/pages/intro"),
        json!({
            "page_id": 5,
            "url": "intro",
            "title": "Intro",
            "body": "<p><a href=\"/courses/1/files/11\">notes</a></p>",
            "updated_at": "2024-01-01T00:00:00Z"
        }),
    );
    let mut config = config(&root);
    config.export.assignments = false;
    let store = LocalStore::new(&root).unwrap();

    let report = synchronise(&config, &canvas, &store, &courses()).await.unwrap();

    assert_eq!(canvas.downloads_of(&format!("{BASE}/files/11/download?verifier=x")), 1);
    let notes_entries: usize = report
        .summary
        .labels("Bio")
        .iter()
        .map(|label| {
            report
                .summary
                .entries("Bio", label)
                .iter()
                .filter(|e| e.filename == "notes.txt")
                .count()
        })
        .sum();
    assert_eq!(notes_entries, 1);
}

#[tokio::test]
async fn only_the_updated_assignment_is_reported() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    let store = LocalStore::new(&root).unwrap();
    let config = config(&root);

    synchronise(&config, &canvas, &store, &courses()).await.unwrap();

    canvas.route(
        api("/courses/1/assignments?include[]=rubric"),
        essay("2999-01-01T00:00:00Z"),
    );
    let report = synchronise(&config, &canvas, &store, &courses()).await.unwrap();

    assert_eq!(report.summary.labels("Bio"), vec!["Bio/Assignments/Essay"]);
    let entries = report.summary.entries("Bio", "Bio/Assignments/Essay");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].filename, "Essay.pdf");
    assert_eq!(entries[0].action, "updated");
    assert!(report.summary.entries("Bio", "Bio").is_empty());
}

#[tokio::test]
async fn force_regenerate_rewrites_documents_but_not_files() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    let store = LocalStore::new(&root).unwrap();
    let mut config = config(&root);

    synchronise(&config, &canvas, &store, &courses()).await.unwrap();
    config.force_regenerate = true;
    let report = synchronise(&config, &canvas, &store, &courses()).await.unwrap();

    let labels = report.summary.labels("Bio");
    assert!(labels.contains(&"Bio/Assignments/Essay"));
    assert!(labels.contains(&"Bio/Intro"));
    assert!(labels.contains(&"Bio/Pages"));
    assert!(!labels.contains(&"Bio"));
    assert!(!labels.contains(&"Bio/Reports"));
    for label in labels {
        for entry in report.summary.entries("Bio", label) {
            assert!(entry.filename.ends_with(".pdf"), "{}", entry.filename);
            assert_eq!(entry.action, "updated");
        }
    }
}

#[tokio::test]
async fn failing_resources_do_not_abort_the_course() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    canvas.fail(api("/courses/1/pages/intro"));
    canvas.fail(format!("{BASE}/files/10/download?verifier=x"));
    let store = LocalStore::new(&root).unwrap();

    let report = synchronise(&config(&root), &canvas, &store, &courses())
        .await
        .unwrap();

    assert_eq!(report.total_failed(), 2);
    assert!(root.join("Bio/Assignments/Essay/Essay.pdf").is_file());
    assert!(!root.join("Bio/Assignments/Essay/brief.pdf").exists());
    assert!(root.join("Bio/notes.txt").is_file());
    assert!(root.join("Bio/Pages/All Pages.pdf").is_file());
}

#[tokio::test]
async fn conversations_are_exported_globally() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = bio_course();
    canvas.route(
        api("/conversations"),
        json!([{"id": 9, "subject": "Question", "last_message_at": "2024-02-01T00:00:00Z"}]),
    );
    let mut config = config(&root);
    config.export = ExportToggles {
        conversations: true,
        ..ExportToggles::content_only()
    };
    config.export.assignments = false;
    config.export.modules = false;
    config.export.pages = false;
    let store = LocalStore::new(&root).unwrap();

    let report = synchronise(&config, &canvas, &store, &courses()).await.unwrap();

    let written = std::fs::read_to_string(root.join("Conversations/conversations.json")).unwrap();
    let parsed: Value = serde_json::from_str(&written).unwrap();
    assert_eq!(parsed[0]["subject"], "Question");
    assert_eq!(
        report.summary.entries("Conversations", "Conversations")[0].filename,
        "conversations.json"
    );
}

#[tokio::test]
async fn failed_upserts_leave_no_summary_entry_and_no_staged_artifact() {
    let canvas = FakeCanvas::default();
    canvas.route(
        api("/courses/1/assignments?include[]=rubric"),
        json!([
            {"id": 1, "name": "Essay", "updated_at": "2024-01-01T00:00:00Z"},
            {"id": 2, "name": "Quiz", "updated_at": "2024-01-01T00:00:00Z"}
        ]),
    );

    let staged: Arc<Mutex<Vec<PathBuf>>> = Arc::new(Mutex::new(Vec::new()));
    let mut storage = MockStorage::new();
    storage
        .expect_top()
        .returning(|| DestinationDescriptor::remote("root", ""));
    storage.expect_ensure_folder().returning(|parent, name| {
        Ok(DestinationDescriptor::remote(
            format!("id-{name}"),
            parent.child_label(name),
        ))
    });
    storage.expect_find_existing().returning(|_, _| Ok(None));
    let seen = staged.clone();
    storage
        .expect_upsert()
        .times(2)
        .returning(move |_, filename, path, existing_id| {
            assert!(existing_id.is_none());
            assert!(path.is_file(), "artifact must exist during upsert");
            seen.lock().unwrap().push(path.to_path_buf());
            if filename == "Essay.pdf" {
                Err(StorageError::Api {
                    status_code: 403,
                    message: "forbidden".into(),
                })
            } else {
                Ok(false)
            }
        });

    let mut config = config(Path::new("/unused"));
    config.export = ExportToggles::content_only();
    config.export.modules = false;
    config.export.pages = false;

    let report = synchronise(&config, &canvas, &storage, &courses())
        .await
        .unwrap();

    assert!(!report.summary.has_changes());
    assert_eq!(report.courses[0].failed, 2);
    assert_eq!(report.courses[0].written, 0);
    let staged = staged.lock().unwrap();
    assert_eq!(staged.len(), 2);
    for path in staged.iter() {
        assert!(!path.exists(), "staged artifact {} left behind", path.display());
    }
}

#[tokio::test]
async fn unprintable_assignment_names_use_the_assignment_id() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("mirror");
    let canvas = FakeCanvas::default();
    canvas.route(
        api("/courses/1/assignments?include[]=rubric"),
        json!([{"id": 42, "name": "???", "updated_at": "2024-01-01T00:00:00Z"}]),
    );
    let mut config = config(&root);
    config.export = ExportToggles::content_only();
    let store = LocalStore::new(&root).unwrap();

    let report = synchronise(&config, &canvas, &store, &courses()).await.unwrap();

    assert!(root.join("Bio/Assignments/assignment-42/assignment-42.pdf").is_file());
    assert!(!root.join("Bio/Assignments/.pdf").exists());
    assert_eq!(
        report.summary.entries("Bio", "Bio/Assignments/assignment-42")[0].filename,
        "assignment-42.pdf"
    );
}
