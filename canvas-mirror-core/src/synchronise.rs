//! Course synchronisation: discover → detect → render/download → upsert → summarise.
//!
//! For each selected course the orchestrator walks, in order:
//!   - assignments (one PDF per assignment plus files linked from the description)
//!   - module items (files into the course folder, pages as PDFs plus their linked files)
//!   - all pages merged into `Pages/All Pages.pdf` with a table of contents
//!   - auxiliary record exports under `Reports/`
//!
//! and finally the global `Conversations/conversations.json`.
//!
//! Every resource is processed inside its own error boundary: a failure is
//! logged and counted, and the loop moves on to the next resource. Artifacts
//! are staged as temporary files in one scratch directory per run and are
//! removed as soon as their upsert attempt finishes, whatever the outcome.

use serde::de::DeserializeOwned;
use serde_json::Value;
use tempfile::{NamedTempFile, TempDir};
use tracing::{debug, error, info, warn};

use crate::change::{self, ChangeDecision};
use crate::config::SyncConfig;
use crate::contract::{
    DestinationDescriptor, DestinationMetadata, RecordKind, SourceApi, SourceRecord, Storage,
};
use crate::discovery::{
    self, Assignment, AuxiliaryResource, CanvasFile, CanvasPage, Course, Endpoints, Module,
    ModuleItem, TraversalContext,
};
use crate::download::collect_all;
use crate::error::{SourceError, StorageError, SyncError};
use crate::pdf;
use crate::preprocess;
use crate::storage::sanitize_filename;
use crate::summary::SummaryRecord;

pub const ASSIGNMENTS_FOLDER: &str = "Assignments";
pub const PAGES_FOLDER: &str = "Pages";
pub const REPORTS_FOLDER: &str = "Reports";
pub const CONVERSATIONS_FOLDER: &str = "Conversations";
pub const COMBINED_PAGES_FILENAME: &str = "All Pages.pdf";
pub const CONVERSATIONS_FILENAME: &str = "conversations.json";

/// Counters for one course (or the global conversations export).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseReport {
    pub course_id: Option<u64>,
    pub course_name: String,
    pub written: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// What a run did.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub summary: SummaryRecord,
    pub courses: Vec<CourseReport>,
}

impl SyncReport {
    pub fn total_failed(&self) -> usize {
        self.courses.iter().map(|c| c.failed).sum()
    }
}

fn decode<T: DeserializeOwned>(url: &str, value: Value) -> Result<T, SourceError> {
    serde_json::from_value(value).map_err(|e| SourceError::Decode {
        url: url.to_string(),
        message: e.to_string(),
    })
}

/// Sanitised `name`, or `{prefix}-{id}` when nothing usable survives sanitising.
fn safe_name(name: &str, prefix: &str, id: &str) -> String {
    let safe = sanitize_filename(name);
    if safe.is_empty() {
        sanitize_filename(&format!("{prefix}-{id}"))
    } else {
        safe
    }
}

struct Run<'a, A: ?Sized, S: ?Sized> {
    api: &'a A,
    storage: &'a S,
    config: &'a SyncConfig,
    endpoints: Endpoints,
    scratch: TempDir,
    summary: SummaryRecord,
    report: CourseReport,
}

impl<'a, A, S> Run<'a, A, S>
where
    A: SourceApi + ?Sized,
    S: Storage + ?Sized,
{
    fn scratch_file(&self) -> Result<NamedTempFile, SyncError> {
        NamedTempFile::new_in(self.scratch.path())
            .map_err(|e| SyncError::Storage(StorageError::Io(e)))
    }

    /// Log and count a failed resource; the caller continues with the next one.
    fn contain(&mut self, what: &str, result: Result<(), SyncError>) {
        if let Err(e) = result {
            self.report.failed += 1;
            warn!(course = %self.report.course_name, resource = what, error = %e, "[SYNC] Resource failed, continuing");
        }
    }

    async fn decide_existing(
        &self,
        folder: &DestinationDescriptor,
        filename: &str,
    ) -> Result<Option<DestinationMetadata>, SyncError> {
        Ok(self.storage.find_existing(folder, filename).await?)
    }

    /// Upsert a staged artifact and record it. The artifact is deleted when this returns.
    async fn publish(
        &mut self,
        folder: &DestinationDescriptor,
        filename: &str,
        existing: Option<DestinationMetadata>,
        decision: ChangeDecision,
        artifact: NamedTempFile,
    ) -> Result<(), SyncError> {
        let existing_id = existing.and_then(|m| m.backend_id);
        let outcome = self
            .storage
            .upsert(folder, filename, artifact.path(), existing_id)
            .await;
        drop(artifact);
        match outcome {
            Ok(true) => {
                info!(
                    course = %self.report.course_name,
                    label = %folder.label,
                    filename,
                    action = decision.action(),
                    "[SYNC] Artifact written"
                );
                self.summary
                    .add(&self.report.course_name, &folder.label, filename, decision.action());
                self.report.written += 1;
                Ok(())
            }
            Ok(false) => Err(SyncError::UpsertRejected {
                filename: filename.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn skip(&mut self, folder: &DestinationDescriptor, filename: &str) {
        debug!(label = %folder.label, filename, "[SYNC] Unchanged, skipping");
        self.report.skipped += 1;
    }

    /// Download a Canvas file into `folder` if it is new or changed.
    async fn store_file(&mut self, folder: &DestinationDescriptor, file: &CanvasFile) -> Result<(), SyncError> {
        let (Some(name), Some(url)) = (file.display_name.as_deref(), file.url.as_deref()) else {
            debug!(file_id = file.id, "[SYNC] File has no name or download URL");
            return Ok(());
        };
        let filename = sanitize_filename(name);
        if filename.is_empty() {
            return Ok(());
        }
        let record = SourceRecord::from(file);
        let existing = self.decide_existing(folder, &filename).await?;
        let decision = change::decide(existing.as_ref(), record.size, record.updated_at.as_deref());
        if !decision.needs_write() {
            self.skip(folder, &filename);
            return Ok(());
        }
        let artifact = self.scratch_file()?;
        self.api.download(url, artifact.path()).await?;
        self.publish(folder, &filename, existing, decision, artifact).await
    }

    /// Resolve a linked file through `url` and store it, unless this course run already handled it.
    async fn sync_linked_file(
        &mut self,
        ctx: &mut TraversalContext,
        folder: &DestinationDescriptor,
        known_id: Option<u64>,
        url: &str,
    ) -> Result<(), SyncError> {
        if let Some(id) = known_id {
            if !ctx.first_visit(id) {
                return Ok(());
            }
        }
        let file: CanvasFile = decode(url, self.api.get_json(url).await?)?;
        if known_id != Some(file.id) && !ctx.first_visit(file.id) {
            return Ok(());
        }
        self.store_file(folder, &file).await
    }

    async fn sync_embedded_files(
        &mut self,
        ctx: &mut TraversalContext,
        folder: &DestinationDescriptor,
        html: &str,
    ) {
        for file_id in discovery::embedded_file_ids(html) {
            let url = self.endpoints.file(file_id);
            let result = self.sync_linked_file(ctx, folder, Some(file_id), &url).await;
            self.contain("embedded file", result);
        }
    }

    /// Render `elements` to a staged PDF and publish it.
    async fn publish_pdf(
        &mut self,
        folder: &DestinationDescriptor,
        filename: &str,
        title: &str,
        elements: &[crate::render::DocumentElement],
        existing: Option<DestinationMetadata>,
        decision: ChangeDecision,
    ) -> Result<(), SyncError> {
        let artifact = self.scratch_file()?;
        pdf::write_pdf(artifact.path(), title, elements)?;
        self.publish(folder, filename, existing, decision, artifact).await
    }

    async fn sync_assignment(
        &mut self,
        ctx: &mut TraversalContext,
        root: &DestinationDescriptor,
        assignment: &Assignment,
    ) -> Result<(), SyncError> {
        let Some(name) = assignment.name.as_deref().filter(|n| !n.is_empty()) else {
            return Ok(());
        };
        let record = SourceRecord::from(assignment);
        let safe_name = safe_name(name, "assignment", &record.id);
        let folder = self.storage.ensure_folder(root, &safe_name).await?;
        let filename = format!("{safe_name}.pdf");

        let existing = self.decide_existing(&folder, &filename).await?;
        let decision = change::with_override(
            change::decide(existing.as_ref(), None, record.updated_at.as_deref()),
            self.config.force_regenerate,
        );
        if decision.needs_write() {
            let elements = preprocess::assignment_document(assignment);
            let result = self
                .publish_pdf(&folder, &filename, name, &elements, existing, decision)
                .await;
            self.contain("assignment document", result);
        } else {
            self.skip(&folder, &filename);
        }

        if let Some(description) = record.body.as_deref() {
            self.sync_embedded_files(ctx, &folder, description).await;
        }
        Ok(())
    }

    async fn sync_assignments(&mut self, ctx: &mut TraversalContext, course_folder: &DestinationDescriptor) {
        let url = self.endpoints.assignments(ctx.course_id);
        let assignments: Vec<Assignment> =
            discovery::decode_all(collect_all(self.api, &url).await, "assignment");
        info!(course = %ctx.course_name, count = assignments.len(), "[SYNC] Assignments discovered");
        if assignments.is_empty() {
            return;
        }
        let root = match self.storage.ensure_folder(course_folder, ASSIGNMENTS_FOLDER).await {
            Ok(root) => root,
            Err(e) => {
                self.contain("assignments folder", Err(e.into()));
                return;
            }
        };
        for assignment in &assignments {
            let result = self.sync_assignment(ctx, &root, assignment).await;
            self.contain("assignment", result);
        }
    }

    async fn module_items(&self, course_id: u64) -> Vec<ModuleItem> {
        let modules: Vec<Module> = discovery::decode_all(
            collect_all(self.api, &self.endpoints.modules(course_id)).await,
            "module",
        );
        let mut items = Vec::new();
        for module in &modules {
            let url = self.endpoints.module_items(course_id, module.id);
            items.extend(discovery::decode_all::<ModuleItem>(
                collect_all(self.api, &url).await,
                "module item",
            ));
        }
        items
    }

    async fn fetch_page(&self, item: &ModuleItem) -> Result<Option<CanvasPage>, SyncError> {
        let Some(url) = item.url.as_deref() else {
            return Ok(None);
        };
        let mut page: CanvasPage = decode(url, self.api.get_json(url).await?)?;
        if page.page_url.is_none() {
            page.page_url = item.page_url.clone();
        }
        Ok(Some(page))
    }

    async fn sync_module_page(
        &mut self,
        ctx: &mut TraversalContext,
        course_folder: &DestinationDescriptor,
        page: &CanvasPage,
    ) -> Result<(), SyncError> {
        let (Some(title), Some(body)) = (
            page.title.as_deref().filter(|t| !t.is_empty()),
            page.body.as_deref().filter(|b| !b.is_empty()),
        ) else {
            return Ok(());
        };
        let safe_title = safe_name(title, "page", &SourceRecord::from(page).id);
        let folder = self.storage.ensure_folder(course_folder, &safe_title).await?;
        let filename = format!("{safe_title}.pdf");
        let existing = self.decide_existing(&folder, &filename).await?;
        let decision = change::with_override(
            change::decide(existing.as_ref(), None, page.updated_at.as_deref()),
            self.config.force_regenerate,
        );
        if decision.needs_write() {
            let link = self.endpoints.page_link(ctx.course_id, page);
            let elements = preprocess::page_document(title, link.as_deref(), body);
            let result = self
                .publish_pdf(&folder, &filename, title, &elements, existing, decision)
                .await;
            self.contain("page document", result);
        } else {
            self.skip(&folder, &filename);
        }
        self.sync_embedded_files(ctx, &folder, body).await;
        Ok(())
    }

    /// Walk module items. Returns the pages met on the way for the combined document.
    async fn sync_modules(
        &mut self,
        ctx: &mut TraversalContext,
        course_folder: &DestinationDescriptor,
        store_items: bool,
    ) -> Vec<CanvasPage> {
        let items = self.module_items(ctx.course_id).await;
        info!(course = %ctx.course_name, count = items.len(), "[SYNC] Module items discovered");
        let mut pages = Vec::new();
        for item in &items {
            match item.kind.as_str() {
                "File" if store_items => {
                    let Some(url) = item.url.as_deref() else { continue };
                    let result = self
                        .sync_linked_file(ctx, course_folder, item.content_id, url)
                        .await;
                    self.contain("module file", result);
                }
                "Page" => {
                    let page = match self.fetch_page(item).await {
                        Ok(Some(page)) => page,
                        Ok(None) => continue,
                        Err(e) => {
                            self.contain("module page", Err(e));
                            continue;
                        }
                    };
                    if store_items {
                        let result = self.sync_module_page(ctx, course_folder, &page).await;
                        self.contain("module page", result);
                    }
                    pages.push(page);
                }
                _ => {}
            }
        }
        pages
    }

    async fn sync_combined_pages(
        &mut self,
        ctx: &TraversalContext,
        course_folder: &DestinationDescriptor,
        via_modules: Vec<CanvasPage>,
    ) -> Result<(), SyncError> {
        let direct: Vec<CanvasPage> = discovery::decode_all(
            collect_all(self.api, &self.endpoints.pages(ctx.course_id)).await,
            "page",
        );
        let pages = discovery::merge_pages(direct, via_modules);
        info!(course = %ctx.course_name, count = pages.len(), "[SYNC] Pages merged");
        if pages.is_empty() {
            return Ok(());
        }

        let folder = self.storage.ensure_folder(course_folder, PAGES_FOLDER).await?;
        let existing = self.decide_existing(&folder, COMBINED_PAGES_FILENAME).await?;
        let latest = change::latest_timestamp(pages.iter().filter_map(|p| p.updated_at.as_deref()));
        let decision = change::with_override(
            change::decide_aggregate(existing.as_ref(), None, latest),
            self.config.force_regenerate,
        );
        if !decision.needs_write() {
            self.skip(&folder, COMBINED_PAGES_FILENAME);
            return Ok(());
        }

        let linked: Vec<(CanvasPage, Option<String>)> = pages
            .into_iter()
            .map(|page| {
                let link = self.endpoints.page_link(ctx.course_id, &page);
                (page, link)
            })
            .collect();
        let elements = preprocess::combined_pages_document(&ctx.course_name, &linked);
        let title = format!("{} - Pages", ctx.course_name);
        self.publish_pdf(&folder, COMBINED_PAGES_FILENAME, &title, &elements, existing, decision)
            .await
    }

    /// Write `payload` as `filename` in `folder` unless the stored copy is current.
    async fn export_json(
        &mut self,
        folder: &DestinationDescriptor,
        filename: &str,
        kind: RecordKind,
        payload: &Value,
    ) -> Result<(), SyncError> {
        let bytes = preprocess::json_report(payload)?;
        let records = discovery::auxiliary_records(kind, payload);
        let latest = change::latest_timestamp(records.iter().filter_map(|r| r.updated_at.as_deref()))
            .map(|t| t.to_rfc3339());
        debug!(label = %folder.label, filename, ?kind, records = records.len(), "[SYNC] Exporting records");
        let existing = self.decide_existing(folder, filename).await?;
        let decision = change::decide(existing.as_ref(), Some(bytes.len() as u64), latest.as_deref());
        if !decision.needs_write() {
            self.skip(folder, filename);
            return Ok(());
        }
        let artifact = self.scratch_file()?;
        tokio::fs::write(artifact.path(), &bytes)
            .await
            .map_err(StorageError::Io)?;
        self.publish(folder, filename, existing, decision, artifact).await
    }

    async fn fetch_resource(&self, resource: AuxiliaryResource, course_id: u64) -> Result<Value, SyncError> {
        let url = self.endpoints.auxiliary(resource, course_id);
        if resource.is_listing() {
            Ok(Value::Array(collect_all(self.api, &url).await))
        } else {
            Ok(self.api.get_json(&url).await?)
        }
    }

    async fn sync_reports(&mut self, ctx: &TraversalContext, course_folder: &DestinationDescriptor) {
        let mut folder: Option<DestinationDescriptor> = None;
        for resource in AuxiliaryResource::ALL {
            if !resource.enabled(&self.config.export) {
                continue;
            }
            let payload = match self.fetch_resource(resource, ctx.course_id).await {
                Ok(payload) => payload,
                Err(e) => {
                    self.contain(resource.name(), Err(e));
                    continue;
                }
            };
            if matches!(&payload, Value::Array(items) if items.is_empty()) || payload.is_null() {
                debug!(course = %ctx.course_name, resource = resource.name(), "[SYNC] Nothing to export");
                continue;
            }
            let target = match &folder {
                Some(f) => f.clone(),
                None => match self.storage.ensure_folder(course_folder, REPORTS_FOLDER).await {
                    Ok(f) => {
                        folder = Some(f.clone());
                        f
                    }
                    Err(e) => {
                        self.contain("reports folder", Err(e.into()));
                        return;
                    }
                },
            };
            let result = self
                .export_json(&target, &resource.filename(), resource.kind(), &payload)
                .await;
            self.contain(resource.name(), result);
        }
    }

    async fn sync_course(&mut self, course: &Course, course_id: u64) {
        let name = course.display_name().to_string();
        info!(course = %name, course_id, "[SYNC] Processing course");
        let top = self.storage.top();
        let course_folder = match self.storage.ensure_folder(&top, &name).await {
            Ok(folder) => folder,
            Err(e) => {
                error!(course = %name, error = ?e, "[SYNC][ERROR] Could not prepare course folder");
                self.report.failed += 1;
                return;
            }
        };
        let mut ctx = TraversalContext::new(course_id, name);
        let export = self.config.export.clone();

        if export.assignments {
            self.sync_assignments(&mut ctx, &course_folder).await;
        }
        let module_pages = if export.modules || export.pages {
            self.sync_modules(&mut ctx, &course_folder, export.modules).await
        } else {
            Vec::new()
        };
        if export.pages {
            let result = self.sync_combined_pages(&ctx, &course_folder, module_pages).await;
            self.contain("combined pages", result);
        }
        self.sync_reports(&ctx, &course_folder).await;
        info!(
            course = %ctx.course_name,
            files = ctx.processed_count(),
            written = self.report.written,
            skipped = self.report.skipped,
            failed = self.report.failed,
            "[SYNC] Course finished"
        );
    }

    async fn sync_conversations(&mut self) -> Result<(), SyncError> {
        let conversations = collect_all(self.api, &self.endpoints.conversations()).await;
        if conversations.is_empty() {
            return Ok(());
        }
        let top = self.storage.top();
        let folder = self.storage.ensure_folder(&top, CONVERSATIONS_FOLDER).await?;
        self.export_json(
            &folder,
            CONVERSATIONS_FILENAME,
            RecordKind::Conversation,
            &Value::Array(conversations),
        )
            .await
    }

    fn finish_course(&mut self, next: CourseReport, reports: &mut Vec<CourseReport>) {
        reports.push(std::mem::replace(&mut self.report, next));
    }
}

/// Synchronise `courses` into `storage`.
///
/// Only failing to create the scratch directory is an error; everything
/// after that is contained per resource and reflected in the report.
pub async fn synchronise<A, S>(
    config: &SyncConfig,
    api: &A,
    storage: &S,
    courses: &[Course],
) -> Result<SyncReport, SyncError>
where
    A: SourceApi + ?Sized,
    S: Storage + ?Sized,
{
    info!(courses = courses.len(), "[SYNC] Starting synchronisation");
    let scratch = tempfile::Builder::new()
        .prefix("canvas-mirror-")
        .tempdir()
        .map_err(StorageError::Io)?;
    debug!(scratch = %scratch.path().display(), "[SYNC] Scratch directory ready");

    let mut run = Run {
        api,
        storage,
        config,
        endpoints: Endpoints::new(config.canvas.base_url()),
        scratch,
        summary: SummaryRecord::new(),
        report: CourseReport::default(),
    };
    let mut reports = Vec::new();

    for course in courses {
        let Some(course_id) = course.id else { continue };
        run.report = CourseReport {
            course_id: Some(course_id),
            course_name: course.display_name().to_string(),
            ..CourseReport::default()
        };
        run.sync_course(course, course_id).await;
        run.finish_course(CourseReport::default(), &mut reports);
    }

    if config.export.conversations {
        run.report = CourseReport {
            course_name: CONVERSATIONS_FOLDER.to_string(),
            ..CourseReport::default()
        };
        let result = run.sync_conversations().await;
        run.contain("conversations", result);
        run.finish_course(CourseReport::default(), &mut reports);
    }

    let summary = std::mem::take(&mut run.summary);
    drop(run);
    info!(written = summary.total(), "[SYNC] Synchronisation finished");
    Ok(SyncReport {
        summary,
        courses: reports,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_that_sanitise_to_nothing_fall_back_to_the_id() {
        assert_eq!(safe_name("Essay: draft?", "assignment", "7"), "Essay draft");
        assert_eq!(safe_name("???", "assignment", "7"), "assignment-7");
        assert_eq!(safe_name(" * ", "page", "intro"), "page-intro");
    }
}
