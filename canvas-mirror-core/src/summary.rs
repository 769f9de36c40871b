//! Write-only audit of what a run created or updated, grouped by course then destination label.

use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SummaryEntry {
    pub filename: String,
    pub action: String,
}

#[derive(Debug, Clone, Default, Serialize)]
struct FolderSummary {
    label: String,
    entries: Vec<SummaryEntry>,
}

#[derive(Debug, Clone, Default, Serialize)]
struct CourseSummary {
    course: String,
    folders: Vec<FolderSummary>,
}

/// Insertion-ordered `course -> label -> [(filename, action)]`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SummaryRecord {
    courses: Vec<CourseSummary>,
}

impl SummaryRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Blank course, label or filename is ignored.
    pub fn add(&mut self, course: &str, label: &str, filename: &str, action: &str) {
        if course.is_empty() || label.is_empty() || filename.is_empty() {
            return;
        }
        let course_idx = match self.courses.iter().position(|c| c.course == course) {
            Some(idx) => idx,
            None => {
                self.courses.push(CourseSummary {
                    course: course.to_string(),
                    folders: Vec::new(),
                });
                self.courses.len() - 1
            }
        };
        let folders = &mut self.courses[course_idx].folders;
        let folder_idx = match folders.iter().position(|f| f.label == label) {
            Some(idx) => idx,
            None => {
                folders.push(FolderSummary {
                    label: label.to_string(),
                    entries: Vec::new(),
                });
                folders.len() - 1
            }
        };
        folders[folder_idx].entries.push(SummaryEntry {
            filename: filename.to_string(),
            action: action.to_string(),
        });
    }

    pub fn has_changes(&self) -> bool {
        self.courses
            .iter()
            .any(|c| c.folders.iter().any(|f| !f.entries.is_empty()))
    }

    /// Entries recorded under `course` and `label`, in insertion order.
    pub fn entries(&self, course: &str, label: &str) -> &[SummaryEntry] {
        self.courses
            .iter()
            .find(|c| c.course == course)
            .and_then(|c| c.folders.iter().find(|f| f.label == label))
            .map(|f| f.entries.as_slice())
            .unwrap_or(&[])
    }

    /// Labels that received at least one entry for `course`.
    pub fn labels(&self, course: &str) -> Vec<&str> {
        self.courses
            .iter()
            .find(|c| c.course == course)
            .map(|c| c.folders.iter().map(|f| f.label.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.courses
            .iter()
            .flat_map(|c| &c.folders)
            .map(|f| f.entries.len())
            .sum()
    }
}

impl fmt::Display for SummaryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Summary of Updates ===")?;
        if !self.has_changes() {
            return writeln!(f, "No files or folders were updated across the selected courses.");
        }
        for course in &self.courses {
            writeln!(f)?;
            writeln!(f, "Course: {}", course.course)?;
            for folder in &course.folders {
                writeln!(f, "  Folder: {}", folder.label)?;
                for entry in &folder.entries {
                    writeln!(f, "    - {}  [{}]", entry.filename, entry.action)?;
                }
            }
        }
        writeln!(f)?;
        writeln!(f, "==========================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_summary_says_nothing_changed() {
        let summary = SummaryRecord::new();
        assert!(!summary.has_changes());
        assert_eq!(
            summary.to_string(),
            "=== Summary of Updates ===\nNo files or folders were updated across the selected courses.\n"
        );
    }

    #[test]
    fn entries_group_by_course_and_label_in_insertion_order() {
        let mut summary = SummaryRecord::new();
        summary.add("Bio", "Bio/Pages", "All Pages.pdf", "updated");
        summary.add("Bio", "Bio", "slides.pdf", "created");
        summary.add("Bio", "Bio/Pages", "x.pdf", "created");
        summary.add("", "Bio", "ignored.pdf", "created");

        assert_eq!(summary.labels("Bio"), vec!["Bio/Pages", "Bio"]);
        assert_eq!(summary.entries("Bio", "Bio/Pages").len(), 2);
        assert_eq!(summary.total(), 3);
        assert_eq!(
            summary.to_string(),
            "=== Summary of Updates ===\n\nCourse: Bio\n  Folder: Bio/Pages\n    - All Pages.pdf  [updated]\n    - x.pdf  [created]\n  Folder: Bio\n    - slides.pdf  [created]\n\n==========================\n"
        );
    }
}
