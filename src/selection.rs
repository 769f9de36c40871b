//! Which courses a run covers, and remembering that choice for the next run.

use anyhow::{Context, Result};
use canvas_mirror_core::discovery::Course;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseSelection {
    pub course_ids: Vec<u64>,
}

impl CourseSelection {
    pub fn from_courses(courses: &[Course]) -> Self {
        Self {
            course_ids: courses.iter().filter_map(|c| c.id).collect(),
        }
    }
}

/// The persisted selection, if there is a readable one.
pub fn load_selection(path: &Path) -> Option<CourseSelection> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!(state_file = %path.display(), error = ?e, "Could not read saved selection");
            return None;
        }
    };
    match serde_json::from_str(&content) {
        Ok(selection) => Some(selection),
        Err(e) => {
            warn!(state_file = %path.display(), error = ?e, "Ignoring malformed saved selection");
            None
        }
    }
}

pub fn save_selection(path: &Path, selection: &CourseSelection) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(selection)?;
    std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Pick the courses to sync.
///
/// Explicit ids win, then `all`, then the saved selection. When none of
/// those names an available course, every available course is synced.
pub fn select_courses(
    available: Vec<Course>,
    requested: &[u64],
    all: bool,
    saved: Option<&CourseSelection>,
) -> Vec<Course> {
    let wanted: &[u64] = if !requested.is_empty() {
        requested
    } else if all {
        &[]
    } else {
        saved.map(|s| s.course_ids.as_slice()).unwrap_or(&[])
    };
    if wanted.is_empty() {
        info!(count = available.len(), "Selecting all available courses");
        return available;
    }
    for id in wanted {
        if !available.iter().any(|c| c.id == Some(*id)) {
            warn!(course_id = id, "Course not available, ignoring");
        }
    }
    let chosen: Vec<Course> = available
        .iter()
        .filter(|c| c.id.is_some_and(|id| wanted.contains(&id)))
        .cloned()
        .collect();
    if chosen.is_empty() {
        warn!("No requested course is available; selecting all");
        return available;
    }
    info!(count = chosen.len(), "Courses selected");
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_mirror_core::discovery::available_courses;
    use serde_json::json;
    use tempfile::tempdir;

    fn courses() -> Vec<Course> {
        available_courses(vec![
            json!({"id": 1, "name": "Bio"}),
            json!({"id": 2, "name": "Chem"}),
            json!({"id": 3, "name": "Physics"}),
        ])
    }

    fn ids(courses: &[Course]) -> Vec<u64> {
        courses.iter().filter_map(|c| c.id).collect()
    }

    #[test]
    fn explicit_ids_win_over_saved_selection() {
        let saved = CourseSelection { course_ids: vec![1] };
        let chosen = select_courses(courses(), &[2, 3], false, Some(&saved));
        assert_eq!(ids(&chosen), vec![2, 3]);
    }

    #[test]
    fn all_flag_ignores_saved_selection() {
        let saved = CourseSelection { course_ids: vec![1] };
        let chosen = select_courses(courses(), &[], true, Some(&saved));
        assert_eq!(ids(&chosen), vec![1, 2, 3]);
    }

    #[test]
    fn saved_selection_is_reused_and_stale_ids_dropped() {
        let saved = CourseSelection { course_ids: vec![3, 99] };
        let chosen = select_courses(courses(), &[], false, Some(&saved));
        assert_eq!(ids(&chosen), vec![3]);
    }

    #[test]
    fn nothing_matching_falls_back_to_everything() {
        let chosen = select_courses(courses(), &[42], false, None);
        assert_eq!(ids(&chosen), vec![1, 2, 3]);
    }

    #[test]
    fn selection_survives_a_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state/selection.json");
        assert_eq!(load_selection(&path), None);

        let selection = CourseSelection::from_courses(&courses()[..2]);
        save_selection(&path, &selection).unwrap();
        assert_eq!(load_selection(&path), Some(CourseSelection { course_ids: vec![1, 2] }));
    }

    #[test]
    fn malformed_state_file_is_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("selection.json");
        std::fs::write(&path, "not json").unwrap();
        assert_eq!(load_selection(&path), None);
    }
}
