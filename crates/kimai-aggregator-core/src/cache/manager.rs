use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::debug;

use crate::models::{Activity, Project, Timesheet};

/// Data older than this is refetched on the next pull
const CACHE_STALE_MINUTES: i64 = 60;

const MINUTES_PER_DAY: i64 = 24 * 60;

/// The Kimai data sets kept on disk, one JSON file each.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Projects,
    Activities,
    Timesheets,
}

impl CacheKind {
    /// The kinds a progress summary is built from
    const SUMMARY_INPUTS: [CacheKind; 2] = [CacheKind::Projects, CacheKind::Timesheets];

    fn file_name(self) -> &'static str {
        match self {
            CacheKind::Projects => "projects.json",
            CacheKind::Activities => "activities.json",
            CacheKind::Timesheets => "timesheets.json",
        }
    }
}

/// A cached data set and when it was written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }
}

/// Just the timestamp of a cache file; the data itself is skipped.
#[derive(Deserialize)]
struct CacheStamp {
    cached_at: DateTime<Utc>,
}

fn minutes_since(at: DateTime<Utc>) -> i64 {
    (Utc::now() - at).num_minutes()
}

/// Rounded, human readable age: "just now", "5m ago", "2h ago", "3d ago".
/// Negative ages (clock skew) read as "just now".
fn format_age(minutes: i64) -> String {
    match minutes {
        m if m < 1 => "just now".to_string(),
        m if m < 60 => format!("{}m ago", m),
        m if m < MINUTES_PER_DAY => format!("{}h ago", (m + 30) / 60),
        m => format!("{}d ago", (m + MINUTES_PER_DAY / 2) / MINUTES_PER_DAY),
    }
}

/// JSON file cache of Kimai data for offline display.
pub struct CacheManager {
    cache_dir: PathBuf,
}

impl CacheManager {
    pub fn new(cache_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&cache_dir)?;
        Ok(Self { cache_dir })
    }

    fn path(&self, kind: CacheKind) -> PathBuf {
        self.cache_dir.join(kind.file_name())
    }

    fn read<T: DeserializeOwned>(&self, kind: CacheKind) -> Result<Option<T>> {
        let path = self.path(kind);
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read cache file {}", path.display()))?;
        let value = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache file {}", path.display()))?;
        Ok(Some(value))
    }

    fn write<T: Serialize>(&self, kind: CacheKind, data: &[T]) -> Result<()> {
        let contents = serde_json::to_string_pretty(&CachedData::new(data))?;
        std::fs::write(self.path(kind), contents)?;
        debug!(?kind, count = data.len(), "Cache written");
        Ok(())
    }

    pub fn load_projects(&self) -> Result<Option<CachedData<Vec<Project>>>> {
        self.read(CacheKind::Projects)
    }

    pub fn save_projects(&self, projects: &[Project]) -> Result<()> {
        self.write(CacheKind::Projects, projects)
    }

    pub fn load_activities(&self) -> Result<Option<CachedData<Vec<Activity>>>> {
        self.read(CacheKind::Activities)
    }

    pub fn save_activities(&self, activities: &[Activity]) -> Result<()> {
        self.write(CacheKind::Activities, activities)
    }

    pub fn load_timesheets(&self) -> Result<Option<CachedData<Vec<Timesheet>>>> {
        self.read(CacheKind::Timesheets)
    }

    pub fn save_timesheets(&self, timesheets: &[Timesheet]) -> Result<()> {
        self.write(CacheKind::Timesheets, timesheets)
    }

    /// When `kind` was last written. Missing or unreadable files count as never.
    pub fn cached_at(&self, kind: CacheKind) -> Option<DateTime<Utc>> {
        match self.read::<CacheStamp>(kind) {
            Ok(stamp) => stamp.map(|s| s.cached_at),
            Err(e) => {
                debug!(?kind, error = %e, "Ignoring unreadable cache file");
                None
            }
        }
    }

    pub fn get_cache_ages(&self) -> CacheAges {
        let age = |kind| self.cached_at(kind).map(|at| format_age(minutes_since(at)));
        CacheAges {
            projects: age(CacheKind::Projects),
            activities: age(CacheKind::Activities),
            timesheets: age(CacheKind::Timesheets),
        }
    }

    /// Check if any data a summary needs is missing or stale
    pub fn any_stale(&self) -> bool {
        CacheKind::SUMMARY_INPUTS.iter().any(|kind| {
            self.cached_at(*kind)
                .map_or(true, |at| minutes_since(at) > CACHE_STALE_MINUTES)
        })
    }
}

#[derive(Debug, Default)]
pub struct CacheAges {
    pub projects: Option<String>,
    pub activities: Option<String>,
    pub timesheets: Option<String>,
}

impl CacheAges {
    /// Age of the timesheets, which drive every summary
    pub fn last_updated(&self) -> String {
        self.timesheets
            .clone()
            .or_else(|| self.projects.clone())
            .unwrap_or_else(|| "never".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn project() -> Project {
        Project {
            id: 3,
            name: "Website relaunch".to_string(),
            customer: Some(1),
            visible: Some(true),
            budget: None,
            time_budget: None,
            color: None,
        }
    }

    #[test]
    fn test_format_age_rounds_to_nearest_unit() {
        assert_eq!(format_age(-3), "just now");
        assert_eq!(format_age(0), "just now");
        assert_eq!(format_age(5), "5m ago");
        assert_eq!(format_age(95), "2h ago");
        assert_eq!(format_age(80), "1h ago");
        assert_eq!(format_age(26 * 60), "1d ago");
        assert_eq!(format_age(36 * 60), "2d ago");
    }

    #[test]
    fn test_save_and_load_projects() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path().to_path_buf()).expect("cache");
        assert!(cache.any_stale());
        assert_eq!(cache.get_cache_ages().last_updated(), "never");

        cache.save_projects(&[project()]).expect("save");
        cache.save_timesheets(&[]).expect("save");

        let loaded = cache.load_projects().expect("load").expect("cached");
        assert_eq!(loaded.data, vec![project()]);
        assert!(!cache.any_stale());
        assert_eq!(cache.get_cache_ages().last_updated(), "just now");
        assert!(cache.get_cache_ages().activities.is_none());
    }

    #[test]
    fn test_activities_do_not_affect_staleness() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path().to_path_buf()).expect("cache");

        cache.save_activities(&[]).expect("save");
        assert!(cache.any_stale());
        assert_eq!(cache.get_cache_ages().activities.as_deref(), Some("just now"));
        assert!(cache.load_activities().expect("load").is_some());
    }

    #[test]
    fn test_old_cache_is_stale() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path().to_path_buf()).expect("cache");
        cache.save_projects(&[project()]).expect("save");

        let old = CachedData {
            data: Vec::<Timesheet>::new(),
            cached_at: Utc::now() - Duration::minutes(95),
        };
        let contents = serde_json::to_string(&old).expect("json");
        std::fs::write(dir.path().join("timesheets.json"), contents).expect("write");

        assert!(cache.any_stale());
        assert_eq!(cache.get_cache_ages().timesheets.as_deref(), Some("2h ago"));
    }

    #[test]
    fn test_corrupt_cache_file_counts_as_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = CacheManager::new(dir.path().to_path_buf()).expect("cache");
        std::fs::write(dir.path().join("projects.json"), "{not json").expect("write");

        assert!(cache.cached_at(CacheKind::Projects).is_none());
        assert!(cache.load_projects().is_err());
    }
}
