//! Read access to the Kimai time-tracking REST API.
//!
//! Kimai authenticates with a static API token sent as a bearer token, so
//! the underlying client is built without refresh support.

use chrono::NaiveDateTime;
use tracing::{debug, info};

use super::{ApiError, AuthenticatedClient};
use crate::models::{Activity, Project, Timesheet};

/// Page size for timesheet listing
const TIMESHEET_PAGE_SIZE: usize = 250;

/// Upper bound on pages fetched for one date range
const MAX_TIMESHEET_PAGES: usize = 40;

/// Kimai's HTML5 local datetime format for query parameters
const QUERY_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Clone)]
pub struct KimaiApi {
    client: AuthenticatedClient,
}

impl KimaiApi {
    pub fn new(client: AuthenticatedClient) -> Self {
        Self { client }
    }

    pub async fn fetch_projects(&self) -> Result<Vec<Project>, ApiError> {
        let projects: Vec<Project> = self.client.get("/projects", &[("visible", "3")]).await?;
        debug!(count = projects.len(), "Fetched projects");
        Ok(projects)
    }

    pub async fn fetch_activities(&self) -> Result<Vec<Activity>, ApiError> {
        let activities: Vec<Activity> = self.client.get("/activities", &[("visible", "3")]).await?;
        debug!(count = activities.len(), "Fetched activities");
        Ok(activities)
    }

    /// Fetch all timesheets between `begin` and `end`, following pages
    pub async fn fetch_timesheets(
        &self,
        begin: NaiveDateTime,
        end: NaiveDateTime,
    ) -> Result<Vec<Timesheet>, ApiError> {
        let begin = begin.format(QUERY_DATETIME_FORMAT).to_string();
        let end = end.format(QUERY_DATETIME_FORMAT).to_string();
        let size = TIMESHEET_PAGE_SIZE.to_string();

        let mut all = Vec::new();
        for page in 1..=MAX_TIMESHEET_PAGES {
            let page_str = page.to_string();
            let params = [
                ("begin", begin.as_str()),
                ("end", end.as_str()),
                ("size", size.as_str()),
                ("page", page_str.as_str()),
                ("full", "false"),
            ];
            let batch: Vec<Timesheet> = self.client.get("/timesheets", &params).await?;
            let batch_len = batch.len();
            all.extend(batch);

            if batch_len < TIMESHEET_PAGE_SIZE {
                break;
            }
        }

        info!(count = all.len(), %begin, %end, "Fetched timesheets");
        Ok(all)
    }
}
