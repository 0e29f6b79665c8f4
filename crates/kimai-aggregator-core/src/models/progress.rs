use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::{Project, Timesheet};

/// Hours and revenue logged against one project, compared to its budgets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectProgress {
    pub project_id: i64,
    pub name: String,
    pub hours: f64,
    pub revenue: f64,
    pub time_budget_hours: Option<f64>,
    pub budget: Option<f64>,
}

impl ProjectProgress {
    /// Share of the time budget used, in percent
    pub fn time_used_percent(&self) -> Option<f64> {
        self.time_budget_hours
            .filter(|b| *b > 0.0)
            .map(|b| self.hours / b * 100.0)
    }

    /// Share of the money budget used, in percent
    pub fn budget_used_percent(&self) -> Option<f64> {
        self.budget
            .filter(|b| *b > 0.0)
            .map(|b| self.revenue / b * 100.0)
    }

    pub fn is_over_budget(&self) -> bool {
        self.time_used_percent().is_some_and(|p| p > 100.0)
            || self.budget_used_percent().is_some_and(|p| p > 100.0)
    }

    /// Aggregate timesheets per project, busiest project first.
    ///
    /// Timesheets for projects missing from `projects` are still counted,
    /// under a placeholder name.
    pub fn summarize(projects: &[Project], timesheets: &[Timesheet]) -> Vec<ProjectProgress> {
        let by_id: HashMap<i64, &Project> = projects.iter().map(|p| (p.id, p)).collect();
        let mut totals: HashMap<i64, (f64, f64)> = HashMap::new();

        for sheet in timesheets {
            let entry = totals.entry(sheet.project).or_insert((0.0, 0.0));
            entry.0 += sheet.hours();
            entry.1 += sheet.rate.unwrap_or(0.0);
        }

        let mut progress: Vec<ProjectProgress> = totals
            .into_iter()
            .map(|(project_id, (hours, revenue))| {
                let project = by_id.get(&project_id);
                ProjectProgress {
                    project_id,
                    name: project
                        .map(|p| p.name.clone())
                        .unwrap_or_else(|| format!("Project #{}", project_id)),
                    hours,
                    revenue,
                    time_budget_hours: project.and_then(|p| p.time_budget_hours()),
                    budget: project.and_then(|p| p.budget),
                }
            })
            .collect();

        progress.sort_by(|a, b| {
            b.hours
                .total_cmp(&a.hours)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });
        progress
    }
}
