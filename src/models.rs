use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    NotStarted,
    InProgress,
    Completed,
}

impl ProgressStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgressStatus::NotStarted => "not_started",
            ProgressStatus::InProgress => "in_progress",
            ProgressStatus::Completed => "completed",
        }
    }
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "not_started" => Ok(ProgressStatus::NotStarted),
            "in_progress" => Ok(ProgressStatus::InProgress),
            "completed" => Ok(ProgressStatus::Completed),
            other => Err(format!("unknown progress status '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub user_id: i32,
    pub course_id: i32,
    pub status: ProgressStatus,
    pub due_date: Option<NaiveDateTime>,
    pub completion_percentage: i32,
    pub time_spent_minutes: i32,
}

impl ProgressRecord {
    /// Same predicate the overdue scan applies server-side.
    pub fn is_overdue(&self, today: NaiveDate) -> bool {
        match self.due_date {
            Some(due) => due.date() < today && self.status != ProgressStatus::Completed,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OverdueRow {
    pub user_id: i32,
    pub user_name: String,
    pub user_email: String,
    pub course_title: String,
    pub due_date: Option<NaiveDateTime>,
    pub status: ProgressStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverdueCourseEntry {
    pub title: String,
    pub due_date: String,
    pub days_overdue: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserOverdueBundle {
    pub user_name: String,
    pub user_email: String,
    pub courses: Vec<OverdueCourseEntry>,
}
