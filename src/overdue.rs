use std::collections::HashMap;

use chrono::{DateTime, NaiveDateTime, Utc};

use crate::models::{OverdueCourseEntry, OverdueRow, UserOverdueBundle};

/// Whole days between `due` and `now`, truncated. Rows reaching the aggregator
/// were due before today, so the result never drops below one.
pub fn days_overdue(now: DateTime<Utc>, due: NaiveDateTime) -> i64 {
    (now - due.and_utc()).num_days().max(1)
}

pub fn format_due_date(due: NaiveDateTime) -> String {
    due.format("%-m/%-d/%Y").to_string()
}

/// Groups scan rows into one bundle per user, in the order users are first seen.
pub fn aggregate(rows: &[OverdueRow], now: DateTime<Utc>) -> Vec<(i32, UserOverdueBundle)> {
    let mut index: HashMap<i32, usize> = HashMap::new();
    let mut bundles: Vec<(i32, UserOverdueBundle)> = Vec::new();

    for row in rows {
        let Some(due) = row.due_date else {
            tracing::debug!(
                user_id = row.user_id,
                course = %row.course_title,
                status = %row.status,
                "skipping overdue row without a due date"
            );
            continue;
        };

        let slot = *index.entry(row.user_id).or_insert_with(|| {
            bundles.push((
                row.user_id,
                UserOverdueBundle {
                    user_name: row.user_name.clone(),
                    user_email: row.user_email.clone(),
                    courses: Vec::new(),
                },
            ));
            bundles.len() - 1
        });

        bundles[slot].1.courses.push(OverdueCourseEntry {
            title: row.course_title.clone(),
            due_date: format_due_date(due),
            days_overdue: days_overdue(now, due),
        });
    }

    bundles
}
