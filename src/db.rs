use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{Error, Result};
use crate::models::{OverdueRow, ProgressRecord, ProgressStatus};

/// Read side of the progress database used by the overdue job.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn scan(&self) -> Result<Vec<OverdueRow>>;
}

pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const OVERDUE_QUERY: &str = r#"
    SELECT u.id AS user_id, u.name AS user_name, u.email AS user_email,
           c.title AS course_title, p.due_date, p.status::text AS status
    FROM progress p
    JOIN "user" u ON u.id = p.user_id
    JOIN course c ON c.id = p.course_id
    WHERE p.due_date IS NOT NULL
      AND p.due_date::date < CURRENT_DATE
      AND p.status <> 'completed'
"#;

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn scan(&self) -> Result<Vec<OverdueRow>> {
        let records = sqlx::query(OVERDUE_QUERY).fetch_all(&self.pool).await?;
        let mut rows = Vec::with_capacity(records.len());

        for record in records {
            let status: String = record.try_get("status")?;
            rows.push(OverdueRow {
                user_id: record.try_get("user_id")?,
                user_name: record.try_get("user_name")?,
                user_email: record.try_get("user_email")?,
                course_title: record.try_get("course_title")?,
                due_date: record.try_get("due_date")?,
                status: status
                    .parse()
                    .map_err(|e: String| Error::Storage(sqlx::Error::Decode(e.into())))?,
            });
        }

        Ok(rows)
    }
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

#[derive(Debug, Clone, Default)]
pub struct SeedSummary {
    pub users: usize,
    pub courses: usize,
    pub progress: usize,
    pub overdue: usize,
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<SeedSummary> {
    let users = vec![
        ("Avery Lee", "avery.lee@niftylearning.com"),
        ("Jules Moreno", "jules.moreno@niftylearning.com"),
        ("Kiara Patel", "kiara.patel@niftylearning.com"),
    ];

    let courses = vec![
        ("React Fundamentals", "Components, hooks and state management.", 4),
        ("Database Design", "Modelling relational schemas that age well.", 3),
        ("Security Best Practices", "Threat modelling for everyday services.", 2),
        ("System Architecture", "Trade-offs behind distributed systems.", 5),
    ];

    let mut summary = SeedSummary::default();
    let mut user_ids = Vec::new();
    for (name, email) in users {
        let id: i32 = sqlx::query(
            r#"
            INSERT INTO "user" (email, password, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE
            SET name = EXCLUDED.name, updated_at = NOW()
            RETURNING id
            "#,
        )
        .bind(email)
        .bind("seeded-account")
        .bind(name)
        .fetch_one(pool)
        .await?
        .get("id");
        user_ids.push(id);
        summary.users += 1;
    }

    let mut course_ids = Vec::new();
    for (title, description, duration) in courses {
        let id: i32 = sqlx::query(
            r#"
            INSERT INTO course (title, description, duration)
            VALUES ($1, $2, $3)
            ON CONFLICT (title) DO UPDATE
            SET description = EXCLUDED.description, duration = EXCLUDED.duration
            RETURNING id
            "#,
        )
        .bind(title)
        .bind(description)
        .bind(duration)
        .fetch_one(pool)
        .await?
        .get("id");
        course_ids.push(id);
        summary.courses += 1;
    }

    let now = Utc::now().naive_utc();
    let days = |offset: i64| -> Option<NaiveDateTime> { Some(now + Duration::days(offset)) };

    // (user, course, status, due date, completion %, minutes)
    let plan = vec![
        (0, 0, ProgressStatus::InProgress, days(-3), 45, 120),
        (0, 1, ProgressStatus::NotStarted, days(-10), 0, 0),
        (0, 2, ProgressStatus::Completed, days(-20), 100, 95),
        (1, 1, ProgressStatus::InProgress, days(-1), 70, 160),
        (1, 3, ProgressStatus::InProgress, days(14), 20, 60),
        (2, 0, ProgressStatus::NotStarted, None, 0, 0),
        (2, 3, ProgressStatus::Completed, days(-2), 100, 300),
    ];

    let today = Utc::now().date_naive();
    for (user, course, status, due_date, completion, minutes) in plan {
        let record = ProgressRecord {
            user_id: user_ids[user],
            course_id: course_ids[course],
            status,
            due_date,
            completion_percentage: completion,
            time_spent_minutes: minutes,
        };

        sqlx::query(
            r#"
            INSERT INTO progress
            (user_id, course_id, status, due_date, completion_percentage, time_spent_minutes,
             started_at, completed_at)
            VALUES ($1, $2, $3::progress_status, $4, $5, $6,
                    CASE WHEN $3 = 'not_started' THEN NULL ELSE NOW() END,
                    CASE WHEN $3 = 'completed' THEN NOW() ELSE NULL END)
            ON CONFLICT (user_id, course_id) DO UPDATE
            SET status = EXCLUDED.status,
                due_date = EXCLUDED.due_date,
                completion_percentage = EXCLUDED.completion_percentage,
                time_spent_minutes = EXCLUDED.time_spent_minutes,
                started_at = EXCLUDED.started_at,
                completed_at = EXCLUDED.completed_at,
                updated_at = NOW()
            "#,
        )
        .bind(record.user_id)
        .bind(record.course_id)
        .bind(record.status.as_str())
        .bind(record.due_date)
        .bind(record.completion_percentage)
        .bind(record.time_spent_minutes)
        .execute(pool)
        .await?;

        summary.progress += 1;
        if record.is_overdue(today) {
            summary.overdue += 1;
        }
    }

    Ok(summary)
}
