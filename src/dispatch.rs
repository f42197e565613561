use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::ProgressStore;
use crate::error::Result;
use crate::mailer::{Notifier, OutgoingMail};
use crate::models::UserOverdueBundle;
use crate::overdue;
use crate::scheduler::{CronSchedule, Job, Scheduler};

pub const SUBJECT: &str = "Overdue Courses";
pub const JOB_NAME: &str = "overdue-course-notifications";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub from: String,
    /// Pause after every send attempt, successful or not.
    pub send_delay: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempted: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub rows: usize,
    pub bundles: usize,
    pub attempted: usize,
    pub failed: usize,
}

pub fn render_body(bundle: &UserOverdueBundle) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "Hi {},", bundle.user_name);
    let _ = writeln!(output);
    let _ = writeln!(
        output,
        "You have {} overdue course(s):",
        bundle.courses.len()
    );
    let _ = writeln!(output);
    for course in bundle.courses.iter() {
        let _ = writeln!(
            output,
            "• {} ({} days overdue, due: {})",
            course.title, course.days_overdue, course.due_date
        );
    }
    let _ = writeln!(output);
    let _ = writeln!(output, "Please complete these courses ASAP.");
    let _ = writeln!(output);
    let _ = writeln!(output, "Nifty Learning Team");

    output
}

/// Sends one message per bundle, serially. A failed send is logged and the
/// loop moves on; nothing here aborts the batch.
pub async fn dispatch<N>(
    bundles: &[(i32, UserOverdueBundle)],
    notifier: &N,
    settings: &DispatchSettings,
) -> DispatchReport
where
    N: Notifier + ?Sized,
{
    let mut report = DispatchReport::default();

    for (user_id, bundle) in bundles {
        tracing::info!(
            user_id,
            to = %bundle.user_email,
            courses = bundle.courses.len(),
            "sending overdue notification"
        );

        let mail = OutgoingMail {
            to: bundle.user_email.clone(),
            from: settings.from.clone(),
            subject: SUBJECT.to_string(),
            body: render_body(bundle),
        };

        report.attempted += 1;
        if let Err(err) = notifier.send(&mail).await {
            report.failed += 1;
            tracing::error!(user_id, to = %bundle.user_email, error = %err, "overdue notification failed");
        }

        tokio::time::sleep(settings.send_delay).await;
    }

    report
}

/// Scan and group without sending anything.
pub async fn preview<S>(store: &S) -> Result<Vec<(i32, UserOverdueBundle)>>
where
    S: ProgressStore + ?Sized,
{
    let rows = store.scan().await?;
    Ok(overdue::aggregate(&rows, Utc::now()))
}

/// One scan → aggregate → dispatch pipeline over a store and a notifier.
pub struct OverdueNotifier<S, N> {
    store: S,
    notifier: N,
    settings: DispatchSettings,
}

impl<S, N> OverdueNotifier<S, N>
where
    S: ProgressStore,
    N: Notifier,
{
    pub fn new(store: S, notifier: N, settings: DispatchSettings) -> Self {
        Self {
            store,
            notifier,
            settings,
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleReport> {
        let rows = self.store.scan().await?;
        let bundles = overdue::aggregate(&rows, Utc::now());
        let dispatched = dispatch(&bundles, &self.notifier, &self.settings).await;

        Ok(CycleReport {
            rows: rows.len(),
            bundles: bundles.len(),
            attempted: dispatched.attempted,
            failed: dispatched.failed,
        })
    }
}

#[async_trait]
impl<S, N> Job for OverdueNotifier<S, N>
where
    S: ProgressStore,
    N: Notifier,
{
    async fn run(&self) {
        match self.run_cycle().await {
            Ok(report) => tracing::info!(
                rows = report.rows,
                bundles = report.bundles,
                attempted = report.attempted,
                failed = report.failed,
                "overdue notification cycle finished"
            ),
            Err(err) => tracing::error!(error = %err, "overdue notification cycle aborted"),
        }
    }
}

/// Registers the overdue cycle under [`JOB_NAME`]; it stays stopped until
/// [`Scheduler::start`]. Calling this again replaces the earlier registration.
pub fn schedule_overdue_notifications<S, N>(
    scheduler: &mut Scheduler,
    notifier: Arc<OverdueNotifier<S, N>>,
    cron: &str,
) -> Result<()>
where
    S: ProgressStore + 'static,
    N: Notifier + 'static,
{
    let schedule: CronSchedule = cron.parse()?;
    scheduler.register(JOB_NAME, Arc::new(schedule), notifier);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::models::{OverdueCourseEntry, OverdueRow, ProgressStatus};
    use crate::scheduler::{JobState, SystemClock};
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<OutgoingMail>>,
        fail_for: Vec<String>,
    }

    impl RecordingNotifier {
        fn failing_for(addresses: &[&str]) -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail_for: addresses.iter().map(|a| a.to_string()).collect(),
            }
        }

        fn sent(&self) -> Vec<OutgoingMail> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, mail: &OutgoingMail) -> Result<()> {
            self.sent.lock().unwrap().push(mail.clone());
            if self.fail_for.contains(&mail.to) {
                return Err(Error::Transport("connection reset".to_string()));
            }
            Ok(())
        }
    }

    struct FixedStore(Vec<OverdueRow>);

    #[async_trait]
    impl ProgressStore for FixedStore {
        async fn scan(&self) -> Result<Vec<OverdueRow>> {
            Ok(self.0.clone())
        }
    }

    struct BrokenStore;

    #[async_trait]
    impl ProgressStore for BrokenStore {
        async fn scan(&self) -> Result<Vec<OverdueRow>> {
            Err(Error::Storage(sqlx::Error::PoolTimedOut))
        }
    }

    fn settings() -> DispatchSettings {
        DispatchSettings {
            from: "noreply@niftylearning.com".to_string(),
            send_delay: Duration::ZERO,
        }
    }

    fn bundle(email: &str, titles: &[&str]) -> UserOverdueBundle {
        UserOverdueBundle {
            user_name: "Avery Lee".to_string(),
            user_email: email.to_string(),
            courses: titles
                .iter()
                .map(|title| OverdueCourseEntry {
                    title: title.to_string(),
                    due_date: "3/1/2026".to_string(),
                    days_overdue: 5,
                })
                .collect(),
        }
    }

    fn overdue_row(user_id: i32, email: &str, course: &str) -> OverdueRow {
        OverdueRow {
            user_id,
            user_name: email.split('@').next().unwrap_or_default().to_string(),
            user_email: email.to_string(),
            course_title: course.to_string(),
            due_date: Some((Utc::now() - ChronoDuration::days(4)).naive_utc()),
            status: ProgressStatus::InProgress,
        }
    }

    #[test]
    fn body_lists_every_course() {
        let body = render_body(&bundle("a@example.com", &["Data Structures", "Microservices"]));
        assert!(body.starts_with("Hi Avery Lee,"));
        assert!(body.contains("You have 2 overdue course(s):"));
        assert!(body.contains("• Data Structures (5 days overdue, due: 3/1/2026)"));
        assert!(body.contains("• Microservices (5 days overdue, due: 3/1/2026)"));
        assert!(body.trim_end().ends_with("Nifty Learning Team"));
    }

    #[tokio::test]
    async fn failed_send_does_not_block_the_rest() {
        let bundles = vec![
            (1, bundle("first@example.com", &["React Fundamentals"])),
            (2, bundle("second@example.com", &["Database Design"])),
            (3, bundle("third@example.com", &["API Development"])),
        ];
        let notifier = RecordingNotifier::failing_for(&["second@example.com"]);

        let report = dispatch(&bundles, &notifier, &settings()).await;

        assert_eq!(report, DispatchReport { attempted: 3, failed: 1 });
        let recipients: Vec<String> = notifier.sent().into_iter().map(|m| m.to).collect();
        assert_eq!(
            recipients,
            vec!["first@example.com", "second@example.com", "third@example.com"]
        );
    }

    #[tokio::test]
    async fn messages_use_fixed_sender_and_subject() {
        let bundles = vec![(1, bundle("first@example.com", &["Cloud Computing"]))];
        let notifier = RecordingNotifier::default();

        dispatch(&bundles, &notifier, &settings()).await;

        let sent = notifier.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].from, "noreply@niftylearning.com");
        assert_eq!(sent[0].subject, "Overdue Courses");
    }

    #[tokio::test(start_paused = true)]
    async fn delay_follows_every_attempt() {
        let bundles = vec![
            (1, bundle("first@example.com", &["React Fundamentals"])),
            (2, bundle("second@example.com", &["Database Design"])),
        ];
        let notifier = RecordingNotifier::failing_for(&["first@example.com", "second@example.com"]);
        let settings = DispatchSettings {
            from: "noreply@niftylearning.com".to_string(),
            send_delay: Duration::from_millis(100),
        };

        let started = tokio::time::Instant::now();
        dispatch(&bundles, &notifier, &settings).await;

        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn one_message_per_user_with_their_courses() {
        let store = FixedStore(vec![
            overdue_row(1, "a@example.com", "Course X"),
            overdue_row(2, "b@example.com", "Course Z"),
            overdue_row(1, "a@example.com", "Course Y"),
        ]);
        let job = OverdueNotifier::new(store, RecordingNotifier::default(), settings());

        let report = job.run_cycle().await.unwrap();

        assert_eq!(report.rows, 3);
        assert_eq!(report.bundles, 2);
        assert_eq!(report.attempted, 2);
        let sent = job.notifier.sent();
        assert_eq!(sent[0].to, "a@example.com");
        assert!(sent[0].body.contains("Course X"));
        assert!(sent[0].body.contains("Course Y"));
        assert!(!sent[0].body.contains("Course Z"));
        assert_eq!(sent[1].to, "b@example.com");
        assert!(sent[1].body.contains("Course Z"));
        assert!(!sent[1].body.contains("Course X"));
    }

    #[tokio::test]
    async fn preview_groups_without_a_notifier() {
        let mut undated = overdue_row(3, "c@example.com", "Course W");
        undated.due_date = None;
        let store = FixedStore(vec![
            overdue_row(1, "a@example.com", "Course X"),
            undated,
            overdue_row(1, "a@example.com", "Course Y"),
        ]);

        let bundles = preview(&store).await.unwrap();

        assert_eq!(bundles.len(), 1);
        assert_eq!(bundles[0].0, 1);
        assert_eq!(bundles[0].1.courses.len(), 2);
        assert!(bundles[0].1.courses.iter().all(|c| c.days_overdue == 4));
    }

    #[tokio::test]
    async fn preview_reports_storage_failure() {
        assert!(matches!(preview(&BrokenStore).await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn empty_scan_sends_nothing() {
        let job = OverdueNotifier::new(FixedStore(Vec::new()), RecordingNotifier::default(), settings());

        let report = job.run_cycle().await.unwrap();

        assert_eq!(report, CycleReport::default());
        assert!(job.notifier.sent().is_empty());
    }

    #[tokio::test]
    async fn storage_failure_aborts_before_any_send() {
        let job = OverdueNotifier::new(BrokenStore, RecordingNotifier::default(), settings());

        let result = job.run_cycle().await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert!(job.notifier.sent().is_empty());
        // The scheduled entry point swallows the error after logging it.
        job.run().await;
    }

    #[tokio::test]
    async fn scheduling_twice_leaves_one_stopped_job() {
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        let job = Arc::new(OverdueNotifier::new(
            FixedStore(Vec::new()),
            RecordingNotifier::default(),
            settings(),
        ));

        schedule_overdue_notifications(&mut scheduler, job.clone(), "0 9 * * *").unwrap();
        schedule_overdue_notifications(&mut scheduler, job, "0 9 * * *").unwrap();

        assert_eq!(scheduler.job_names(), vec![JOB_NAME]);
        assert_eq!(scheduler.state(JOB_NAME), Some(JobState::Stopped));
    }

    #[test]
    fn invalid_schedule_is_rejected() {
        let mut scheduler = Scheduler::new(Arc::new(SystemClock));
        let job = Arc::new(OverdueNotifier::new(
            FixedStore(Vec::new()),
            RecordingNotifier::default(),
            settings(),
        ));

        let result = schedule_overdue_notifications(&mut scheduler, job, "every morning");

        assert!(matches!(result, Err(Error::InvalidSchedule(_))));
        assert!(scheduler.job_names().is_empty());
    }
}
