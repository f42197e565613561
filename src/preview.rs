use std::fmt::Write;
use std::path::Path;

use serde::Serialize;

use crate::models::UserOverdueBundle;

#[derive(Serialize)]
struct CsvRow<'a> {
    user_id: i32,
    user_name: &'a str,
    user_email: &'a str,
    course_title: &'a str,
    due_date: &'a str,
    days_overdue: i64,
}

#[derive(Serialize)]
struct JsonBundle<'a> {
    user_id: i32,
    #[serde(flatten)]
    bundle: &'a UserOverdueBundle,
}

pub fn summary(bundles: &[(i32, UserOverdueBundle)]) -> String {
    let mut output = String::new();

    if bundles.is_empty() {
        let _ = writeln!(output, "No overdue courses.");
        return output;
    }

    let courses: usize = bundles.iter().map(|(_, b)| b.courses.len()).sum();
    let _ = writeln!(
        output,
        "{} overdue courses across {} users:",
        courses,
        bundles.len()
    );
    for (_, bundle) in bundles {
        let _ = writeln!(output, "- {} ({})", bundle.user_name, bundle.user_email);
        for course in bundle.courses.iter() {
            let _ = writeln!(
                output,
                "  - {}: {} days overdue (due {})",
                course.title, course.days_overdue, course.due_date
            );
        }
    }

    output
}

pub fn to_json(bundles: &[(i32, UserOverdueBundle)]) -> anyhow::Result<String> {
    let view: Vec<JsonBundle> = bundles
        .iter()
        .map(|(user_id, bundle)| JsonBundle {
            user_id: *user_id,
            bundle,
        })
        .collect();
    Ok(serde_json::to_string_pretty(&view)?)
}

pub fn write_csv(path: &Path, bundles: &[(i32, UserOverdueBundle)]) -> anyhow::Result<usize> {
    let mut writer = csv::Writer::from_path(path)?;
    let mut written = 0usize;

    for (user_id, bundle) in bundles {
        for course in bundle.courses.iter() {
            writer.serialize(CsvRow {
                user_id: *user_id,
                user_name: &bundle.user_name,
                user_email: &bundle.user_email,
                course_title: &course.title,
                due_date: &course.due_date,
                days_overdue: course.days_overdue,
            })?;
            written += 1;
        }
    }

    writer.flush()?;
    Ok(written)
}
