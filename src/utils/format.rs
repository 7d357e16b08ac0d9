use crate::database::models::{AttendanceEntry, Session};
use crate::utils::time::{format_datetime_local, format_time_local};

pub fn format_attendance_list(entries: &[AttendanceEntry]) -> String {
    if entries.is_empty() {
        return "No one has checked in yet".to_string();
    }

    let mut sorted: Vec<&AttendanceEntry> = entries.iter().collect();
    sorted.sort_by_key(|entry| entry.scanned_at);

    let mut list = format!("Checked in ({}):\n", sorted.len());
    for entry in sorted {
        list.push_str(&format!(
            "  {} {}{}\n",
            format_time_local(entry.scanned_at),
            entry.display_name(),
            if entry.is_offline { " (offline)" } else { "" }
        ));
    }
    list
}

pub fn format_session(session: &Session) -> String {
    let mut line = format!(
        "#{} {} ({})",
        session.id,
        session.name,
        format_datetime_local(session.date)
    );
    if let Some(location) = &session.location {
        line.push_str(&format!(" @ {}", location));
    }
    line
}

/// The "N pending" indicator; nothing when everything is synced.
pub fn format_pending_badge(pending: i64) -> Option<String> {
    (pending > 0).then(|| format!("{} pending", pending))
}

pub fn format_error_message(error: &str) -> String {
    format!("❌ Error: {}", error)
}

pub fn format_success_message(message: &str) -> String {
    format!("✅ {}", message)
}

pub fn format_info_message(message: &str) -> String {
    format!("ℹ️ {}", message)
}
