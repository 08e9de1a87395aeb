use chrono::{NaiveDate, NaiveTime};
use serde::Serialize;

use crate::roster::Filiere;

pub const SHEET_COLUMNS: [&str; 6] = [
    "#",
    "Last name",
    "First name",
    "Field",
    "Presence",
    "Signature",
];

pub const PRESENT_MARK: &str = "✓";
pub const ABSENT_MARK: &str = "✗";

#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub subject_name: String,
    pub subject_code: String,
    pub teacher: String,
    pub date: String,
    pub start_time: String,
    pub end_time: String,
    pub delegate_name: String,
    pub notes: String,
}

#[derive(Debug, Clone)]
pub struct AttendanceLine {
    pub last_name: String,
    pub first_name: String,
    pub filiere: String,
    pub present: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SheetInfo {
    pub subject: String,
    pub code: String,
    pub teacher: String,
    pub date: String,
    pub time: String,
    pub delegate: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SheetRow {
    pub number: usize,
    pub last_name: String,
    pub first_name: String,
    pub field: String,
    pub presence: String,
    pub signature: String,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SheetStats {
    pub total: usize,
    pub present: usize,
    pub absent: usize,
    pub rate_percent: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttendanceSheet {
    pub title: String,
    pub file_name: String,
    pub info: SheetInfo,
    pub columns: Vec<String>,
    pub rows: Vec<SheetRow>,
    pub stats: SheetStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

pub fn attendance_stats(lines: &[AttendanceLine]) -> SheetStats {
    let total = lines.len();
    let present = lines.iter().filter(|l| l.present).count();
    let rate_percent = if total > 0 {
        ((present as f64 / total as f64) * 1000.0).round() / 10.0
    } else {
        0.0
    };
    SheetStats {
        total,
        present,
        absent: total - present,
        rate_percent,
    }
}

fn display_date(iso: &str) -> String {
    NaiveDate::parse_from_str(iso, "%Y-%m-%d")
        .map(|d| d.format("%d/%m/%Y").to_string())
        .unwrap_or_else(|_| iso.to_string())
}

fn display_time(raw: &str) -> String {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .map(|t| t.format("%H:%M").to_string())
        .unwrap_or_else(|_| raw.to_string())
}

/// Builds the printable attendance sheet for one session; rows keep the
/// order they are given in.
pub fn attendance_sheet(session: &SessionInfo, lines: &[AttendanceLine]) -> AttendanceSheet {
    let rows = lines
        .iter()
        .enumerate()
        .map(|(i, l)| SheetRow {
            number: i + 1,
            last_name: l.last_name.clone(),
            first_name: l.first_name.clone(),
            field: Filiere::label_for_key(&l.filiere),
            presence: if l.present { PRESENT_MARK } else { ABSENT_MARK }.to_string(),
            signature: String::new(),
        })
        .collect();

    let notes = Some(session.notes.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string);

    AttendanceSheet {
        title: format!("Attendance - {}", session.subject_name),
        file_name: format!("presence_{}_{}.pdf", session.subject_code, session.date),
        info: SheetInfo {
            subject: session.subject_name.clone(),
            code: session.subject_code.clone(),
            teacher: session.teacher.clone(),
            date: display_date(&session.date),
            time: format!(
                "{} - {}",
                display_time(&session.start_time),
                display_time(&session.end_time)
            ),
            delegate: session.delegate_name.clone(),
        },
        columns: SHEET_COLUMNS.iter().map(|c| c.to_string()).collect(),
        rows,
        stats: attendance_stats(lines),
        notes,
    }
}
