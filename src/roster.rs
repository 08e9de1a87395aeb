use std::fmt;
use std::io::Read;
use std::path::Path;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Filiere {
    Informatique,
    Mathematiques,
    Physique,
    Chimie,
    Biologie,
    Economie,
    Gestion,
}

impl Filiere {
    pub const ALL: [Filiere; 7] = [
        Filiere::Informatique,
        Filiere::Mathematiques,
        Filiere::Physique,
        Filiere::Chimie,
        Filiere::Biologie,
        Filiere::Economie,
        Filiere::Gestion,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Filiere::Informatique => "informatique",
            Filiere::Mathematiques => "mathematiques",
            Filiere::Physique => "physique",
            Filiere::Chimie => "chimie",
            Filiere::Biologie => "biologie",
            Filiere::Economie => "economie",
            Filiere::Gestion => "gestion",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Filiere::Informatique => "Informatique",
            Filiere::Mathematiques => "Mathématiques",
            Filiere::Physique => "Physique",
            Filiere::Chimie => "Chimie",
            Filiere::Biologie => "Biologie",
            Filiere::Economie => "Économie",
            Filiere::Gestion => "Gestion",
        }
    }

    /// Accepts either the stored key or the display label, ignoring case.
    pub fn parse(raw: &str) -> Option<Filiere> {
        let t = raw.trim().to_lowercase();
        if t.is_empty() {
            return None;
        }
        Filiere::ALL
            .into_iter()
            .find(|f| f.key() == t || f.label().to_lowercase() == t)
    }

    /// Label for a stored key; unknown keys are shown as stored.
    pub fn label_for_key(key: &str) -> String {
        Filiere::parse(key)
            .map(|f| f.label().to_string())
            .unwrap_or_else(|| key.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RosterRow {
    pub row: usize,
    pub last_name: String,
    pub first_name: String,
    pub filiere: Filiere,
    pub student_no: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowProblem {
    MissingData,
    UnknownFiliere(String),
    Unreadable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowError {
    pub row: usize,
    pub problem: RowProblem,
}

impl fmt::Display for RowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.problem {
            RowProblem::MissingData => write!(f, "Row {}: missing data", self.row),
            RowProblem::UnknownFiliere(v) => {
                write!(f, "Row {}: unknown field of study '{}'", self.row, v)
            }
            RowProblem::Unreadable(e) => write!(f, "Row {}: error - {}", self.row, e),
        }
    }
}

#[derive(Debug, Default)]
pub struct RosterSheet {
    pub rows: Vec<RosterRow>,
    pub errors: Vec<RowError>,
}

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to open roster file: {0}")]
    Io(#[from] std::io::Error),
    #[error("roster is not a readable spreadsheet export: {0}")]
    Csv(#[from] csv::Error),
}

pub fn read_roster_file(path: &Path) -> Result<RosterSheet, RosterError> {
    let file = std::fs::File::open(path)?;
    parse_roster(file)
}

/// Reads a roster sheet exported as CSV.
///
/// Columns: last name, first name, field of study, student number and an
/// optional email. The first line is a header. Rows are numbered the way a
/// spreadsheet shows them, so the first data row is row 2.
pub fn parse_roster<R: Read>(input: R) -> Result<RosterSheet, RosterError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(input);
    // Surface a broken header as a file-level failure.
    reader.headers()?;

    let mut sheet = RosterSheet::default();
    for (i, record) in reader.records().enumerate() {
        let fallback_row = i + 2;
        let record = match record {
            Ok(r) => r,
            Err(e) => {
                let row = e
                    .position()
                    .map(|p| p.line() as usize)
                    .unwrap_or(fallback_row);
                sheet.errors.push(RowError {
                    row,
                    problem: RowProblem::Unreadable(e.to_string()),
                });
                continue;
            }
        };
        let row = record
            .position()
            .map(|p| p.line() as usize)
            .unwrap_or(fallback_row);

        let cell = |idx: usize| record.get(idx).map(str::trim).unwrap_or("").to_string();
        let last_name = cell(0);
        let first_name = cell(1);
        let filiere_raw = cell(2);
        let student_no = cell(3);
        let email = cell(4);

        if [&last_name, &first_name, &filiere_raw, &student_no]
            .iter()
            .all(|c| c.is_empty())
        {
            continue;
        }
        if [&last_name, &first_name, &filiere_raw, &student_no]
            .iter()
            .any(|c| c.is_empty())
        {
            sheet.errors.push(RowError {
                row,
                problem: RowProblem::MissingData,
            });
            continue;
        }
        let Some(filiere) = Filiere::parse(&filiere_raw) else {
            sheet.errors.push(RowError {
                row,
                problem: RowProblem::UnknownFiliere(filiere_raw.to_lowercase()),
            });
            continue;
        };

        sheet.rows.push(RosterRow {
            row,
            last_name,
            first_name,
            filiere,
            student_no,
            email,
        });
    }
    Ok(sheet)
}
