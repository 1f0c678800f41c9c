//! Aggregate statistics over a fetched transcript.
//!
//! Consumers of the engine render these directly; the pass/fail calculators
//! that interpret individual course grades live outside the engine and
//! consume the raw records instead.

use indexmap::IndexMap;
use serde::Serialize;

use crate::bond::TranscriptEntry;
use crate::utils::round2;

/// Points a semester's two units must sum to before a failed unit is
/// compensated, under the institution's published grading policy. Consumed
/// by external pass/fail calculators; preserved here as a documented
/// constant rather than re-derived.
pub const UNIT_COMPENSATION_THRESHOLD: f64 = 12.0;

/// Per-semester average over the subjects that have a final grade.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SemesterAverage {
    pub semester: String,
    pub average: f64,
    /// Subjects that contributed to the average.
    pub count: usize,
}

/// Whole-transcript statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistorySummary {
    pub general_average: f64,
    pub best_subject: Option<String>,
    pub best_grade: f64,
    pub semesters: Vec<SemesterAverage>,
}

/// Summarize a transcript. Subjects without a final grade are excluded from
/// every pool: the per-semester averages, the general average, and the
/// best-subject search. Averages use the portal's two-decimal display
/// precision.
pub fn summarize(history: &IndexMap<String, Vec<TranscriptEntry>>) -> HistorySummary {
    let mut all_grades = Vec::new();
    let mut best_grade = 0.0f64;
    let mut best_subject = None;
    let mut semesters = Vec::new();

    for (semester, entries) in history {
        let mut semester_grades = Vec::new();
        for entry in entries {
            let Some(grade) = entry.final_grade else {
                continue;
            };
            semester_grades.push(grade);
            all_grades.push(grade);
            if grade > best_grade {
                best_grade = grade;
                best_subject = Some(entry.subject.clone());
            }
        }
        if !semester_grades.is_empty() {
            let sum: f64 = semester_grades.iter().sum();
            semesters.push(SemesterAverage {
                semester: semester.clone(),
                average: round2(sum / semester_grades.len() as f64),
                count: semester_grades.len(),
            });
        }
    }

    let general_average = if all_grades.is_empty() {
        0.0
    } else {
        round2(all_grades.iter().sum::<f64>() / all_grades.len() as f64)
    };

    HistorySummary {
        general_average,
        best_subject,
        best_grade,
        semesters,
    }
}
