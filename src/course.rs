//! One enrolled course: its micro-site navigation and the extraction of
//! current grades and attendance.
//!
//! The grade table is the portal's most irregular markup: two header rows,
//! grouped columns via `colspan`, ghost secondary-header cells that do not
//! align 1:1 with primary columns, and no stable marker for the student's
//! own data row. Parsing is a two-pass structural inference rather than a
//! fixed schema.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use html_scraper::{ElementRef, Html, Selector};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

use crate::errors::{Result, SigaaError};
use crate::page::{NavigationForm, Page, find_by_id};
use crate::session::Session;
use crate::utils::{element_text, fold_text, parse_decimal_comma};

/// Menu entry opening the grade report inside a course micro-site.
const GRADES_MENU_TEXT: &str = "Ver Notas";

/// Primary-header columns that never carry grade values.
const IGNORED_HEADERS: [&str; 7] = [
    "",
    "Matrícula",
    "Nome",
    "Sit.",
    "Faltas",
    "Resultado",
    "Situação",
];

/// Single-column retake/recovery headers. They carry a grade of their own
/// but never own secondary-row sub-assessment labels.
const SINGLE_GRADE_HEADERS: [&str; 2] = ["Reposição", "Recuperação"];

/// The portal displays "maximum absences" per class meeting while tracking
/// attendance in quarter-class units; the displayed maximum is scaled by
/// this factor before computing utilization. Site convention, not a general
/// formula.
pub const ABSENCE_UNITS_PER_MEETING: u32 = 4;

static TOTAL_ABSENCES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Total de Faltas:\s*(\d+)").unwrap());
static MAX_ABSENCES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Máximo de Faltas Permitido:\s*(\d+)").unwrap());

/// One graded assessment, either a standalone value or a named group of
/// ordered sub-assessments (a unit broken into partial evaluations).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "type")]
pub enum Grade {
    Single {
        name: String,
        value: Option<f64>,
    },
    Group {
        name: String,
        grades: Vec<SubGrade>,
    },
}

/// A named sub-assessment inside a grade group. `value` is `None` while the
/// assessment is ungraded.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubGrade {
    pub name: String,
    pub value: Option<f64>,
}

/// Attendance summary for one course.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Frequency {
    /// Absence units taken so far.
    pub absences: u32,
    /// Displayed per-meeting maximum.
    pub max_absences: u32,
    /// Share of the allowance used, in percent.
    pub percent: f64,
}

/// One enrolled subject, enterable through its recovered navigation form.
#[derive(Clone)]
pub struct Course {
    session: Arc<Session>,
    title: String,
    entry: NavigationForm,
    class_id: Option<String>,
}

impl Course {
    pub(crate) fn new(session: Arc<Session>, title: String, entry: NavigationForm) -> Self {
        let class_id = entry.field("idTurma").map(str::to_owned);
        Self {
            session,
            title,
            entry,
            class_id,
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    /// The portal's class id, when the entry form carried one.
    pub fn class_id(&self) -> Option<&str> {
        self.class_id.as_deref()
    }

    pub fn entry(&self) -> &NavigationForm {
        &self.entry
    }

    async fn enter(&self) -> Result<Page> {
        self.session.submit(&self.entry).await
    }

    /// Enter the course micro-site and extract the current grade table.
    ///
    /// Nothing is cached across calls; every fetch re-derives from a fresh
    /// page.
    pub async fn fetch_grades(&self) -> Result<Vec<Grade>> {
        let course_page = self.enter().await?;
        let nav = menu_handler_navigation(&course_page, |text| text == GRADES_MENU_TEXT)
            .ok_or_else(|| {
                SigaaError::NavigationNotFound(format!("'{GRADES_MENU_TEXT}' menu entry"))
            })?;
        let grades_page = self.session.submit(&nav).await?;
        let grades = parse_grade_table(&grades_page);
        debug!(course = self.title.as_str(), count = grades.len(), "extracted grades");
        Ok(grades)
    }

    /// Enter the course micro-site and extract the attendance summary.
    pub async fn fetch_frequency(&self) -> Result<Frequency> {
        let course_page = self.enter().await?;
        let nav = menu_handler_navigation(&course_page, |text| {
            fold_text(text).contains("frequencia")
        })
        .ok_or_else(|| SigaaError::NavigationNotFound("frequency menu entry".to_owned()))?;
        let page = self.session.submit(&nav).await?;
        Ok(parse_frequency(&page))
    }
}

/// Locate a menu entry by its visible text and convert the nearest
/// handler-carrying ancestor into a navigation form.
///
/// Menu entries are rendered as nested tags, so the clickable element is
/// rarely the text node's direct parent; the walk stops at `body`.
fn menu_handler_navigation(page: &Page, matches: impl Fn(&str) -> bool) -> Option<NavigationForm> {
    let dom = page.dom();
    for node in dom.tree.nodes() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        if !matches(text.trim()) {
            continue;
        }
        let mut current = node.parent();
        while let Some(parent) = current {
            if let Some(el) = ElementRef::wrap(parent) {
                let name = el.value().name();
                if name == "body" {
                    break;
                }
                if matches!(name, "td" | "div" | "a")
                    && let Some(onclick) = el.attr("onclick")
                    && let Ok(form) = page.recover_navigation(onclick)
                {
                    return Some(form);
                }
            }
            current = parent.parent();
        }
    }
    None
}

/// A primary-header cell: its text and the number of physical columns it
/// spans.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeaderCell {
    pub(crate) text: String,
    pub(crate) colspan: usize,
}

/// A secondary-header label with the element id that may link it to a
/// renameable assessment input.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SubHeader {
    pub(crate) text: String,
    pub(crate) id: String,
}

fn is_ignored_header(text: &str) -> bool {
    IGNORED_HEADERS.contains(&text)
}

fn is_single_grade_header(text: &str) -> bool {
    SINGLE_GRADE_HEADERS.contains(&text)
}

/// First pass: reconcile the two header rows.
///
/// The secondary row holds sub-assessment labels only under grouped
/// columns, but the raw markup can contain ghost cells that do not align
/// 1:1 with primary columns. Walking the primary row left to right,
/// identity/ignored columns and single-span recovery columns consume no
/// labels; every other column consumes `colspan` labels from the queue.
pub(crate) fn reconcile_sub_headers(
    primary: &[HeaderCell],
    queue: &[SubHeader],
) -> HashMap<usize, SubHeader> {
    let mut assigned = HashMap::new();
    let mut next = 0usize;
    let mut column = 0usize;

    for cell in primary {
        if is_ignored_header(&cell.text)
            || (is_single_grade_header(&cell.text) && cell.colspan == 1)
        {
            column += cell.colspan;
            continue;
        }
        for _ in 0..cell.colspan {
            if next < queue.len() {
                assigned.insert(column, queue[next].clone());
                next += 1;
            }
            column += 1;
        }
    }
    assigned
}

/// Second pass helper: the grade table has no stable row-role marker, so
/// the student's row is taken as the first whose second cell looks like a
/// personal name (longer than ten characters, containing alphabetic text).
pub(crate) fn find_student_row(rows: &[Vec<String>]) -> Option<usize> {
    rows.iter().position(|cells| {
        cells
            .get(1)
            .is_some_and(|name| name.chars().count() > 10 && name.chars().any(char::is_alphabetic))
    })
}

/// Parse the course grade report table.
///
/// Returns an empty list when the page carries no report table; a missing
/// table is a recoverable anomaly, not an error.
pub(crate) fn parse_grade_table(page: &Page) -> Vec<Grade> {
    let dom = page.dom();
    let table_sel = Selector::parse("table.tabelaRelatorio").unwrap();
    let thead_tr_sel = Selector::parse("thead tr").unwrap();
    let tbody_tr_sel = Selector::parse("tbody tr").unwrap();
    let th_sel = Selector::parse("th").unwrap();
    let td_sel = Selector::parse("td").unwrap();

    let Some(table) = dom.select(&table_sel).next() else {
        return Vec::new();
    };
    let header_rows: Vec<ElementRef<'_>> = table.select(&thead_tr_sel).collect();
    let Some(primary_row) = header_rows.first() else {
        return Vec::new();
    };

    let primary: Vec<HeaderCell> = primary_row
        .select(&th_sel)
        .map(|th| HeaderCell {
            text: element_text(&th),
            colspan: th
                .attr("colspan")
                .and_then(|c| c.trim().parse::<usize>().ok())
                .unwrap_or(1),
        })
        .collect();
    let queue: Vec<SubHeader> = header_rows
        .get(1)
        .map(|row| {
            row.select(&th_sel)
                .filter_map(|th| {
                    let text = element_text(&th);
                    if text.is_empty() {
                        return None;
                    }
                    Some(SubHeader {
                        text,
                        id: th.attr("id").unwrap_or_default().to_owned(),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let sub_headers = reconcile_sub_headers(&primary, &queue);

    let rows: Vec<Vec<String>> = table
        .select(&tbody_tr_sel)
        .map(|row| row.select(&td_sel).map(|td| element_text(&td)).collect())
        .collect();
    let Some(student_idx) = find_student_row(&rows) else {
        debug!("no row resembling the student's in grade table");
        return Vec::new();
    };
    let values = &rows[student_idx];

    let mut grades = Vec::new();
    let mut cell_idx = 0usize;
    for cell in &primary {
        if is_ignored_header(&cell.text) {
            cell_idx += cell.colspan;
            continue;
        }
        if cell.colspan == 1 {
            if let Some(raw) = values.get(cell_idx) {
                let value = parse_decimal_comma(raw);
                // A non-placeholder cell is kept even when unparseable, so
                // text statuses in numeric slots survive as null values.
                if value.is_some() || !matches!(raw.as_str(), "" | "-" | "--" | "S/N") {
                    grades.push(Grade::Single {
                        name: cell.text.clone(),
                        value,
                    });
                }
            }
            cell_idx += 1;
        } else {
            let mut sub_grades = Vec::new();
            for offset in 0..cell.colspan {
                let idx = cell_idx + offset;
                let Some(raw) = values.get(idx) else { break };
                if raw.is_empty() {
                    continue;
                }
                sub_grades.push(SubGrade {
                    name: sub_label(&dom, &sub_headers, idx),
                    value: parse_decimal_comma(raw),
                });
            }
            if !sub_grades.is_empty() {
                grades.push(Grade::Group {
                    name: cell.text.clone(),
                    grades: sub_grades,
                });
            }
            cell_idx += cell.colspan;
        }
    }
    grades
}

/// The label for a grouped sub-column: the reconciled secondary-header
/// text, refined by the renameable-assessment input when the header id
/// encodes a grade identifier, defaulting to a generic label.
fn sub_label(dom: &Html, assigned: &HashMap<usize, SubHeader>, column: usize) -> String {
    let Some(sub) = assigned.get(&column) else {
        return "Nota".to_owned();
    };
    if let Some(grade_id) = sub.id.strip_prefix("aval_")
        && let Some(input) = find_by_id(dom, &format!("denAval_{grade_id}"))
        && let Some(value) = input.attr("value")
        && !value.is_empty()
    {
        return value.to_owned();
    }
    sub.text.clone()
}

/// Extract the attendance summary from the frequency page.
///
/// The page is scanned as plain text, not table-parsed; the two labeled
/// integers are the only stable structure it offers.
pub(crate) fn parse_frequency(page: &Page) -> Frequency {
    let dom = page.dom();
    let text: String = dom.root_element().text().collect();

    let absences = capture_u32(&TOTAL_ABSENCES_RE, &text).unwrap_or(0);
    let max_absences = capture_u32(&MAX_ABSENCES_RE, &text).unwrap_or(0);
    let percent = if max_absences > 0 {
        f64::from(absences) / f64::from(max_absences * ABSENCE_UNITS_PER_MEETING) * 100.0
    } else {
        0.0
    };
    Frequency {
        absences,
        max_absences,
        percent,
    }
}

fn capture_u32(re: &Regex, text: &str) -> Option<u32> {
    re.captures(text).and_then(|caps| caps[1].parse().ok())
}
