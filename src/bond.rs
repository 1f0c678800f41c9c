//! Student enrollment bond: course discovery and transcript history.
//!
//! A bond is one affiliation between the student and a program of study.
//! Its landing page lists the currently enrolled courses and links (through
//! a script-driven menu) to the historical transcript.

use std::sync::{Arc, LazyLock};

use html_scraper::{ElementRef, Html, Selector};
use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, warn};

use crate::course::Course;
use crate::errors::Result;
use crate::page::{NavigationForm, Page};
use crate::session::Session;
use crate::utils::{element_text, fold_text, parse_decimal_comma};

/// Landing page of the student portal.
pub(crate) const STUDENT_PORTAL_PATH: &str = "/sigaa/portais/discente/discente.jsf";

/// Header synonyms naming the subject/component column of a course table.
const COURSE_HEADER_SYNONYMS: [&str; 2] = ["Componente", "Disciplina"];

/// Transcript menu labels, tried in order.
const TRANSCRIPT_MENU_LABELS: [&str; 2] = ["Boletim", "Consultar Minhas Notas"];

/// Anchor-text fallbacks matching the same two entries.
static TRANSCRIPT_ANCHOR_RES: LazyLock<[Regex; 2]> = LazyLock::new(|| {
    [
        Regex::new(r"(?i)boletim").unwrap(),
        Regex::new(r"(?i)consultar\s.*notas").unwrap(),
    ]
});

/// Transcript columns that are never detail grades.
const NON_GRADE_HEADERS: [&str; 7] = ["créditos", "ch", "turma", "tipo", "código", "ano", "período"];

/// One subject's row in a semester of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptEntry {
    pub subject: String,
    pub final_grade: Option<f64>,
    pub absences: u32,
    pub status: String,
    pub grades: Vec<DetailGrade>,
}

/// A named per-assessment grade in a transcript row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetailGrade {
    pub name: String,
    pub value: f64,
}

/// One student affiliation, under which courses are listed.
pub struct Bond {
    session: Arc<Session>,
    registration: String,
    program: String,
    /// Context-switch URL for non-primary bonds; the landing page is reached
    /// through it instead of the portal path.
    switch_url: Option<String>,
    courses: Vec<Course>,
}

impl Bond {
    pub fn new(
        session: Arc<Session>,
        registration: String,
        program: String,
        switch_url: Option<String>,
    ) -> Self {
        Self {
            session,
            registration,
            program,
            switch_url,
            courses: Vec::new(),
        }
    }

    pub fn registration(&self) -> &str {
        &self.registration
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn switch_url(&self) -> Option<&str> {
        self.switch_url.as_deref()
    }

    /// Courses found by the last [`fetch_courses`] call.
    ///
    /// [`fetch_courses`]: Bond::fetch_courses
    pub fn courses(&self) -> &[Course] {
        &self.courses
    }

    async fn landing_page(&self) -> Result<Page> {
        match self.switch_url.as_deref() {
            Some(switch) => self.session.get(switch).await,
            None => self.session.get(STUDENT_PORTAL_PATH).await,
        }
    }

    /// Enumerate the bond's enrolled courses from its landing page.
    ///
    /// The previous enumeration is overwritten, not accumulated. Ordering
    /// follows table row order and no de-duplication is performed.
    pub async fn fetch_courses(&mut self) -> Result<&[Course]> {
        let page = self.landing_page().await?;
        self.courses = parse_courses(&self.session, &page);
        debug!(
            registration = self.registration.as_str(),
            count = self.courses.len(),
            "enumerated enrolled courses"
        );
        Ok(&self.courses)
    }

    /// Fetch the historical transcript, keyed by semester label.
    ///
    /// Transcript access is optional portal functionality: when no access
    /// path can be located the result is an empty mapping, not an error.
    /// Transport, security, and expiry failures still propagate.
    pub async fn fetch_history(&self) -> Result<IndexMap<String, Vec<TranscriptEntry>>> {
        let page = self.landing_page().await?;
        let Some(report) = self.open_transcript(&page).await? else {
            debug!(
                registration = self.registration.as_str(),
                "transcript access not available"
            );
            return Ok(IndexMap::new());
        };
        Ok(parse_transcript(&report))
    }

    /// Try each transcript access path in order; the first navigation that
    /// can be built wins.
    async fn open_transcript(&self, page: &Page) -> Result<Option<Page>> {
        for (label, anchor_re) in TRANSCRIPT_MENU_LABELS.iter().zip(TRANSCRIPT_ANCHOR_RES.iter()) {
            if let Some(form) = menu_navigation(page, label) {
                return Ok(Some(self.session.submit(&form).await?));
            }
            match anchor_target(page, anchor_re) {
                Some(AnchorTarget::Form(form)) => {
                    return Ok(Some(self.session.submit(&form).await?));
                }
                Some(AnchorTarget::Href(href)) => {
                    return Ok(Some(self.session.get(&href).await?));
                }
                None => {}
            }
        }
        Ok(None)
    }
}

/// Scan the landing page's tables for course rows and convert each row's
/// access handler into an enterable [`Course`].
fn parse_courses(session: &Arc<Session>, page: &Page) -> Vec<Course> {
    let dom = page.dom();
    let table_sel = Selector::parse("table").unwrap();
    let th_sel = Selector::parse("th").unwrap();
    let tr_sel = Selector::parse("tr").unwrap();
    let td_sel = Selector::parse("td").unwrap();

    let mut courses = Vec::new();
    for table in dom.select(&table_sel) {
        let headers: Vec<String> = table.select(&th_sel).map(|th| element_text(&th)).collect();
        let title_idx = headers.iter().position(|h| is_course_header(h));
        let mut is_course_table = title_idx.is_some();
        if !is_course_table {
            // No <th> header; inspect the first row as a fallback header.
            if let Some(first_row) = table.select(&tr_sel).next() {
                is_course_table = is_course_header(&element_text(&first_row));
            }
        }
        if !is_course_table {
            continue;
        }

        for row in table.select(&tr_sel) {
            if row.value().classes().any(|c| c == "periodo") {
                continue;
            }
            let row_text = element_text(&row);
            if row_text.contains("Componente Curricular") || row_text.contains("Disciplina") {
                continue;
            }
            let cells: Vec<ElementRef<'_>> = row.select(&td_sel).collect();
            if cells.is_empty() {
                continue;
            }
            let Some(title) = course_row_title(&cells, title_idx) else {
                continue;
            };
            let Some(handler) = access_handler(&row, &cells) else {
                debug!(course = title.as_str(), "row without a usable access handler, skipping");
                continue;
            };
            match page.recover_navigation(handler) {
                Ok(entry) => courses.push(Course::new(Arc::clone(session), title, entry)),
                Err(error) => {
                    debug!(course = title.as_str(), %error, "unusable access handler, skipping row");
                }
            }
        }
    }
    courses
}

fn is_course_header(text: &str) -> bool {
    COURSE_HEADER_SYNONYMS.iter().any(|syn| text.contains(syn))
}

/// Pick the subject name for a course row: the styled title span when
/// present, else the mapped header column, else a positional guess.
fn course_row_title(cells: &[ElementRef<'_>], title_idx: Option<usize>) -> Option<String> {
    let span_sel = Selector::parse("span.tituloDisciplina").unwrap();
    for cell in cells {
        if let Some(span) = cell.select(&span_sel).next() {
            return Some(element_text(&span));
        }
    }

    let cell = match title_idx {
        Some(idx) if idx < cells.len() => &cells[idx],
        _ => {
            if cells.len() < 2 {
                return None;
            }
            // Without a mapped header, the name is usually the second cell;
            // location-like text there means it is actually the first.
            let second = element_text(&cells[1]);
            if second.contains("Campus") || second.contains("Sala") {
                &cells[0]
            } else {
                &cells[1]
            }
        }
    };
    let title = element_text(cell);
    if title.is_empty() { None } else { Some(title) }
}

/// Find the row's clickable element carrying an inline-script handler,
/// preferring one whose title or text suggests entering the course.
fn access_handler<'a>(row: &ElementRef<'a>, cells: &[ElementRef<'a>]) -> Option<&'a str> {
    let a_sel = Selector::parse("a[onclick]").unwrap();
    for cell in cells {
        for anchor in cell.select(&a_sel) {
            let title = anchor.attr("title").unwrap_or_default();
            let text = element_text(&anchor);
            if fold_text(title).contains("discente") || fold_text(&text).contains("acessar") {
                return anchor.attr("onclick");
            }
        }
    }
    row.select(&a_sel).next().and_then(|a| a.attr("onclick"))
}

/// Resolve a jscook-style menu entry by exact label match: the cached menu
/// form's hidden inputs plus a `jscook_action` value scraped from the
/// page's inline scripts.
fn menu_navigation(page: &Page, label: &str) -> Option<NavigationForm> {
    let dom = page.dom();
    let form = menu_form(&dom)?;
    let action_attr = form.attr("action")?;
    let action = page.url().join(action_attr).ok()?;

    let input_sel = Selector::parse("input").unwrap();
    let mut fields = IndexMap::new();
    for input in form.select(&input_sel) {
        let Some(name) = input.attr("name") else { continue };
        fields.insert(
            name.to_owned(),
            input.attr("value").unwrap_or_default().to_owned(),
        );
    }

    let action_value = jscook_action(&dom, label)?;
    fields.insert("jscook_action".to_owned(), action_value);
    Some(NavigationForm { action, fields })
}

/// The student menu form, located by id or by its `jscook_action` input.
fn menu_form<'a>(dom: &'a Html) -> Option<ElementRef<'a>> {
    static MENU_FORM_ID_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"menu:form_menu_discente|menuForm").unwrap());

    let form_sel = Selector::parse("form").unwrap();
    let jscook_sel = Selector::parse(r#"input[name="jscook_action"]"#).unwrap();

    for form in dom.select(&form_sel) {
        if form.attr("id").is_some_and(|id| MENU_FORM_ID_RE.is_match(id)) {
            return Some(form);
        }
    }
    dom.select(&jscook_sel).next().and_then(|input| {
        input
            .ancestors()
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "form")
    })
}

/// Scan inline scripts for `'<label>','<action>'` menu wiring and return
/// the action for an exact label match.
fn jscook_action(dom: &Html, label: &str) -> Option<String> {
    let script_sel = Selector::parse("script").unwrap();
    let re = Regex::new(&format!(
        r#"['"]{}['"]\s*,\s*['"]([^'"]+)['"]"#,
        regex::escape(label)
    ))
    .ok()?;

    for script in dom.select(&script_sel) {
        let text: String = script.text().collect();
        if let Some(caps) = re.captures(&text) {
            return Some(caps[1].to_owned());
        }
    }
    None
}

enum AnchorTarget {
    Form(NavigationForm),
    Href(String),
}

/// Fallback transcript access: a direct anchor whose visible text or title
/// matches the label pattern.
fn anchor_target(page: &Page, re: &Regex) -> Option<AnchorTarget> {
    let dom = page.dom();
    let a_sel = Selector::parse("a").unwrap();

    for anchor in dom.select(&a_sel) {
        let text = element_text(&anchor);
        let title = anchor.attr("title").unwrap_or_default();
        if !re.is_match(&text) && !re.is_match(title) {
            continue;
        }
        if let Some(onclick) = anchor.attr("onclick") {
            match page.recover_navigation(onclick) {
                Ok(form) => return Some(AnchorTarget::Form(form)),
                Err(error) => {
                    debug!(%error, "transcript anchor handler unusable, trying next");
                    continue;
                }
            }
        }
        if let Some(href) = anchor.attr("href")
            && href != "#"
            && !href.is_empty()
        {
            return Some(AnchorTarget::Href(href.to_owned()));
        }
    }
    None
}

/// Column roles inferred from a transcript table's header row.
#[derive(Debug, Default, PartialEq)]
struct TranscriptColumns {
    name: Option<usize>,
    status: Option<usize>,
    absences: Option<usize>,
    final_grade: Option<usize>,
    /// Remaining columns holding per-assessment detail grades, with their
    /// header labels.
    details: Vec<(usize, String)>,
}

/// Assign roles to transcript header columns by synonym matching. Every
/// column that is neither a role column nor a known non-grade column is a
/// detail-grade column.
fn classify_transcript_headers(headers: &[String]) -> TranscriptColumns {
    let mut columns = TranscriptColumns::default();
    for (idx, header) in headers.iter().enumerate() {
        if header.contains("componente") || header.contains("disciplina") {
            columns.name = Some(idx);
        } else if header.contains("situação") || header.contains("status") {
            columns.status = Some(idx);
        } else if header.contains("faltas") {
            columns.absences = Some(idx);
        } else if header.contains("resultado") || header.contains("média") || header.contains("nota")
        {
            columns.final_grade = Some(idx);
        }
    }
    for (idx, header) in headers.iter().enumerate() {
        if Some(idx) == columns.name
            || Some(idx) == columns.status
            || Some(idx) == columns.absences
        {
            continue;
        }
        if Some(idx) == columns.final_grade
            && (header.contains("resultado")
                || header.contains("média")
                || header.contains("nota final"))
        {
            continue;
        }
        if NON_GRADE_HEADERS.contains(&header.as_str()) {
            continue;
        }
        columns.details.push((idx, header.clone()));
    }
    columns
}

/// Parse every report table on the transcript page. The table caption is
/// the semester label.
pub(crate) fn parse_transcript(page: &Page) -> IndexMap<String, Vec<TranscriptEntry>> {
    let dom = page.dom();
    let table_sel = Selector::parse("table.tabelaRelatorio").unwrap();
    let caption_sel = Selector::parse("caption").unwrap();
    let tr_sel = Selector::parse("tr").unwrap();
    let th_sel = Selector::parse("th").unwrap();
    let td_sel = Selector::parse("td").unwrap();

    let mut history = IndexMap::new();
    for table in dom.select(&table_sel) {
        let semester = table
            .select(&caption_sel)
            .next()
            .map(|c| element_text(&c))
            .unwrap_or_else(|| "Unknown".to_owned());

        let Some(header_row) = table
            .select(&tr_sel)
            .find(|row| row.select(&th_sel).next().is_some())
        else {
            continue;
        };
        let headers: Vec<String> = header_row
            .select(&th_sel)
            .map(|th| element_text(&th).to_lowercase())
            .collect();
        let columns = classify_transcript_headers(&headers);
        let Some(name_idx) = columns.name else { continue };

        let mut entries = Vec::new();
        for row in table.select(&tr_sel) {
            if row
                .value()
                .classes()
                .any(|c| c == "agrupador" || c == "titulo")
            {
                continue;
            }
            let cells: Vec<String> = row.select(&td_sel).map(|td| element_text(&td)).collect();
            if cells.is_empty() || name_idx >= cells.len() {
                continue;
            }

            let final_grade = columns
                .final_grade
                .and_then(|idx| cells.get(idx))
                .and_then(|raw| parse_decimal_comma(raw));
            let absences = columns
                .absences
                .and_then(|idx| cells.get(idx))
                .and_then(|raw| raw.trim().parse::<u32>().ok())
                .unwrap_or(0);
            let status = columns
                .status
                .and_then(|idx| cells.get(idx))
                .cloned()
                .unwrap_or_default();
            let grades = columns
                .details
                .iter()
                .filter_map(|(idx, label)| {
                    let value = parse_decimal_comma(cells.get(*idx)?)?;
                    Some(DetailGrade {
                        name: label.clone(),
                        value,
                    })
                })
                .collect();

            entries.push(TranscriptEntry {
                subject: cells[name_idx].clone(),
                final_grade,
                absences,
                status,
                grades,
            });
        }
        if !entries.is_empty() {
            history.insert(semester, entries);
        }
    }

    if history.is_empty() {
        warn!("transcript page contained no parseable report table");
    }
    history
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderMap;
    use reqwest::{Method, StatusCode};
    use url::Url;

    fn page(body: &str) -> Page {
        Page::from_parts(
            Url::parse("https://sigaa.ifal.edu.br/sigaa/portais/discente/discente.jsf").unwrap(),
            Method::GET,
            StatusCode::OK,
            HeaderMap::new(),
            HeaderMap::new(),
            body.to_owned(),
        )
        .unwrap()
    }

    fn session() -> Arc<Session> {
        Arc::new(Session::new(Url::parse("https://sigaa.ifal.edu.br").unwrap()))
    }

    const LANDING: &str = r#"
        <html><body>
        <form id="form_acessarTurma" action="/sigaa/portais/discente/turmas.jsf">
            <input type="hidden" name="form_acessarTurma" value="form_acessarTurma" />
            <input type="hidden" name="javax.faces.ViewState" value="j_id7" />
        </form>
        <table>
            <tr><th>Componente Curricular</th><th>Local</th></tr>
            <tr class="periodo"><td colspan="2">2024.1</td></tr>
            <tr>
                <td><span class="tituloDisciplina">CÁLCULO I</span></td>
                <td><a title="Acessar turma virtual (discente)"
                       onclick="jsfcljs(document.getElementById('form_acessarTurma'),{'idTurma':'101'},'');">Acessar</a></td>
            </tr>
            <tr>
                <td><span class="tituloDisciplina">FÍSICA I</span></td>
                <td>sem link</td>
            </tr>
        </table>
        </body></html>
    "#;

    #[test]
    fn courses_are_discovered_from_header_synonyms() {
        let page = page(LANDING);
        let courses = parse_courses(&session(), &page);
        assert_eq!(courses.len(), 1);
        assert_eq!(courses[0].title(), "CÁLCULO I");
        assert_eq!(courses[0].class_id(), Some("101"));
    }

    #[test]
    fn rows_without_handlers_are_skipped_not_failed() {
        let page = page(LANDING);
        let courses = parse_courses(&session(), &page);
        assert!(courses.iter().all(|c| c.title() != "FÍSICA I"));
    }

    #[test]
    fn menu_navigation_resolves_exact_label() {
        let body = r#"
            <form id="menu:form_menu_discente" action="/sigaa/portais/discente/discente.jsf">
                <input type="hidden" name="menu:form_menu_discente" value="menu:form_menu_discente" />
                <input type="hidden" name="javax.faces.ViewState" value="j_id3" />
                <input type="hidden" name="jscook_action" value="" />
            </form>
            <script>
                var menu = [['Boletim','menu_form_menu_discente_j_id_jsp_275447739_49_menu:A]#{ portaisMBean.boletim }'],
                            ['Atestado','menu:outro']];
            </script>
        "#;
        let page = page(body);
        let form = menu_navigation(&page, "Boletim").unwrap();
        assert_eq!(
            form.field("jscook_action"),
            Some("menu_form_menu_discente_j_id_jsp_275447739_49_menu:A]#{ portaisMBean.boletim }")
        );
        assert_eq!(form.field("javax.faces.ViewState"), Some("j_id3"));

        assert!(menu_navigation(&page, "Consultar Minhas Notas").is_none());
    }

    #[test]
    fn transcript_parses_semesters_and_placeholder_grades() {
        let body = r#"
            <table class="tabelaRelatorio">
                <caption>2023.1</caption>
                <tr><th>Componente Curricular</th><th>CH</th><th>Faltas</th><th>Situação</th><th>Nota 1</th><th>Resultado</th></tr>
                <tr class="agrupador"><td colspan="6">Obrigatórias</td></tr>
                <tr><td>Cálculo</td><td>80</td><td>4</td><td>APROVADO</td><td>6,9</td><td>7,2</td></tr>
                <tr><td>Física</td><td>80</td><td>0</td><td>CURSANDO</td><td>--</td><td>--</td></tr>
            </table>
            <table class="tabelaRelatorio">
                <caption>2023.2</caption>
                <tr><th>Componente Curricular</th><th>Faltas</th><th>Situação</th><th>Resultado</th></tr>
                <tr><td>Redes</td><td>2</td><td>APROVADO</td><td>8,8</td></tr>
            </table>
        "#;
        let history = parse_transcript(&page(body));
        assert_eq!(history.len(), 2);

        let first = &history["2023.1"];
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].subject, "Cálculo");
        assert_eq!(first[0].final_grade, Some(7.2));
        assert_eq!(first[0].absences, 4);
        assert_eq!(first[0].grades, vec![DetailGrade { name: "nota 1".to_owned(), value: 6.9 }]);

        // Placeholder grades stay null but the record itself is kept.
        assert_eq!(first[1].subject, "Física");
        assert_eq!(first[1].final_grade, None);
        assert!(first[1].grades.is_empty());

        assert_eq!(history["2023.2"][0].final_grade, Some(8.8));
    }

    #[test]
    fn grouping_rows_are_skipped() {
        let body = r#"
            <table class="tabelaRelatorio">
                <caption>2022.2</caption>
                <tr><th>Disciplina</th><th>Resultado</th></tr>
                <tr class="agrupador"><td>Optativas</td><td></td></tr>
                <tr><td>Lógica</td><td>9,0</td></tr>
            </table>
        "#;
        let history = parse_transcript(&page(body));
        let entries = &history["2022.2"];
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].subject, "Lógica");
    }

    #[test]
    fn header_classification_separates_roles_from_details() {
        let headers: Vec<String> = ["componente curricular", "ch", "faltas", "situação", "unid. 1", "unid. 2", "resultado"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let columns = classify_transcript_headers(&headers);
        assert_eq!(columns.name, Some(0));
        assert_eq!(columns.absences, Some(2));
        assert_eq!(columns.status, Some(3));
        assert_eq!(columns.final_grade, Some(6));
        assert_eq!(
            columns.details,
            vec![(4, "unid. 1".to_owned()), (5, "unid. 2".to_owned())]
        );
    }
}
