//! The authenticated student's landing-page identity and active bonds.

use std::sync::Arc;

use html_scraper::{Html, Selector};
use tracing::debug;

use crate::bond::Bond;
use crate::page::Page;
use crate::session::Session;
use crate::utils::element_text;

/// Account state parsed from the student portal's landing page.
pub struct Account {
    name: Option<String>,
    bonds: Vec<Bond>,
}

impl Account {
    /// Parse the landing page for the student's identity and bonds.
    ///
    /// The primary bond comes from the profile panel's labeled values; any
    /// context-switch links yield additional bonds whose registration is
    /// unknown until the switch page is entered.
    pub fn from_landing_page(session: &Arc<Session>, page: &Page) -> Self {
        let dom = page.dom();
        let name = student_name(&dom);
        let registration = labeled_value(&dom, "Matrícula");
        let program = labeled_value(&dom, "Curso");

        let mut bonds = Vec::new();
        if let Some(registration) = registration {
            bonds.push(Bond::new(
                Arc::clone(session),
                registration,
                program.unwrap_or_default(),
                None,
            ));
        }
        for (label, href) in bond_switch_links(&dom) {
            bonds.push(Bond::new(
                Arc::clone(session),
                String::new(),
                label,
                Some(href),
            ));
        }
        debug!(bonds = bonds.len(), "parsed landing page account state");

        Self { name, bonds }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Active bonds, primary first.
    pub fn bonds(&self) -> &[Bond] {
        &self.bonds
    }

    pub fn into_bonds(self) -> Vec<Bond> {
        self.bonds
    }
}

/// The logged-in user's display name from the portal header.
fn student_name(dom: &Html) -> Option<String> {
    let sel = Selector::parse("p.usuario span, p.usuario").unwrap();
    dom.select(&sel)
        .map(|el| element_text(&el))
        .find(|text| !text.is_empty())
}

/// Find the value following a `<label>:` marker in the profile panel. The
/// value is either in the same text node after the colon or in the next
/// non-empty text node (a sibling table cell).
fn labeled_value(dom: &Html, label: &str) -> Option<String> {
    let mut nodes = dom.tree.nodes();
    while let Some(node) = nodes.next() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let trimmed = text.trim();
        let Some(rest) = trimmed.strip_prefix(label) else {
            continue;
        };
        let Some(rest) = rest.trim_start().strip_prefix(':') else {
            continue;
        };
        let rest = rest.trim();
        if !rest.is_empty() {
            return Some(rest.to_owned());
        }
        for follow in nodes.by_ref() {
            if let Some(follow_text) = follow.value().as_text() {
                let follow_text = follow_text.trim();
                if !follow_text.is_empty() {
                    return Some(follow_text.to_owned());
                }
            }
        }
        return None;
    }
    None
}

/// Context-switch links for non-primary bonds, as `(visible text, href)`.
fn bond_switch_links(dom: &Html) -> Vec<(String, String)> {
    let sel = Selector::parse("a[href]").unwrap();
    dom.select(&sel)
        .filter_map(|anchor| {
            let href = anchor.attr("href")?;
            if !href.contains("dispatch=escolher") {
                return None;
            }
            Some((element_text(&anchor), href.to_owned()))
        })
        .collect()
}
