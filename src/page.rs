//! One fetched portal page.
//!
//! A [`Page`] is an immutable snapshot of a completed HTTP exchange. The
//! portal is a JSF application: navigation happens through hidden forms
//! triggered by inline script handlers, validated server-side by a
//! view-state token the page carries in a hidden field. [`Page`] classifies
//! session expiry at construction time and recovers submittable
//! [`NavigationForm`]s from those script handlers.

use std::sync::{LazyLock, OnceLock};

use html_scraper::{ElementRef, Html, Selector};
use indexmap::IndexMap;
use regex::Regex;
use reqwest::header::{HeaderMap, LOCATION};
use reqwest::{Method, StatusCode};
use url::Url;

use crate::errors::{Result, SigaaError};

/// Path the portal redirects to when the server-side session is gone.
pub(crate) const EXPIRED_SESSION_PATH: &str = "/sigaa/expirada.jsp";

/// Hidden field carrying the server-side view-state token. The token is an
/// opaque value owned by the server; it is read from one page and
/// resubmitted with the next interaction, never cached beyond that.
pub(crate) const VIEW_STATE_FIELD: &str = "javax.faces.ViewState";

/// Id of the "do not answer, continue" control on the interstitial
/// questionnaire page.
pub(crate) const SKIP_QUESTIONNAIRE_ID: &str = "btnNaoResponderContinuarSigaa";

/// A submittable form recovered from an inline-script navigation handler:
/// the resolved action URL plus the field map the server expects back.
///
/// Ephemeral by design. A `NavigationForm` captures one page's hidden-form
/// state and is consumed by the next request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavigationForm {
    pub action: Url,
    pub fields: IndexMap<String, String>,
}

impl NavigationForm {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Immutable snapshot of one HTTP response.
pub struct Page {
    url: Url,
    method: Method,
    status: StatusCode,
    headers: HeaderMap,
    request_headers: HeaderMap,
    body: String,
    view_state: OnceLock<Option<String>>,
}

impl Page {
    /// Build a page from a completed response.
    ///
    /// Expiry is classified before anything else is derived: a redirect
    /// whose target is the expiration resource, or a final URL landing on
    /// it, fails with [`SigaaError::SessionExpired`] and the DOM and
    /// view-state are never computed.
    pub fn from_parts(
        url: Url,
        method: Method,
        status: StatusCode,
        headers: HeaderMap,
        request_headers: HeaderMap,
        body: String,
    ) -> Result<Self> {
        if status.is_redirection()
            && let Some(location) = headers.get(LOCATION).and_then(|v| v.to_str().ok())
            && location.contains(EXPIRED_SESSION_PATH)
        {
            return Err(SigaaError::SessionExpired);
        }
        if url.as_str().contains(EXPIRED_SESSION_PATH) {
            return Err(SigaaError::SessionExpired);
        }
        Ok(Self {
            url,
            method,
            status,
            headers,
            request_headers,
            body,
            view_state: OnceLock::new(),
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn request_headers(&self) -> &HeaderMap {
        &self.request_headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Parse the body into a DOM.
    ///
    /// The document type is not kept on the page: it is not thread-safe, so
    /// callers parse, extract owned data synchronously, and drop it before
    /// the next await point.
    pub fn dom(&self) -> Html {
        Html::parse_document(&self.body)
    }

    /// The server's view-state token, if the page carries one. Memoized.
    pub fn view_state(&self) -> Option<&str> {
        self.view_state
            .get_or_init(|| {
                let sel =
                    Selector::parse(r#"input[name="javax.faces.ViewState"]"#).unwrap();
                self.dom()
                    .select(&sel)
                    .next()
                    .and_then(|input| input.attr("value").map(str::to_owned))
            })
            .as_deref()
    }

    /// Whether the page is the interstitial questionnaire (carries the
    /// "do not answer, continue" control).
    pub(crate) fn has_skip_questionnaire(&self) -> bool {
        find_by_id(&self.dom(), SKIP_QUESTIONNAIRE_ID).is_some()
    }

    /// Recover a submittable form from an inline-script navigation handler.
    ///
    /// Two handler shapes are recognized: a bare
    /// `document.getElementById('<form-id>')` form reference, and the same
    /// reference followed by an inline object literal of extra field pairs.
    /// Field values start from the referenced form's current input values
    /// (submit-type inputs excluded); literal pairs are overlaid on top and
    /// take precedence, since they carry the clicked link's intent (which
    /// row or column was activated).
    pub fn recover_navigation(&self, script: &str) -> Result<NavigationForm> {
        let form_id = form_reference(script)?;
        let dom = self.dom();
        let form = find_by_id(&dom, &form_id).ok_or_else(|| {
            SigaaError::MalformedNavigation(format!("form '{form_id}' not present in page"))
        })?;
        let action_attr = form.attr("action").ok_or_else(|| {
            SigaaError::MalformedNavigation(format!("form '{form_id}' has no action"))
        })?;
        let action = self.url.join(action_attr).map_err(|e| {
            SigaaError::MalformedNavigation(format!("unresolvable form action '{action_attr}': {e}"))
        })?;

        let input_sel = Selector::parse("input").unwrap();
        let mut fields = IndexMap::new();
        for input in form.select(&input_sel) {
            if input
                .attr("type")
                .is_some_and(|t| t.eq_ignore_ascii_case("submit"))
            {
                continue;
            }
            let Some(name) = input.attr("name") else { continue };
            fields.insert(
                name.to_owned(),
                input.attr("value").unwrap_or_default().to_owned(),
            );
        }
        for (key, value) in literal_pairs(script) {
            fields.insert(key, value);
        }

        Ok(NavigationForm { action, fields })
    }
}

/// Locate an element by its raw id attribute. JSF ids contain `:` so a CSS
/// id selector cannot be used.
pub(crate) fn find_by_id<'a>(dom: &'a Html, id: &str) -> Option<ElementRef<'a>> {
    let sel = Selector::parse(&format!(r#"[id="{id}"]"#)).ok()?;
    dom.select(&sel).next()
}

/// Extract the form id from the handler's `document.getElementById('...')`
/// reference.
fn form_reference(script: &str) -> Result<String> {
    static FORM_REF_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"document\.getElementById\('([^']+)'\)").unwrap()
    });

    if !script.contains("getElementById") {
        return Err(SigaaError::MalformedNavigation(
            "no element-id reference in handler".to_owned(),
        ));
    }
    FORM_REF_RE
        .captures(script)
        .map(|caps| caps[1].to_owned())
        .ok_or_else(|| {
            SigaaError::MalformedNavigation("element-id reference without form id".to_owned())
        })
}

/// Extract `'key': 'value'` pairs from the optional inline object literal
/// following the form reference. Only string-valued pairs are meaningful to
/// the portal; anything else is ignored.
fn literal_pairs(script: &str) -> Vec<(String, String)> {
    static OBJECT_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r",\s*\{(.*?)\}").unwrap());
    static PAIR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"['"]([^'"]+)['"]\s*:\s*['"]([^'"]*)['"]"#).unwrap()
    });

    let Some(object) = OBJECT_RE.captures(script) else {
        return Vec::new();
    };
    PAIR_RE
        .captures_iter(&object[1])
        .map(|caps| (caps[1].to_owned(), caps[2].to_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, body: &str) -> Page {
        Page::from_parts(
            Url::parse(url).unwrap(),
            Method::GET,
            StatusCode::OK,
            HeaderMap::new(),
            HeaderMap::new(),
            body.to_owned(),
        )
        .unwrap()
    }

    const PORTAL_BODY: &str = r#"
        <html><body>
        <form id="form_menu" action="/sigaa/portais/discente/discente.jsf" method="post">
            <input type="hidden" name="form_menu" value="form_menu" />
            <input type="hidden" name="javax.faces.ViewState" value="j_id42" />
            <input type="submit" name="go" value="Go" />
        </form>
        <a onclick="jsfcljs(document.getElementById('form_menu'),{'form_menu:link':'form_menu:link','idTurma':'5821'},'');">Acessar</a>
        </body></html>
    "#;

    #[test]
    fn redirect_to_expiration_resource_fails_construction() {
        let mut headers = HeaderMap::new();
        headers.insert(
            LOCATION,
            "/sigaa/expirada.jsp".parse().unwrap(),
        );
        let result = Page::from_parts(
            Url::parse("https://sigaa.ifal.edu.br/sigaa/portais/discente/discente.jsf").unwrap(),
            Method::GET,
            StatusCode::FOUND,
            headers,
            HeaderMap::new(),
            String::new(),
        );
        assert!(matches!(result, Err(SigaaError::SessionExpired)));
    }

    #[test]
    fn landing_on_expiration_resource_fails_construction() {
        let result = Page::from_parts(
            Url::parse("https://sigaa.ifal.edu.br/sigaa/expirada.jsp").unwrap(),
            Method::GET,
            StatusCode::OK,
            HeaderMap::new(),
            HeaderMap::new(),
            String::new(),
        );
        assert!(matches!(result, Err(SigaaError::SessionExpired)));
    }

    #[test]
    fn ordinary_redirect_constructs() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, "/sigaa/verPortalDiscente.do".parse().unwrap());
        let page = Page::from_parts(
            Url::parse("https://sigaa.ifal.edu.br/sigaa/logar.do").unwrap(),
            Method::POST,
            StatusCode::FOUND,
            headers,
            HeaderMap::new(),
            String::new(),
        );
        assert!(page.is_ok());
    }

    #[test]
    fn view_state_is_extracted() {
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", PORTAL_BODY);
        assert_eq!(page.view_state(), Some("j_id42"));
    }

    #[test]
    fn recovers_navigation_with_literal_overlay() {
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", PORTAL_BODY);
        let script = "jsfcljs(document.getElementById('form_menu'),{'form_menu:link':'form_menu:link','idTurma':'5821'},'');";
        let form = page.recover_navigation(script).unwrap();

        assert_eq!(
            form.action.as_str(),
            "https://sigaa.ifal.edu.br/sigaa/portais/discente/discente.jsf"
        );
        assert_eq!(form.field("form_menu"), Some("form_menu"));
        assert_eq!(form.field("javax.faces.ViewState"), Some("j_id42"));
        assert_eq!(form.field("idTurma"), Some("5821"));
        // Submit inputs never enter the field map.
        assert_eq!(form.field("go"), None);
    }

    #[test]
    fn recovery_is_idempotent() {
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", PORTAL_BODY);
        let script = "jsfcljs(document.getElementById('form_menu'),{'idTurma':'5821'},'');";
        let first = page.recover_navigation(script).unwrap();
        let second = page.recover_navigation(script).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn literal_pairs_take_precedence_over_form_inputs() {
        let body = r#"
            <form id="f" action="/sigaa/a.jsf">
                <input type="hidden" name="row" value="0" />
            </form>
        "#;
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", body);
        let form = page
            .recover_navigation("jsfcljs(document.getElementById('f'),{'row':'7'},'');")
            .unwrap();
        assert_eq!(form.field("row"), Some("7"));
    }

    #[test]
    fn handler_without_reference_is_malformed() {
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", PORTAL_BODY);
        let result = page.recover_navigation("window.open('somewhere');");
        assert!(matches!(result, Err(SigaaError::MalformedNavigation(_))));
    }

    #[test]
    fn handler_referencing_missing_form_is_malformed() {
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", PORTAL_BODY);
        let result =
            page.recover_navigation("jsfcljs(document.getElementById('nope'),{},'');");
        assert!(matches!(result, Err(SigaaError::MalformedNavigation(_))));
    }

    #[test]
    fn form_without_action_is_malformed() {
        let body = r#"<form id="f"><input name="a" value="1" /></form>"#;
        let page = page("https://sigaa.ifal.edu.br/sigaa/x.jsf", body);
        let result = page.recover_navigation("jsfcljs(document.getElementById('f'),{},'');");
        assert!(matches!(result, Err(SigaaError::MalformedNavigation(_))));
    }
}
