//! Persistent cookie-bearing HTTP transport bound to one portal origin.
//!
//! Redirects are followed manually so every hop is validated against the
//! configured origin before any I/O is issued toward it, and so the
//! portal's interstitial questionnaire can be dismissed and the original
//! request retried. The transport itself never follows redirects.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::header::{self, HeaderMap, HeaderValue, COOKIE};
use reqwest::{Client, Method, StatusCode};
use tracing::{debug, trace, warn};
use url::Url;

use crate::cookies::{CookieRecord, CookieStore};
use crate::errors::{Result, SigaaError};
use crate::page::{
    EXPIRED_SESSION_PATH, NavigationForm, Page, SKIP_QUESTIONNAIRE_ID, VIEW_STATE_FIELD,
    find_by_id,
};

/// Redirect hops allowed per logical request. Bounds worst-case looping on
/// a misbehaving or compromised remote.
const MAX_REDIRECTS: usize = 10;

/// Interstitial skip-and-retry attempts allowed per logical request.
const MAX_INTERSTITIAL_RETRIES: usize = 3;

/// Transport timeouts and seed cookies.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    /// Cookies from a previously exported session, for resumption.
    pub cookies: Vec<CookieRecord>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            cookies: Vec::new(),
        }
    }
}

/// One user's portal session: a lazily-built HTTP client, a cookie jar, and
/// the origin every request and redirect hop is validated against.
pub struct Session {
    origin: Url,
    config: SessionConfig,
    /// `Some` once the first request has been issued; cleared by [`close`].
    ///
    /// [`close`]: Session::close
    client: Mutex<Option<Client>>,
    cookies: Mutex<CookieStore>,
}

impl Session {
    pub fn new(origin: Url) -> Self {
        Self::with_config(origin, SessionConfig::default())
    }

    pub fn with_config(origin: Url, config: SessionConfig) -> Self {
        let cookies = CookieStore::from_records(&config.cookies);
        Self {
            origin,
            config,
            client: Mutex::new(None),
            cookies: Mutex::new(cookies),
        }
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    /// Export the cookie jar for persistence by the caller.
    pub fn export_cookies(&self) -> Vec<CookieRecord> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .export()
    }

    /// Release the transport. Idempotent, and safe to call before any
    /// request was ever made. Cookies survive so the session can be
    /// exported after closing.
    pub fn close(&self) {
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!("session transport released");
        }
    }

    pub async fn get(&self, target: &str) -> Result<Page> {
        self.request(Method::GET, target, None).await
    }

    pub async fn post(&self, target: &str, form: &IndexMap<String, String>) -> Result<Page> {
        self.request(Method::POST, target, Some(form)).await
    }

    /// Submit a recovered navigation form.
    pub async fn submit(&self, form: &NavigationForm) -> Result<Page> {
        self.post(form.action.as_str(), &form.fields).await
    }

    /// Perform one logical request, following redirects and dismissing the
    /// interstitial questionnaire when the portal inserts it.
    ///
    /// Each interstitial cycle issues exactly one skip submission followed
    /// by exactly one retry of the original request (with a fresh redirect
    /// counter). After [`MAX_INTERSTITIAL_RETRIES`] cycles the interstitial
    /// page is returned as-is so the caller can inspect it.
    pub async fn request(
        &self,
        method: Method,
        target: &str,
        form: Option<&IndexMap<String, String>>,
    ) -> Result<Page> {
        let mut attempt = 0;
        loop {
            let page = self.perform(method.clone(), target, form).await?;
            if !page.has_skip_questionnaire() {
                return Ok(page);
            }
            if attempt >= MAX_INTERSTITIAL_RETRIES {
                warn!(attempts = attempt, "interstitial questionnaire kept reappearing");
                return Ok(page);
            }
            attempt += 1;
            debug!(attempt, "dismissing interstitial questionnaire and retrying");
            self.skip_questionnaire(&page).await?;
        }
    }

    /// One request plus manual redirect following. No interstitial handling.
    async fn perform(
        &self,
        method: Method,
        target: &str,
        form: Option<&IndexMap<String, String>>,
    ) -> Result<Page> {
        let client = self.transport()?;
        let mut url = self.resolve(target)?;
        let mut method = method;
        let mut body = form.cloned();
        let mut hops = 0usize;

        loop {
            self.ensure_same_origin(&url)?;

            let mut builder = client.request(method.clone(), url.clone());
            if let Some(cookie_header) = self.cookie_header(&url) {
                builder = builder.header(COOKIE, cookie_header);
            }
            if let Some(fields) = body.as_ref() {
                builder = builder.form(fields);
            }
            let request = builder.build()?;
            let request_headers = request.headers().clone();
            trace!(%url, method = %method, "issuing request");

            let response = client.execute(request).await?;
            let status = response.status();
            let headers = response.headers().clone();
            self.cookies
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .store_response(response.url(), &headers);

            let location = headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            if let Some((next_method, keep_body)) = redirect_transform(status, &method)
                && let Some(location) = location
            {
                hops += 1;
                if hops > MAX_REDIRECTS {
                    return Err(SigaaError::connection("too many redirects"));
                }
                let next = url.join(&location).map_err(|e| {
                    SigaaError::connection_with(
                        format!("unresolvable redirect target '{location}'"),
                        e,
                    )
                })?;
                if next.as_str().contains(EXPIRED_SESSION_PATH) {
                    return Err(SigaaError::SessionExpired);
                }
                // Re-validated at the top of the loop before any I/O.
                trace!(hop = hops, target = %next, "following redirect");
                url = next;
                method = next_method;
                if !keep_body {
                    body = None;
                }
                continue;
            }

            let final_url = response.url().clone();
            let body_text = response.text().await?;
            return Page::from_parts(final_url, method, status, headers, request_headers, body_text);
        }
    }

    /// Submit the interstitial's "do not answer, continue" form once.
    async fn skip_questionnaire(&self, page: &Page) -> Result<()> {
        let Some(submission) = skip_submission(page) else {
            // Control present but its form is unusable; the retry will
            // surface the interstitial again and bail out via the cap.
            warn!("interstitial skip control has no usable form");
            return Ok(());
        };
        self.ensure_same_origin(&submission.action)?;

        let client = self.transport()?;
        let mut builder = client
            .post(submission.action.clone())
            .form(&submission.fields);
        if let Some(cookie_header) = self.cookie_header(&submission.action) {
            builder = builder.header(COOKIE, cookie_header);
        }
        let response = client.execute(builder.build()?).await?;
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .store_response(response.url(), response.headers());
        Ok(())
    }

    /// Lazily build (or reuse) the HTTP client.
    fn transport(&self) -> Result<Client> {
        let mut guard = self.client.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.read_timeout)
            .default_headers(default_headers())
            .build()
            .map_err(|e| SigaaError::connection_with("failed to build HTTP client", e))?;
        *guard = Some(client.clone());
        Ok(client)
    }

    /// Resolve a path or absolute URL against the session origin.
    fn resolve(&self, target: &str) -> Result<Url> {
        self.origin.join(target).map_err(|e| {
            SigaaError::connection_with(format!("invalid request target '{target}'"), e)
        })
    }

    /// Reject any URL whose host differs from the configured origin host.
    /// Runs before the initial request and before every redirect hop.
    fn ensure_same_origin(&self, url: &Url) -> Result<()> {
        let origin_host = self.origin.host_str().unwrap_or_default();
        let host = url.host_str().unwrap_or_default();
        if host != origin_host {
            return Err(SigaaError::SecurityViolation {
                origin: origin_host.to_owned(),
                host: host.to_owned(),
            });
        }
        Ok(())
    }

    fn cookie_header(&self, url: &Url) -> Option<String> {
        self.cookies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .header_for(url)
    }
}

/// How a redirect status transforms the follow-up request, if it is one the
/// engine follows: 301/302/303 demote to a bodyless GET, 307/308 preserve
/// method and body.
fn redirect_transform(status: StatusCode, method: &Method) -> Option<(Method, bool)> {
    match status.as_u16() {
        301 | 302 | 303 => Some((Method::GET, false)),
        307 | 308 => Some((method.clone(), true)),
        _ => None,
    }
}

/// The fixed header set every session request carries, including the
/// distinguishing client identifier the portal expects.
fn default_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::USER_AGENT,
        HeaderValue::from_static("SIGAA-Api/1.0 (https://github.com/GeovaneSchmitz/sigaa-api)"),
    );
    headers.insert(
        header::ACCEPT_ENCODING,
        HeaderValue::from_static("br, gzip, deflate"),
    );
    headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
    headers.insert(header::DNT, HeaderValue::from_static("1"));
    headers
}

/// Build the skip submission for an interstitial page: the control's
/// enclosing form, its id round-tripped JSF-style, and the page's
/// view-state token when present.
fn skip_submission(page: &Page) -> Option<NavigationForm> {
    let dom = page.dom();
    let control = find_by_id(&dom, SKIP_QUESTIONNAIRE_ID)?;
    let form = control
        .ancestors()
        .filter_map(html_scraper::ElementRef::wrap)
        .find(|el| el.value().name() == "form")?;
    let action_attr = form.attr("action")?;
    let form_id = form.attr("id")?;
    let action = page.url().join(action_attr).ok()?;

    let mut fields = IndexMap::new();
    fields.insert(form_id.to_owned(), form_id.to_owned());
    fields.insert(
        SKIP_QUESTIONNAIRE_ID.to_owned(),
        SKIP_QUESTIONNAIRE_ID.to_owned(),
    );
    if let Some(view_state) = page.view_state() {
        fields.insert(VIEW_STATE_FIELD.to_owned(), view_state.to_owned());
    }
    Some(NavigationForm { action, fields })
}
