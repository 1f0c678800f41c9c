//! Top-level portal client: institution selection, login, and account
//! discovery.

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::{debug, info};
use url::Url;

use crate::account::Account;
use crate::bond::STUDENT_PORTAL_PATH;
use crate::cookies::CookieRecord;
use crate::errors::{Result, SigaaError};
use crate::session::{Session, SessionConfig};

/// Login form target. The credentials travel as `user.login`/`user.senha`.
const LOGIN_PATH: &str = "/sigaa/logar.do?dispatch=logOn";

/// Login screen, fetched first to seed the session cookie.
const LOGIN_FORM_PATH: &str = "/sigaa/verTelaLogin.do";

/// Marker text on a rejected login response. Checked in both raw and
/// entity-encoded forms since the portal emits either depending on the
/// page variant.
const INVALID_CREDENTIALS_MARKERS: [&str; 2] =
    ["e/ou senha inválidos", "e/ou senha inv&aacute;lidos"];

/// The institutional deployments this engine targets. The engine is
/// purpose-built for these two portals' navigation quirks and does not
/// generalize to arbitrary hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Institution {
    Ifal,
    Ufal,
}

impl Institution {
    pub fn base_url(self) -> &'static str {
        match self {
            Self::Ifal => "https://sigaa.ifal.edu.br",
            Self::Ufal => "https://sigaa.sig.ufal.br",
        }
    }

    fn origin(self) -> Url {
        // Both base URLs are fixed, valid constants.
        Url::parse(self.base_url()).expect("institution base URL is valid")
    }
}

/// One user's connection to a SIGAA deployment.
pub struct SigaaClient {
    session: Arc<Session>,
    institution: Institution,
}

impl SigaaClient {
    pub fn new(institution: Institution) -> Self {
        Self::with_config(institution, SessionConfig::default())
    }

    /// Build a client with explicit transport configuration, including
    /// cookies exported from a previous session.
    pub fn with_config(institution: Institution, config: SessionConfig) -> Self {
        Self {
            session: Arc::new(Session::with_config(institution.origin(), config)),
            institution,
        }
    }

    pub fn institution(&self) -> Institution {
        self.institution
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Export the session's cookies for persistence.
    pub fn export_cookies(&self) -> Vec<CookieRecord> {
        self.session.export_cookies()
    }

    /// Release the session transport. Idempotent.
    pub fn close(&self) {
        self.session.close();
    }

    /// Authenticate with the portal's form login and return the
    /// landing-page account state.
    pub async fn login(&self, username: &str, password: &str) -> Result<Account> {
        // Seed the session cookie before posting credentials.
        self.session.get(LOGIN_FORM_PATH).await?;

        let mut form = IndexMap::new();
        form.insert("user.login".to_owned(), username.to_owned());
        form.insert("user.senha".to_owned(), password.to_owned());
        let page = self.session.post(LOGIN_PATH, &form).await?;

        if INVALID_CREDENTIALS_MARKERS
            .iter()
            .any(|marker| page.body().contains(marker))
        {
            debug!(institution = ?self.institution, "portal rejected credentials");
            return Err(SigaaError::InvalidCredentials);
        }

        let landing = if page.url().path().contains("discente") {
            page
        } else {
            self.session.get(STUDENT_PORTAL_PATH).await?
        };
        info!(institution = ?self.institution, "authenticated against portal");
        Ok(Account::from_landing_page(&self.session, &landing))
    }

    /// Resume a previously authenticated session (seeded via
    /// [`SessionConfig::cookies`]) by fetching the landing page directly.
    ///
    /// Fails with [`SigaaError::SessionExpired`] when the portal bounces
    /// the request back to its login screen.
    pub async fn resume(&self) -> Result<Account> {
        let page = self.session.get(STUDENT_PORTAL_PATH).await?;
        let path = page.url().path();
        if path.contains("login") || path.contains("verTelaLogin") {
            return Err(SigaaError::SessionExpired);
        }
        Ok(Account::from_landing_page(&self.session, &page))
    }
}
