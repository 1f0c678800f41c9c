//! Automation engine for the SIGAA academic portal.
//!
//! SIGAA is a server-rendered JSF application: navigation happens through
//! hidden forms triggered by inline script handlers and is validated by
//! server-held view state, so scraping it means reverse-engineering a
//! stateful, non-RESTful protocol. This crate owns that protocol on behalf
//! of a single student: it authenticates, walks the session-dependent
//! multi-page workflow, and extracts structured grade, attendance, and
//! transcript records from the portal's heterogeneous HTML tables.
//!
//! The engine defends its caller on two fronts. Every request and redirect
//! hop is validated against the configured institutional origin before any
//! I/O, blocking SSRF through attacker-controlled redirect chains. And
//! because the server's per-session view state is corrupted by overlapping
//! submissions, multi-request navigation sequences run under an explicit
//! queue-of-one gate ([`orchestrator::NavigationGate`]).
//!
//! ```no_run
//! use sigaa::{Institution, Orchestrator, SigaaClient};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> sigaa::Result<()> {
//! let client = SigaaClient::new(Institution::Ifal);
//! let account = client.login("20240001", "secret").await?;
//!
//! let mut bonds = account.into_bonds();
//! let bond = &mut bonds[0];
//! let courses = bond.fetch_courses().await?.to_vec();
//!
//! let orchestrator = Orchestrator::new().with_frequency();
//! let results = orchestrator
//!     .collect(&courses, &[], &CancellationToken::new())
//!     .await;
//!
//! let history = bond.fetch_history().await?;
//! let summary = sigaa::summary::summarize(&history);
//! # let _ = (results, summary);
//! client.close();
//! # Ok(())
//! # }
//! ```

pub mod account;
pub mod bond;
pub mod client;
pub mod cookies;
pub mod course;
mod errors;
pub mod orchestrator;
pub mod page;
pub mod session;
pub mod summary;
mod utils;

pub use account::Account;
pub use bond::{Bond, DetailGrade, TranscriptEntry};
pub use client::{Institution, SigaaClient};
pub use cookies::CookieRecord;
pub use course::{Course, Frequency, Grade, SubGrade};
pub use errors::{Result, SigaaError};
pub use orchestrator::{CourseData, NavigationGate, Orchestrator};
pub use page::{NavigationForm, Page};
pub use session::{Session, SessionConfig};
pub use summary::{HistorySummary, SemesterAverage};
