//! Per-vendor IMAP search filters.
//!
//! One active filter per vendor, mutated by an administrative surface and
//! read here. A vendor with no configured filter gets a permissive default
//! so ingestion never fails on missing configuration.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::DatabaseError;
use crate::store::Database;

/// Default lookback window when no filter is configured.
const DEFAULT_DAYS_BACK: u32 = 7;
/// Default attachment pattern — CRM reports arrive as CSV unless configured.
const DEFAULT_FILE_PATTERN: &str = r"\.csv$";

/// A vendor's IMAP search filter (`imap_filters` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionFilter {
    pub vendor: String,
    pub from_address: Option<String>,
    pub subject_regex: Option<String>,
    pub days_back: u32,
    pub file_pattern: String,
    pub active: bool,
    pub last_used: Option<DateTime<Utc>>,
}

impl IngestionFilter {
    /// The hard-coded permissive default: match all subjects, 7 days back,
    /// CSV attachments only.
    pub fn default_for(vendor: &str) -> Self {
        Self {
            vendor: vendor.to_string(),
            from_address: None,
            subject_regex: None,
            days_back: DEFAULT_DAYS_BACK,
            file_pattern: DEFAULT_FILE_PATTERN.to_string(),
            active: true,
            last_used: None,
        }
    }
}

/// Server-side search terms derived from a filter.
///
/// True regex matching happens client-side after fetch; the server only gets
/// terms IMAP SEARCH can express.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    pub unseen: bool,
    pub from: Option<String>,
    pub subject_literal: Option<String>,
    pub since: DateTime<Utc>,
}

impl SearchCriteria {
    /// Render as an IMAP SEARCH argument string.
    pub fn to_imap_query(&self) -> String {
        let mut parts = Vec::new();
        if self.unseen {
            parts.push("UNSEEN".to_string());
        }
        if let Some(ref from) = self.from {
            parts.push(format!("FROM \"{}\"", escape_quoted(from)));
        }
        if let Some(ref subject) = self.subject_literal {
            parts.push(format!("SUBJECT \"{}\"", escape_quoted(subject)));
        }
        parts.push(format!("SINCE {}", self.since.format("%d-%b-%Y")));
        parts.join(" ")
    }
}

fn escape_quoted(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Derive server-side search criteria from a filter.
///
/// Always searches unseen messages. A `SUBJECT` term is only pushed to the
/// server when the configured pattern is a plain literal (no regex
/// metacharacters) longer than 3 characters — anything else is matched
/// client-side only.
pub fn build_search_criteria(filter: &IngestionFilter, now: DateTime<Utc>) -> SearchCriteria {
    let subject_literal = filter
        .subject_regex
        .as_deref()
        .filter(|p| !has_regex_metacharacters(p) && p.len() > 3)
        .map(str::to_string);

    SearchCriteria {
        unseen: true,
        from: filter.from_address.clone(),
        subject_literal,
        since: now - Duration::days(i64::from(filter.days_back)),
    }
}

fn has_regex_metacharacters(pattern: &str) -> bool {
    pattern
        .chars()
        .any(|c| matches!(c, '\\' | '.' | '^' | '$' | '|' | '?' | '*' | '+' | '(' | ')' | '[' | ']' | '{' | '}'))
}

/// Loads and stamps per-vendor filters.
pub struct FilterRegistry {
    db: Arc<dyn Database>,
}

impl FilterRegistry {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// All active filters.
    pub async fn load_filters(&self) -> Result<Vec<IngestionFilter>, DatabaseError> {
        self.db.list_active_filters().await
    }

    /// The active filter for a vendor, stamping `last_used` as a side
    /// effect. Falls back to the permissive default — never errors on a
    /// missing row.
    pub async fn filter_for(&self, vendor: &str) -> IngestionFilter {
        match self.db.get_active_filter(vendor).await {
            Ok(Some(filter)) => {
                if let Err(e) = self.db.touch_filter_last_used(vendor, Utc::now()).await {
                    tracing::warn!(vendor = %vendor, "Failed to stamp filter last_used: {e}");
                }
                filter
            }
            Ok(None) => IngestionFilter::default_for(vendor),
            Err(e) => {
                tracing::warn!(vendor = %vendor, "Filter lookup failed, using default: {e}");
                IngestionFilter::default_for(vendor)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> IngestionFilter {
        IngestionFilter::default_for("VinSolutions")
    }

    #[test]
    fn default_filter_is_permissive() {
        let f = filter();
        assert!(f.from_address.is_none());
        assert!(f.subject_regex.is_none());
        assert_eq!(f.days_back, 7);
        assert_eq!(f.file_pattern, r"\.csv$");
        assert!(f.active);
    }

    #[test]
    fn criteria_always_include_unseen_and_since() {
        let now = Utc::now();
        let criteria = build_search_criteria(&filter(), now);
        assert!(criteria.unseen);
        assert_eq!(criteria.since, now - Duration::days(7));
        assert!(criteria.from.is_none());
        assert!(criteria.subject_literal.is_none());
    }

    #[test]
    fn criteria_include_from_when_configured() {
        let mut f = filter();
        f.from_address = Some("reports@vinsolutions.com".to_string());
        let criteria = build_search_criteria(&f, Utc::now());
        assert_eq!(criteria.from.as_deref(), Some("reports@vinsolutions.com"));
    }

    #[test]
    fn literal_subject_pushed_to_server() {
        let mut f = filter();
        f.subject_regex = Some("Daily Sales Report".to_string());
        let criteria = build_search_criteria(&f, Utc::now());
        assert_eq!(criteria.subject_literal.as_deref(), Some("Daily Sales Report"));
    }

    #[test]
    fn regex_subject_stays_client_side() {
        let mut f = filter();
        f.subject_regex = Some(r"Daily (Sales|Leads) Report".to_string());
        let criteria = build_search_criteria(&f, Utc::now());
        assert!(criteria.subject_literal.is_none());
    }

    #[test]
    fn short_literal_stays_client_side() {
        let mut f = filter();
        f.subject_regex = Some("CRM".to_string());
        let criteria = build_search_criteria(&f, Utc::now());
        assert!(criteria.subject_literal.is_none());
    }

    #[test]
    fn imap_query_rendering() {
        let since = DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let criteria = SearchCriteria {
            unseen: true,
            from: Some("reports@vinsolutions.com".to_string()),
            subject_literal: Some("Daily Sales".to_string()),
            since,
        };
        assert_eq!(
            criteria.to_imap_query(),
            "UNSEEN FROM \"reports@vinsolutions.com\" SUBJECT \"Daily Sales\" SINCE 01-Aug-2026"
        );
    }

    #[test]
    fn imap_query_escapes_quotes() {
        let since = DateTime::parse_from_rfc3339("2026-08-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let criteria = SearchCriteria {
            unseen: true,
            from: Some("a\"b@example.com".to_string()),
            subject_literal: None,
            since,
        };
        assert!(criteria.to_imap_query().contains(r#"FROM "a\"b@example.com""#));
    }
}
