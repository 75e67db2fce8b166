//! The ingestion engine — composes filters, resilience guards, the IMAP
//! client, the failed-message archive, and health tracking into one
//! `fetch_reports` operation.
//!
//! Failure isolation: a per-message error is archived and processing
//! continues — one bad message never aborts the batch. Connection-level
//! failures are retried with backoff and counted by the circuit breaker.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use mail_parser::{MessageParser, MimeHeaders};
use regex::Regex;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{ImapConfig, IngestConfig};
use crate::error::IngestError;
use crate::ingest::failed_mail::FailedMailArchive;
use crate::ingest::filters::{FilterRegistry, IngestionFilter, SearchCriteria, build_search_criteria};
use crate::ingest::health::{HealthMonitor, IMAP_COMPONENT};
use crate::ingest::{Attachment, EmailMessage, FetchedReport, imap_client};
use crate::resilience::{AdmitOptions, CircuitBreaker, RateLimiter, RetryPolicy, retry};
use crate::store::{Database, EmailLogEntry};

/// Per-call overrides for a fetch run.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub mark_seen: Option<bool>,
    pub batch_size: Option<usize>,
}

/// IMAP ingestion engine.
pub struct IngestEngine {
    imap: ImapConfig,
    config: IngestConfig,
    db: Arc<dyn Database>,
    filters: FilterRegistry,
    archive: FailedMailArchive,
    health: Arc<HealthMonitor>,
    limiter: Arc<RateLimiter>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
}

impl IngestEngine {
    pub fn new(
        imap: ImapConfig,
        config: IngestConfig,
        db: Arc<dyn Database>,
        health: Arc<HealthMonitor>,
        limiter: Arc<RateLimiter>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            imap,
            config,
            filters: FilterRegistry::new(Arc::clone(&db)),
            archive: FailedMailArchive::new(Arc::clone(&db)),
            db,
            health,
            limiter,
            breaker,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Fetch all matching report attachments for a vendor into
    /// `download_dir`.
    ///
    /// Fails with `ReportNotFound` when no messages matched or none carried
    /// a matching attachment — an expected outcome, not a connection error.
    pub async fn fetch_reports(
        &self,
        vendor: &str,
        download_dir: &Path,
        options: FetchOptions,
    ) -> Result<Vec<FetchedReport>, IngestError> {
        self.check_backpressure().await?;

        tokio::fs::create_dir_all(download_dir).await?;

        let filter = self.filters.filter_for(vendor).await;
        let criteria = build_search_criteria(&filter, Utc::now());
        tracing::info!(
            vendor = %vendor,
            query = %criteria.to_imap_query(),
            "Starting report fetch"
        );

        let started = Instant::now();
        let result = self
            .guarded_fetch(vendor, &filter, &criteria, download_dir, &options)
            .await;

        match result {
            Ok(reports) => {
                self.health
                    .record_ok(
                        IMAP_COMPONENT,
                        started.elapsed(),
                        &format!("Fetched {} report(s) for {vendor}", reports.len()),
                    )
                    .await;
                if reports.is_empty() {
                    // Everything matched server-side was skipped client-side.
                    return Err(IngestError::ReportNotFound {
                        vendor: vendor.to_string(),
                    });
                }
                Ok(reports)
            }
            Err(err) => {
                match &err {
                    IngestError::Connection { .. }
                    | IngestError::Auth { .. }
                    | IngestError::Protocol(_)
                    | IngestError::Io(_) => {
                        self.health
                            .record_error(
                                IMAP_COMPONENT,
                                &err.to_string(),
                                serde_json::json!({ "vendor": vendor, "host": self.imap.host }),
                            )
                            .await;
                    }
                    IngestError::ReportNotFound { .. } => {
                        // The mailbox answered; an empty result is healthy.
                        self.health
                            .record_ok(
                                IMAP_COMPONENT,
                                started.elapsed(),
                                &format!("No matching reports for {vendor}"),
                            )
                            .await;
                    }
                    _ => {}
                }
                Err(err)
            }
        }
    }

    /// Pause the limiter and fail fast while the pending queue is over the
    /// threshold; resume once depth has recovered.
    async fn check_backpressure(&self) -> Result<(), IngestError> {
        if !self.config.backpressure_enabled {
            return Ok(());
        }

        let pending = self.db.count_pending_jobs().await?;
        if pending > self.config.max_queue_size {
            self.limiter.pause(format!(
                "queue depth {pending} over threshold {}",
                self.config.max_queue_size
            ));
            return Err(IngestError::Backpressure {
                pending,
                limit: self.config.max_queue_size,
            });
        }

        // Ingestion is the only caller that pauses this limiter, so a
        // recovered queue depth is what clears the pause.
        if self.limiter.is_paused() {
            self.limiter.resume();
        }
        Ok(())
    }

    /// Rate limiter (wait up to 30 s) → circuit breaker → retry (5 attempts,
    /// 1 s → 60 s exponential) around the full fetch body.
    async fn guarded_fetch(
        &self,
        vendor: &str,
        filter: &IngestionFilter,
        criteria: &SearchCriteria,
        download_dir: &Path,
        options: &FetchOptions,
    ) -> Result<Vec<FetchedReport>, IngestError> {
        let admit = AdmitOptions {
            wait: true,
            max_wait: Duration::from_secs(30),
        };

        self.limiter
            .execute(admit, move || async move {
                self.breaker
                    .execute(move || async move {
                        retry(
                            &self.retry_policy,
                            IngestError::is_retryable,
                            move |err, attempt| {
                                tracing::warn!(
                                    vendor = %vendor,
                                    attempt,
                                    "Fetch attempt failed: {err}"
                                );
                            },
                            move || self.fetch_once(vendor, filter, criteria, download_dir, options),
                        )
                        .await
                    })
                    .await
            })
            .await
    }

    /// One full fetch pass: connect/search/fetch on a blocking task, then
    /// process messages batch by batch.
    async fn fetch_once(
        &self,
        vendor: &str,
        filter: &IngestionFilter,
        criteria: &SearchCriteria,
        download_dir: &Path,
        options: &FetchOptions,
    ) -> Result<Vec<FetchedReport>, IngestError> {
        let imap = self.imap.clone();
        let search = criteria.clone();
        let fetched = tokio::task::spawn_blocking(move || imap_client::fetch_matching(&imap, &search))
            .await
            .map_err(|e| IngestError::Protocol(format!("fetch task panicked: {e}")))??;

        if fetched.is_empty() {
            return Err(IngestError::ReportNotFound {
                vendor: vendor.to_string(),
            });
        }
        tracing::debug!(vendor = %vendor, count = fetched.len(), "Fetched candidate messages");

        self.process_fetched(vendor, &fetched, filter, download_dir, options)
            .await
    }

    /// Process fetched raw messages batch by batch, isolating per-message
    /// failures.
    async fn process_fetched(
        &self,
        vendor: &str,
        fetched: &[(String, Vec<u8>)],
        filter: &IngestionFilter,
        download_dir: &Path,
        options: &FetchOptions,
    ) -> Result<Vec<FetchedReport>, IngestError> {
        let subject_re = compile_subject_regex(filter);
        let file_re = compile_file_pattern(filter);
        let batch_size = options.batch_size.unwrap_or(self.config.batch_size).max(1);

        let mut reports = Vec::new();
        let mut seen_message_ids: HashSet<String> = HashSet::new();
        let mut processed_uids: Vec<String> = Vec::new();

        for batch in fetched.chunks(batch_size) {
            for (uid, raw) in batch {
                match self
                    .process_message(
                        vendor,
                        uid,
                        raw,
                        subject_re.as_ref(),
                        &file_re,
                        &mut seen_message_ids,
                        download_dir,
                    )
                    .await
                {
                    Ok(Some(report)) => {
                        processed_uids.push(uid.clone());
                        reports.push(report);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        // Isolate the failure: archive and keep going.
                        let meta = parse_envelope(raw, uid, vendor);
                        if let Err(archive_err) = self
                            .archive
                            .archive(vendor, meta.as_ref(), raw, &err)
                            .await
                        {
                            tracing::error!(
                                vendor = %vendor,
                                uid = %uid,
                                "Failed to archive unprocessable message: {archive_err}"
                            );
                        }
                    }
                }
            }
        }

        let mark_seen = options.mark_seen.unwrap_or(self.config.mark_seen);
        if mark_seen && !processed_uids.is_empty() {
            self.mark_seen_best_effort(&processed_uids).await;
        }

        Ok(reports)
    }

    /// Process one raw message. `Ok(None)` means skipped (filtered out or a
    /// duplicate); `Err` means unprocessable and should be archived.
    async fn process_message(
        &self,
        vendor: &str,
        uid: &str,
        raw: &[u8],
        subject_re: Option<&Regex>,
        file_re: &Regex,
        seen_message_ids: &mut HashSet<String>,
        download_dir: &Path,
    ) -> Result<Option<FetchedReport>, IngestError> {
        let Some((message, attachments)) =
            extract_matching_attachments(vendor, uid, raw, subject_re, file_re)?
        else {
            return Ok(None);
        };

        // Dedup within this run, then against prior runs.
        if !seen_message_ids.insert(message.message_id.clone()) {
            tracing::debug!(message_id = %message.message_id, "Skipping duplicate in run");
            return Ok(None);
        }
        if self.db.has_email_log(&message.message_id).await? {
            tracing::debug!(message_id = %message.message_id, "Skipping already-processed message");
            return Ok(None);
        }

        let mut file_paths = Vec::with_capacity(attachments.len());
        for attachment in &attachments {
            let path = download_dir.join(format!(
                "{vendor}-{}-{}",
                Utc::now().timestamp_millis(),
                sanitize_filename(&attachment.filename)
            ));
            tokio::fs::write(&path, &attachment.content).await?;
            tracing::info!(
                vendor = %vendor,
                file = %path.display(),
                bytes = attachment.content.len(),
                "Wrote report attachment"
            );
            file_paths.push(path);
        }

        self.db
            .insert_email_log(&EmailLogEntry {
                id: Uuid::new_v4(),
                vendor: vendor.to_string(),
                message_id: message.message_id.clone(),
                subject: Some(message.subject.clone()),
                from_address: Some(message.from.clone()),
                attachment_count: file_paths.len() as u32,
                processed_at: Utc::now(),
            })
            .await?;

        Ok(Some(FetchedReport {
            file_paths,
            metadata: message,
        }))
    }

    /// Best-effort `\Seen` on a short dedicated session, retried once.
    async fn mark_seen_best_effort(&self, uids: &[String]) {
        for attempt in 1..=2 {
            let imap = self.imap.clone();
            let uids = uids.to_vec();
            let result =
                tokio::task::spawn_blocking(move || imap_client::mark_seen(&imap, &uids)).await;
            match result {
                Ok(Ok(())) => return,
                Ok(Err(e)) => {
                    tracing::warn!(attempt, "Failed to mark messages seen: {e}");
                }
                Err(e) => {
                    tracing::warn!(attempt, "Mark-seen task panicked: {e}");
                }
            }
        }
    }
}

/// Parse a raw message and collect attachments matching the vendor's file
/// pattern, deduplicated by filename within the message.
///
/// Returns `None` when the subject fails the filter or no attachment
/// matches. Errors only on an unparseable message.
fn extract_matching_attachments(
    vendor: &str,
    uid: &str,
    raw: &[u8],
    subject_re: Option<&Regex>,
    file_re: &Regex,
) -> Result<Option<(EmailMessage, Vec<Attachment>)>, IngestError> {
    let parsed = MessageParser::default().parse(raw).ok_or_else(|| {
        IngestError::MessageProcessing {
            message_id: uid.to_string(),
            reason: "unparseable MIME message".to_string(),
        }
    })?;

    let message = envelope_from(&parsed, uid, vendor);

    if let Some(re) = subject_re
        && !re.is_match(&message.subject)
    {
        tracing::debug!(uid = %uid, subject = %message.subject, "Subject filtered out");
        return Ok(None);
    }

    let mut seen_names: HashSet<String> = HashSet::new();
    let mut attachments = Vec::new();
    for part in parsed.attachments() {
        let Some(name) = part.attachment_name() else {
            continue;
        };
        if !file_re.is_match(name) {
            continue;
        }
        // Intra-message dedup: first occurrence of a filename wins.
        if !seen_names.insert(name.to_string()) {
            continue;
        }
        attachments.push(Attachment {
            filename: name.to_string(),
            content: part.contents().to_vec(),
        });
    }

    if attachments.is_empty() {
        tracing::debug!(uid = %uid, "No attachments matched file pattern");
        return Ok(None);
    }

    Ok(Some((message, attachments)))
}

/// Best-effort envelope extraction for archive records.
fn parse_envelope(raw: &[u8], uid: &str, vendor: &str) -> Option<EmailMessage> {
    MessageParser::default()
        .parse(raw)
        .map(|parsed| envelope_from(&parsed, uid, vendor))
}

fn envelope_from(parsed: &mail_parser::Message<'_>, uid: &str, vendor: &str) -> EmailMessage {
    EmailMessage {
        id: uid.to_string(),
        from: first_address(parsed.from()),
        to: first_address(parsed.to()),
        subject: parsed.subject().unwrap_or("(no subject)").to_string(),
        date: parsed
            .date()
            .and_then(|d| chrono::DateTime::parse_from_rfc3339(&d.to_rfc3339()).ok())
            .map(|d| d.with_timezone(&Utc)),
        message_id: parsed
            .message_id()
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("gen-{}", Uuid::new_v4())),
        vendor: vendor.to_string(),
    }
}

fn first_address(addr: Option<&mail_parser::Address<'_>>) -> String {
    addr.and_then(|a| a.first())
        .and_then(|a| a.address())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "unknown".into())
}

fn compile_subject_regex(filter: &IngestionFilter) -> Option<Regex> {
    filter.subject_regex.as_deref().and_then(|pattern| {
        Regex::new(pattern)
            .inspect_err(|e| {
                tracing::warn!(
                    vendor = %filter.vendor,
                    "Invalid subject regex '{pattern}', matching all subjects: {e}"
                );
            })
            .ok()
    })
}

fn compile_file_pattern(filter: &IngestionFilter) -> Regex {
    Regex::new(&filter.file_pattern).unwrap_or_else(|e| {
        tracing::warn!(
            vendor = %filter.vendor,
            "Invalid file pattern '{}', falling back to CSV: {e}",
            filter.file_pattern
        );
        Regex::new(r"\.csv$").expect("default file pattern is valid")
    })
}

/// Restrict filenames to `[A-Za-z0-9._-]`.
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
