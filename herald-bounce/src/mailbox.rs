//! Bounce mailbox polling
//!
//! Bounces that come back by mail are either RFC 3464 delivery status
//! notifications or RFC 5965 abuse feedback reports:
//!
//! ```text
//! multipart/report; report-type="delivery-status"
//! ├── text/plain                (human-readable explanation)
//! ├── message/delivery-status   (Final-Recipient, Action, Status)
//! └── text/rfc822-headers       (original headers, X-Herald-Campaign)
//!
//! multipart/report; report-type="feedback-report"
//! ├── text/plain
//! ├── message/feedback-report   (Feedback-Type, Original-Rcpt-To)
//! └── message/rfc822            (the original message)
//! ```
//!
//! A `MailboxPoller` fetches raw messages from a `Mailbox` on an interval,
//! parses them into `BounceEvent`s and submits them to the correlator.

use std::{collections::VecDeque, path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use herald_common::{BounceClass, BounceEvent, BounceSource, CampaignId, Signal, incoming, internal};
use mailparse::{MailHeaderMap, ParsedMail};
use tokio::{fs, sync::broadcast};

use crate::{
    correlator::BounceHandle, error::MailboxError, policy::BounceConfig,
    webhook::campaign_from_headers,
};

/// A source of raw bounce messages
///
/// `fetch` hands over every message waiting in the mailbox; a message is
/// never returned twice.
#[async_trait]
pub trait Mailbox: Send + Sync + std::fmt::Debug {
    /// # Errors
    /// `MailboxError::Fetch` if the mailbox cannot be read
    async fn fetch(&self) -> Result<Vec<Vec<u8>>, MailboxError>;
}

/// In-memory mailbox, for tests and embedding
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    messages: parking_lot::Mutex<VecDeque<Vec<u8>>>,
}

impl MemoryMailbox {
    pub fn deliver(&self, raw: impl Into<Vec<u8>>) {
        self.messages.lock().push_back(raw.into());
    }
}

#[async_trait]
impl Mailbox for MemoryMailbox {
    async fn fetch(&self) -> Result<Vec<Vec<u8>>, MailboxError> {
        Ok(self.messages.lock().drain(..).collect())
    }
}

/// A directory that receives bounces as `.eml` files
///
/// Files are removed once read. One that cannot be read or removed stays in
/// place and does not stop the others from being fetched.
#[derive(Debug, Clone)]
pub struct DirectoryMailbox {
    path: PathBuf,
}

impl DirectoryMailbox {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Mailbox for DirectoryMailbox {
    async fn fetch(&self) -> Result<Vec<Vec<u8>>, MailboxError> {
        let fetch_error = |err: std::io::Error| MailboxError::Fetch(format!("{}: {err}", self.path.display()));

        let mut entries = fs::read_dir(&self.path).await.map_err(fetch_error)?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(fetch_error)? {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "eml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut read = Vec::with_capacity(paths.len());
        for path in paths {
            match fs::read(&path).await {
                Ok(raw) => read.push((path, raw)),
                Err(err) => tracing::warn!(
                    file = %path.display(),
                    error = %err,
                    "Unreadable bounce file left for the next poll"
                ),
            }
        }

        // A file that cannot be removed would be fetched again, so hold it back
        let mut messages = Vec::with_capacity(read.len());
        for (path, raw) in read {
            match fs::remove_file(&path).await {
                Ok(()) => messages.push(raw),
                Err(err) => tracing::warn!(
                    file = %path.display(),
                    error = %err,
                    "Failed to remove bounce file, left for the next poll"
                ),
            }
        }

        Ok(messages)
    }
}

/// Parse one raw bounce message into events
///
/// # Errors
/// `NotABounce` for ordinary mail, `MissingRecipient` for a report that
/// names nobody, or a parse error
pub fn parse_report(raw: &[u8]) -> Result<Vec<BounceEvent>, MailboxError> {
    let mail = mailparse::parse_mail(raw)?;
    let timestamp = mail
        .headers
        .get_first_value("Date")
        .and_then(|date| mailparse::dateparse(&date).ok())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    let mut parts = Vec::new();
    flatten(&mail, &mut parts);

    let campaign_hint = parts.iter().find_map(|part| original_campaign(part));
    let raw_payload = String::from_utf8_lossy(raw).into_owned();
    let event = |recipient: String, class| BounceEvent {
        recipient,
        class,
        timestamp,
        raw_payload: raw_payload.clone(),
        campaign_hint,
        source: BounceSource::Mailbox,
    };

    if let Some(report) = parts
        .iter()
        .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("message/delivery-status"))
    {
        let events: Vec<_> = delivery_status(&report.get_body()?)
            .into_iter()
            .map(|(recipient, class)| event(recipient, class))
            .collect();

        if events.is_empty() {
            return Err(MailboxError::MissingRecipient);
        }
        return Ok(events);
    }

    if let Some(report) = parts
        .iter()
        .find(|part| part.ctype.mimetype.eq_ignore_ascii_case("message/feedback-report"))
    {
        let body = report.get_body_raw()?;
        let (fields, _) = mailparse::parse_headers(&body)?;
        let recipient = fields
            .get_first_value("Original-Rcpt-To")
            .or_else(|| original_header(&parts, "To"))
            .map(|address| strip_address(&address))
            .ok_or(MailboxError::MissingRecipient)?;

        return Ok(vec![event(recipient, BounceClass::Complaint)]);
    }

    Err(MailboxError::NotABounce)
}

fn flatten<'a>(mail: &'a ParsedMail<'a>, parts: &mut Vec<&'a ParsedMail<'a>>) {
    parts.push(mail);
    for part in &mail.subparts {
        flatten(part, parts);
    }
}

fn is_original(part: &ParsedMail<'_>) -> bool {
    let mimetype = part.ctype.mimetype.to_ascii_lowercase();
    mimetype == "text/rfc822-headers" || mimetype == "message/rfc822"
}

fn original_headers(parts: &[&ParsedMail<'_>]) -> Option<Vec<(String, String)>> {
    let part = parts.iter().find(|part| is_original(part))?;
    let body = part.get_body_raw().ok()?;
    let (headers, _) = mailparse::parse_headers(&body).ok()?;
    Some(
        headers
            .iter()
            .map(|header| (header.get_key(), header.get_value()))
            .collect(),
    )
}

fn original_header(parts: &[&ParsedMail<'_>], name: &str) -> Option<String> {
    original_headers(parts)?
        .into_iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value)
}

fn original_campaign(part: &ParsedMail<'_>) -> Option<CampaignId> {
    if !is_original(part) {
        return None;
    }
    let headers = original_headers(&[part])?;
    campaign_from_headers(
        headers
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str())),
    )
}

/// `rfc822; user@example.com` or `<user@example.com>` to `user@example.com`
fn strip_address(value: &str) -> String {
    let address = value
        .split_once(';')
        .map_or(value, |(_, address)| address)
        .trim();
    address
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Recipients that failed, from a `message/delivery-status` body
///
/// The body is a block of per-message fields followed by one block per
/// recipient, separated by blank lines.
fn delivery_status(body: &str) -> Vec<(String, BounceClass)> {
    let body = body.replace("\r\n", "\n");

    body.split("\n\n")
        .filter(|block| !block.trim().is_empty())
        .filter_map(|block| {
            let block = format!("{}\n\n", block.trim());
            let (fields, _) = mailparse::parse_headers(block.as_bytes()).ok()?;

            let recipient = fields
                .get_first_value("Final-Recipient")
                .or_else(|| fields.get_first_value("Original-Recipient"))?;
            let action = fields.get_first_value("Action")?.trim().to_ascii_lowercase();
            let status = fields.get_first_value("Status").unwrap_or_default();

            let class = match action.as_str() {
                "failed" if status.trim().starts_with('5') => BounceClass::Hard,
                "failed" | "delayed" => BounceClass::Soft,
                _ => return None,
            };

            Some((strip_address(&recipient), class))
        })
        .collect()
}

/// Scans a mailbox on an interval and submits what it finds
#[derive(Debug)]
pub struct MailboxPoller {
    mailbox: Arc<dyn Mailbox>,
    bounces: BounceHandle,
    interval: Duration,
}

impl MailboxPoller {
    #[must_use]
    pub fn new(mailbox: Arc<dyn Mailbox>, bounces: BounceHandle, config: &BounceConfig) -> Self {
        Self {
            mailbox,
            bounces,
            interval: Duration::from_secs(config.mailbox_poll_interval_secs.max(1)),
        }
    }

    /// Fetch and submit everything currently in the mailbox
    ///
    /// Messages that are not bounces are logged and dropped, and a mailbox
    /// that cannot be read is retried on the next poll. Returns the number of
    /// events submitted.
    ///
    /// # Errors
    /// If the correlator has stopped
    pub async fn poll_once(&self) -> Result<usize, crate::BounceError> {
        let messages = match self.mailbox.fetch().await {
            Ok(messages) => messages,
            Err(err) => {
                tracing::warn!(error = %err, "Failed to fetch bounce mailbox");
                return Ok(0);
            }
        };

        let mut submitted = 0;
        for raw in messages {
            match parse_report(&raw) {
                Ok(events) => {
                    for event in events {
                        incoming!(
                            level = DEBUG,
                            "Mailbox bounce for {} ({})",
                            event.recipient,
                            event.class
                        );
                        self.bounces.submit(event).await?;
                        submitted += 1;
                    }
                }
                Err(err) => {
                    tracing::debug!(error = %err, "Skipping message in bounce mailbox");
                }
            }
        }

        Ok(submitted)
    }

    /// Poll until a shutdown signal arrives
    ///
    /// # Errors
    /// If the correlator stops while the poller is running
    pub async fn serve(&self, mut shutdown: broadcast::Receiver<Signal>) -> Result<(), crate::BounceError> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        internal!(level = INFO, "Bounce mailbox poller running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let submitted = self.poll_once().await?;
                    if submitted > 0 {
                        tracing::info!(submitted, "Submitted mailbox bounces");
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) | Err(broadcast::error::RecvError::Closed) => {
                            internal!(level = INFO, "Bounce mailbox poller stopping");
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    const DSN: &str = "From: MAILER-DAEMON@mx.example.net\r\n\
        To: bounces@herald.example.com\r\n\
        Date: Wed, 01 May 2024 12:00:00 +0000\r\n\
        Subject: Undelivered Mail Returned to Sender\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/report; report-type=delivery-status; boundary=\"b1\"\r\n\
        \r\n\
        --b1\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        Your message could not be delivered.\r\n\
        --b1\r\n\
        Content-Type: message/delivery-status\r\n\
        \r\n\
        Reporting-MTA: dns; mx.example.net\r\n\
        \r\n\
        Final-Recipient: rfc822; gone@example.org\r\n\
        Action: failed\r\n\
        Status: 5.1.1\r\n\
        \r\n\
        Final-Recipient: rfc822; <later@example.org>\r\n\
        Action: delayed\r\n\
        Status: 4.2.2\r\n\
        \r\n\
        Final-Recipient: rfc822; fine@example.org\r\n\
        Action: delivered\r\n\
        Status: 2.0.0\r\n\
        \r\n\
        --b1\r\n\
        Content-Type: text/rfc822-headers\r\n\
        \r\n\
        From: news@herald.example.com\r\n\
        X-Herald-Campaign: 31\r\n\
        Subject: May newsletter\r\n\
        \r\n\
        --b1--\r\n";

    const ARF: &str = "From: feedback@isp.example\r\n\
        Date: Wed, 01 May 2024 13:00:00 +0000\r\n\
        MIME-Version: 1.0\r\n\
        Content-Type: multipart/report; report-type=feedback-report; boundary=\"b2\"\r\n\
        \r\n\
        --b2\r\n\
        Content-Type: text/plain\r\n\
        \r\n\
        This is an abuse report.\r\n\
        --b2\r\n\
        Content-Type: message/feedback-report\r\n\
        \r\n\
        Feedback-Type: abuse\r\n\
        User-Agent: isp-fbl/1.0\r\n\
        Version: 1\r\n\
        \r\n\
        --b2\r\n\
        Content-Type: message/rfc822\r\n\
        \r\n\
        From: news@herald.example.com\r\n\
        To: annoyed@example.org\r\n\
        X-Herald-Campaign: 32\r\n\
        \r\n\
        Hello!\r\n\
        --b2--\r\n";

    #[test]
    fn test_parse_dsn() {
        let events = parse_report(DSN.as_bytes()).unwrap();
        let summary: Vec<_> = events
            .iter()
            .map(|e| (e.recipient.as_str(), e.class, e.campaign_hint))
            .collect();

        assert_eq!(
            summary,
            vec![
                ("gone@example.org", BounceClass::Hard, Some(CampaignId(31))),
                ("later@example.org", BounceClass::Soft, Some(CampaignId(31))),
            ]
        );
        assert_eq!(events[0].source, BounceSource::Mailbox);
        assert_eq!(events[0].timestamp.timestamp(), 1_714_564_800);
    }

    #[test]
    fn test_parse_arf() {
        let events = parse_report(ARF.as_bytes()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].recipient, "annoyed@example.org");
        assert_eq!(events[0].class, BounceClass::Complaint);
        assert_eq!(events[0].campaign_hint, Some(CampaignId(32)));
    }

    #[test]
    fn test_plain_mail_is_not_a_bounce() {
        let raw = b"From: someone@example.org\r\nSubject: hi\r\n\r\nJust saying hello\r\n";
        assert!(matches!(parse_report(raw), Err(MailboxError::NotABounce)));
    }

    #[test]
    fn test_strip_address() {
        assert_eq!(strip_address("rfc822; a@example.com"), "a@example.com");
        assert_eq!(strip_address("<b@example.com>"), "b@example.com");
        assert_eq!(strip_address(" c@example.com "), "c@example.com");
    }

    #[tokio::test]
    async fn test_memory_mailbox_drains() {
        let mailbox = MemoryMailbox::default();
        mailbox.deliver(DSN);
        mailbox.deliver(ARF);

        assert_eq!(mailbox.fetch().await.unwrap().len(), 2);
        assert!(mailbox.fetch().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_directory_mailbox_keeps_fetching_past_unreadable_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.eml"), DSN).unwrap();
        // Reading a directory fails
        std::fs::create_dir(dir.path().join("b.eml")).unwrap();
        std::fs::write(dir.path().join("c.eml"), ARF).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a bounce").unwrap();

        let mailbox = DirectoryMailbox::new(dir.path());
        let messages = mailbox.fetch().await.unwrap();
        assert_eq!(messages, vec![DSN.as_bytes().to_vec(), ARF.as_bytes().to_vec()]);

        assert!(!dir.path().join("a.eml").exists());
        assert!(dir.path().join("b.eml").exists());
        assert!(!dir.path().join("c.eml").exists());
        assert!(dir.path().join("notes.txt").exists());
        assert!(mailbox.fetch().await.unwrap().is_empty());
    }
}
