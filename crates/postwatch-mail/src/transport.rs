//! IMAP realization of the mailbox-client boundary.

use std::time::Duration;

use imap::extensions::idle::WaitOutcome;
use imap::{ClientBuilder, ConnectionMode, TlsKind};
use mailparse::{MailAddr, MailHeaderMap, ParsedMail};
use tokio::sync::mpsc;

use postwatch_core::log_debug;

use crate::{
    MailAddress, MailSummary, MailboxClient, MailboxConfig, MailboxError, MonitorEvent,
    ProtocolKind, RawMessage, SummaryFilter,
};

/// One authenticated session against a remote IMAP inbox. Owns the
/// connection parameters and the connect/login/logout lifecycle; everything
/// wire-level is delegated to the `imap` crate.
pub struct ImapMailbox {
    config: MailboxConfig,
    session: Option<imap::Session<imap::Connection>>,
    events: mpsc::Sender<MonitorEvent>,
}

impl ImapMailbox {
    pub fn new(config: MailboxConfig, events: mpsc::Sender<MonitorEvent>) -> Self {
        Self {
            config,
            session: None,
            events,
        }
    }

    fn emit(&self, event: MonitorEvent) {
        let _ = self.events.blocking_send(event);
    }

    fn trace(&self, detail: String) {
        log_debug(&detail);
        self.emit(MonitorEvent::Trace { detail });
    }

    fn session(&mut self) -> Result<&mut imap::Session<imap::Connection>, MailboxError> {
        self.session
            .as_mut()
            .ok_or_else(|| MailboxError::Protocol("not connected".to_string()))
    }
}

impl MailboxClient for ImapMailbox {
    fn connect(&mut self) -> Result<(), MailboxError> {
        if self.config.protocol != ProtocolKind::Imap {
            return Err(MailboxError::Protocol(
                "only IMAP mailboxes are supported by this transport".to_string(),
            ));
        }
        if self.config.use_tls {
            self.emit(MonitorEvent::Securing {
                host: self.config.host.clone(),
            });
        }
        self.trace(format!(
            "connect host={} port={} tls={}",
            self.config.host, self.config.port, self.config.use_tls
        ));
        let mode = if self.config.use_tls {
            ConnectionMode::Tls
        } else {
            ConnectionMode::Plaintext
        };
        let client = ClientBuilder::new(self.config.host.as_str(), self.config.port)
            .tls_kind(TlsKind::Native)
            .mode(mode)
            .connect()
            .map_err(|err| MailboxError::Connection(err.to_string()))?;
        self.emit(MonitorEvent::Connected);
        let mut session = client
            .login(&self.config.account, &self.config.password)
            .map_err(|err| MailboxError::Authentication(err.0.to_string()))?;
        self.emit(MonitorEvent::Authorized);
        self.trace("select INBOX".to_string());
        session.select("INBOX").map_err(classify)?;
        self.session = Some(session);
        Ok(())
    }

    fn logout(&mut self) -> Result<(), MailboxError> {
        if let Some(mut session) = self.session.take() {
            self.trace("logout".to_string());
            session.logout().map_err(classify)?;
        }
        Ok(())
    }

    fn refresh_summaries(&mut self) -> Result<(), MailboxError> {
        self.trace("noop refresh".to_string());
        self.session()?.noop().map_err(classify)
    }

    fn list_summaries(
        &mut self,
        filter: SummaryFilter,
    ) -> Result<Vec<MailSummary>, MailboxError> {
        let query = match filter {
            SummaryFilter::All => "ALL",
            SummaryFilter::UnreadOnly => "UNSEEN",
        };
        self.trace(format!("search {}", query));
        let session = self.session()?;
        let mut seqs: Vec<u32> = session.search(query).map_err(classify)?.into_iter().collect();
        seqs.sort_unstable();
        if seqs.is_empty() {
            return Ok(Vec::new());
        }
        let seq_set = seqs
            .iter()
            .map(|seq| seq.to_string())
            .collect::<Vec<_>>()
            .join(",");
        let fetches = session.fetch(seq_set, "(UID FLAGS)").map_err(classify)?;
        let mut summaries = Vec::new();
        for fetch in fetches.iter() {
            let Some(uid) = fetch.uid else { continue };
            let read = fetch
                .flags()
                .iter()
                .any(|flag| matches!(flag, imap::types::Flag::Seen));
            summaries.push(MailSummary {
                seq: fetch.message,
                uid,
                read,
            });
        }
        summaries.sort_unstable_by_key(|summary| summary.seq);
        Ok(summaries)
    }

    fn retrieve_message(&mut self, summary: &MailSummary) -> Result<RawMessage, MailboxError> {
        self.trace(format!("uid fetch {}", summary.uid));
        let uid = summary.uid;
        let fetches = self
            .session()?
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|err| MailboxError::Fetch {
                uid,
                reason: err.to_string(),
            })?;
        let body = fetches
            .iter()
            .find_map(|fetch| fetch.body().map(|body| body.to_vec()))
            .ok_or_else(|| MailboxError::Fetch {
                uid,
                reason: "no body returned".to_string(),
            })?;
        raw_message_from_bytes(&body, uid)
    }

    fn mark_read(&mut self, summary: &MailSummary, read: bool) -> Result<(), MailboxError> {
        let query = if read {
            "+FLAGS.SILENT (\\Seen)"
        } else {
            "-FLAGS.SILENT (\\Seen)"
        };
        self.trace(format!("uid store {} {}", summary.uid, query));
        self.session()?
            .uid_store(summary.uid.to_string(), query)
            .map_err(classify)?;
        Ok(())
    }

    fn wait_for_new_mail(&mut self, timeout: Duration) -> Result<bool, MailboxError> {
        self.trace(format!("idle timeout={}s", timeout.as_secs()));
        let outcome = self
            .session()?
            .idle()
            .timeout(timeout)
            .keepalive(false)
            .wait_while(imap::extensions::idle::stop_on_any)
            .map_err(classify)?;
        Ok(matches!(outcome, WaitOutcome::MailboxChanged))
    }

    fn cancel_wait(&mut self) -> Result<(), MailboxError> {
        // The blocking IDLE has already issued DONE by the time the wait
        // returns; there is no primitive left to tear down.
        self.trace("cancel wait".to_string());
        Ok(())
    }
}

fn classify(err: imap::Error) -> MailboxError {
    match &err {
        imap::Error::Io(_) | imap::Error::ConnectionLost => {
            MailboxError::Connection(err.to_string())
        }
        _ => MailboxError::Protocol(err.to_string()),
    }
}

/// Map a raw RFC822 message onto the protocol record: addresses from the
/// From/To/Cc headers in header order, plus the first text/plain and
/// text/html parts of the body.
pub fn raw_message_from_bytes(raw: &[u8], uid: u32) -> Result<RawMessage, MailboxError> {
    let parsed = mailparse::parse_mail(raw).map_err(|err| MailboxError::Fetch {
        uid,
        reason: err.to_string(),
    })?;
    let subject = parsed.headers.get_first_value("Subject").unwrap_or_default();
    let from = address_list(parsed.headers.get_first_value("From").as_deref())
        .into_iter()
        .next();
    let to = address_list(parsed.headers.get_first_value("To").as_deref());
    let cc = address_list(parsed.headers.get_first_value("Cc").as_deref());
    let (text_body, html_body) = extract_bodies(&parsed).map_err(|err| MailboxError::Fetch {
        uid,
        reason: err.to_string(),
    })?;
    Ok(RawMessage {
        from,
        to,
        cc,
        subject,
        text_body,
        html_body,
    })
}

fn address_list(header: Option<&str>) -> Vec<MailAddress> {
    let Some(header) = header else {
        return Vec::new();
    };
    let trimmed = header.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    let Ok(parsed) = mailparse::addrparse(trimmed) else {
        // Keep the raw header text rather than dropping the field.
        return vec![MailAddress {
            name: None,
            address: trimmed.to_string(),
        }];
    };
    let mut out = Vec::new();
    for addr in parsed.iter() {
        match addr {
            MailAddr::Single(info) => out.push(MailAddress {
                name: info.display_name.clone(),
                address: info.addr.clone(),
            }),
            MailAddr::Group(group) => {
                for info in &group.addrs {
                    out.push(MailAddress {
                        name: info.display_name.clone(),
                        address: info.addr.clone(),
                    });
                }
            }
        }
    }
    out
}

fn extract_bodies(parsed: &ParsedMail) -> Result<(String, String), mailparse::MailParseError> {
    if parsed.subparts.is_empty() {
        let body = parsed.get_body()?;
        return Ok(if parsed.ctype.mimetype.eq_ignore_ascii_case("text/html") {
            (String::new(), body)
        } else {
            (body, String::new())
        });
    }

    let mut text_plain: Option<String> = None;
    let mut text_html: Option<String> = None;

    walk_parts(parsed, &mut |part| {
        let ctype = part.ctype.mimetype.to_lowercase();
        if ctype == "text/plain" && text_plain.is_none() {
            if let Ok(body) = part.get_body() {
                text_plain = Some(body);
            }
        }
        if ctype == "text/html" && text_html.is_none() {
            if let Ok(body) = part.get_body() {
                text_html = Some(body);
            }
        }
    });

    Ok((
        text_plain.unwrap_or_default(),
        text_html.unwrap_or_default(),
    ))
}

fn walk_parts<F>(parsed: &ParsedMail, cb: &mut F)
where
    F: FnMut(&ParsedMail),
{
    cb(parsed);
    for part in &parsed.subparts {
        walk_parts(part, cb);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_message_maps_headers_and_body() {
        let raw = b"From: Ada Lovelace <ada@example.com>\r\n\
            To: ops@example.com, Grace <grace@example.com>\r\n\
            Cc: audit@example.com\r\n\
            Subject: engine report\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            All gears turning.\r\n";

        let message = raw_message_from_bytes(raw, 1).unwrap();

        assert_eq!(message.subject, "engine report");
        assert_eq!(
            message.from.as_ref().map(ToString::to_string).as_deref(),
            Some("Ada Lovelace <ada@example.com>")
        );
        assert_eq!(message.to.len(), 2);
        assert_eq!(message.to[0].to_string(), "ops@example.com");
        assert_eq!(message.to[1].to_string(), "Grace <grace@example.com>");
        assert_eq!(message.cc.len(), 1);
        assert_eq!(message.text_body.trim(), "All gears turning.");
        assert!(message.html_body.is_empty());
    }

    #[test]
    fn multipart_alternative_keeps_both_bodies() {
        let raw = b"From: ada@example.com\r\n\
            To: ops@example.com\r\n\
            Subject: both parts\r\n\
            MIME-Version: 1.0\r\n\
            Content-Type: multipart/alternative; boundary=\"sep\"\r\n\
            \r\n\
            --sep\r\n\
            Content-Type: text/plain; charset=utf-8\r\n\
            \r\n\
            plain part\r\n\
            --sep\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <p>html part</p>\r\n\
            --sep--\r\n";

        let message = raw_message_from_bytes(raw, 2).unwrap();

        assert_eq!(message.text_body.trim(), "plain part");
        assert_eq!(message.html_body.trim(), "<p>html part</p>");
    }

    #[test]
    fn html_only_message_leaves_text_empty() {
        let raw = b"From: ada@example.com\r\n\
            To: ops@example.com\r\n\
            Subject: html only\r\n\
            Content-Type: text/html; charset=utf-8\r\n\
            \r\n\
            <h1>hi</h1>\r\n";

        let message = raw_message_from_bytes(raw, 3).unwrap();

        assert!(message.text_body.is_empty());
        assert_eq!(message.html_body.trim(), "<h1>hi</h1>");
    }

    #[test]
    fn missing_address_headers_map_to_empty_lists() {
        let raw = b"Subject: bare\r\n\
            Content-Type: text/plain\r\n\
            \r\n\
            body\r\n";

        let message = raw_message_from_bytes(raw, 4).unwrap();

        assert!(message.from.is_none());
        assert!(message.to.is_empty());
        assert!(message.cc.is_empty());
    }

    #[test]
    fn group_addresses_expand_in_order() {
        let list = address_list(Some("crew: ada@example.com, grace@example.com;"));
        let rendered: Vec<String> = list.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, ["ada@example.com", "grace@example.com"]);
    }
}
