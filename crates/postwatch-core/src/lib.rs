use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A fully retrieved message, normalized to plain strings. Never mutated
/// after construction; address lists keep the order and count the mailbox
/// reported them in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Email {
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: String,
}

impl fmt::Display for Email {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "From: {}", self.from)?;
        writeln!(f, "To: {}", self.to.join(", "))?;
        writeln!(f, "Cc: {}", self.cc.join(", "))?;
        writeln!(f, "Subject: {}", self.subject)?;
        write!(f, "Body:\n{}", self.text_body)
    }
}

/// Append-only collection of monitored mail. The vector is owned internally
/// and only copies leave through `snapshot`, so a reader can take a report
/// while the sync worker is still appending.
#[derive(Debug, Clone, Default)]
pub struct MailStore {
    inner: Arc<Mutex<Vec<Email>>>,
}

impl MailStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, email: Email) {
        self.inner.lock().unwrap().push(email);
    }

    pub fn snapshot(&self) -> Vec<Email> {
        self.inner.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }
}

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();

pub fn log_debug(msg: &str) {
    if std::env::var("POSTWATCH_LOG").is_err() {
        return;
    }
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let path = base.join("postwatch").join("postwatch.log");
    let lock = LOG_FILE.get_or_init(|| {
        let _ = std::fs::create_dir_all(
            path.parent()
                .unwrap_or_else(|| std::path::Path::new("/tmp")),
        );
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok();
        Mutex::new(file)
    });
    if let Ok(mut guard) = lock.lock() {
        if let Some(file) = guard.as_mut() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(file, "[{}] {}", ts, msg);
        }
    }
}
