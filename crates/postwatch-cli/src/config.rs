use std::path::{Path, PathBuf};

use postwatch_mail::{DEFAULT_WAIT_TIMEOUT_SECS, MailboxConfig, ProtocolKind};

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("postwatch.toml"),
        xdg_config_dir().join("postwatch").join("postwatch.toml"),
    ]
}

pub(crate) fn load_config_text(explicit: Option<&Path>) -> Option<String> {
    if let Some(path) = explicit {
        return std::fs::read_to_string(path).ok();
    }
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return Some(content);
        }
    }
    None
}

pub(crate) fn parse_protocol(raw: &str) -> Option<ProtocolKind> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "imap" | "imap4" => Some(ProtocolKind::Imap),
        "pop3" | "pop" => Some(ProtocolKind::Pop3),
        _ => None,
    }
}

/// Read the `[mailbox]` table. Host, account and password are required;
/// everything else falls back to the protocol defaults.
pub(crate) fn parse_mailbox_table(value: &toml::Value) -> Option<MailboxConfig> {
    let mailbox = value.get("mailbox")?;
    let host = mailbox.get("host")?.as_str()?;
    let account = mailbox.get("account")?.as_str()?;
    let password = mailbox.get("password")?.as_str()?;
    let use_tls = mailbox
        .get("tls")
        .and_then(|v| v.as_bool())
        .unwrap_or(true);
    let protocol = mailbox
        .get("protocol")
        .and_then(|v| v.as_str())
        .and_then(parse_protocol)
        .unwrap_or(ProtocolKind::Imap);

    let mut config = MailboxConfig::new(host, account, password, use_tls);
    config.protocol = protocol;
    config.port = mailbox
        .get("port")
        .and_then(|v| v.as_integer())
        .map(|port| port as u16)
        .unwrap_or_else(|| protocol.default_port(use_tls));
    config.wait_timeout_secs = mailbox
        .get("wait_timeout_secs")
        .and_then(|v| v.as_integer())
        .map(|secs| secs.max(1) as u64)
        .unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS);
    Some(config)
}
