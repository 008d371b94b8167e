use std::path::PathBuf;

use anyhow::Result;
use chrono::Local;
use clap::Parser;

use postwatch_core::{MailStore, log_debug};
use postwatch_mail::{
    DEFAULT_WAIT_TIMEOUT_SECS, MailboxConfig, MonitorEvent, ProtocolKind, start_monitor,
};

mod config;

use crate::config::{load_config_text, parse_mailbox_table, parse_protocol};

const REPORT_SCHEMA_VERSION: &str = "postwatch.report.v1";

#[derive(Parser, Debug)]
#[command(name = "postwatch", version, about = "Watch a remote mailbox for new mail")]
struct Cli {
    /// Mailbox host, e.g. imap.example.com
    #[arg(long)]
    host: Option<String>,
    /// Account identifier (usually the mail address)
    #[arg(long)]
    account: Option<String>,
    #[arg(long)]
    password: Option<String>,
    /// Connect over TLS (defaults to true)
    #[arg(long, value_name = "BOOL")]
    tls: Option<bool>,
    #[arg(long)]
    port: Option<u16>,
    /// Mailbox protocol: imap or pop3
    #[arg(long)]
    protocol: Option<String>,
    /// Seconds to wait for a new-mail signal before re-polling
    #[arg(long)]
    timeout: Option<u64>,
    /// Config file path (defaults to ./postwatch.toml, then the XDG config dir)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn resolve_config(cli: &Cli) -> Result<MailboxConfig> {
    let file = load_config_text(cli.config.as_deref())
        .and_then(|content| toml::from_str::<toml::Value>(&content).ok())
        .and_then(|value| parse_mailbox_table(&value));

    let host = cli
        .host
        .clone()
        .or_else(|| file.as_ref().map(|config| config.host.clone()));
    let account = cli
        .account
        .clone()
        .or_else(|| file.as_ref().map(|config| config.account.clone()));
    let password = cli
        .password
        .clone()
        .or_else(|| file.as_ref().map(|config| config.password.clone()));
    let (Some(host), Some(account), Some(password)) = (host, account, password) else {
        anyhow::bail!(
            "no mailbox configured: pass --host, --account and --password \
             or add a [mailbox] table to postwatch.toml"
        );
    };

    let use_tls = cli
        .tls
        .or_else(|| file.as_ref().map(|config| config.use_tls))
        .unwrap_or(true);
    let protocol = match cli.protocol.as_deref() {
        Some(raw) => parse_protocol(raw)
            .ok_or_else(|| anyhow::anyhow!("unknown protocol {raw:?}, expected imap or pop3"))?,
        None => file
            .as_ref()
            .map(|config| config.protocol)
            .unwrap_or(ProtocolKind::Imap),
    };

    let mut config = MailboxConfig::new(&host, &account, &password, use_tls);
    config.protocol = protocol;
    config.port = match cli.port {
        Some(port) => port,
        // A file port only stands while the flags it was derived under do.
        None => match &file {
            Some(file) if cli.tls.is_none() && cli.protocol.is_none() => file.port,
            _ => protocol.default_port(use_tls),
        },
    };
    config.wait_timeout_secs = cli
        .timeout
        .or_else(|| file.as_ref().map(|config| config.wait_timeout_secs))
        .unwrap_or(DEFAULT_WAIT_TIMEOUT_SECS)
        .max(1);
    Ok(config)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli, config))
}

async fn run(cli: Cli, config: MailboxConfig) -> Result<()> {
    println!(
        "postwatch: monitoring {} on {} (Ctrl-C stops after the current cycle)",
        config.account, config.host
    );

    let store = MailStore::new();
    let (handle, mut events) = start_monitor(config, store.clone());

    let cancel = handle.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            println!("\nstop requested, finishing the current cycle ...");
            cancel.cancel();
        }
    });

    while let Some(event) = events.recv().await {
        match event_line(&event) {
            Some(line) => println!("{line}"),
            None => {
                if let MonitorEvent::Trace { detail } = &event {
                    log_debug(&format!("imap: {detail}"));
                }
            }
        }
    }

    let outcome = handle.join().await;
    print_report(&store, cli.json)?;
    if let Err(err) = outcome {
        anyhow::bail!("monitoring ended with an error: {err}");
    }
    Ok(())
}

/// Console rendering for one diagnostic event; `None` for events that only
/// belong in the trace log.
fn event_line(event: &MonitorEvent) -> Option<String> {
    match event {
        MonitorEvent::Securing { host } => Some(format!("Securing connection to {host} ...")),
        MonitorEvent::Connected => Some("Connected".to_string()),
        MonitorEvent::Authorized => Some("Authorized".to_string()),
        MonitorEvent::SummaryRefreshed { total } => Some(format!("Total {total} message(s)")),
        MonitorEvent::Waiting { timeout_secs } => Some(format!(
            "\n----------------------------------------\n\
             {} | Waiting for new mail for {timeout_secs} seconds ...\n\
             ----------------------------------------",
            Local::now().format("%d/%m/%Y %H:%M:%S")
        )),
        MonitorEvent::NewMailSignal => Some("New mail signalled".to_string()),
        MonitorEvent::WaitTimedOut => Some("No new mail, cancelling the wait".to_string()),
        MonitorEvent::FetchStarted { unread } => Some(format!("Total {unread} unread message(s)")),
        MonitorEvent::ReceiveProgress { index, total } => {
            Some(format!("Checking {index}/{total} ..."))
        }
        MonitorEvent::MessageStored { from, subject } => {
            Some(format!("* stored \"{subject}\" from {from}"))
        }
        MonitorEvent::MarkedRead { uid } => Some(format!("Marked message {uid} as read")),
        MonitorEvent::Trace { .. } => None,
        MonitorEvent::Disconnecting => Some("Disconnecting ...".to_string()),
    }
}

fn print_report(store: &MailStore, json: bool) -> Result<()> {
    let messages = store.snapshot();
    if json {
        let report = serde_json::json!({
            "schema": REPORT_SCHEMA_VERSION,
            "count": messages.len(),
            "messages": messages,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("\n===================================");
    println!("{} message(s) received", messages.len());
    println!("===================================");
    for message in &messages {
        println!("-------------------------------------");
        println!("{message}");
    }
    Ok(())
}
