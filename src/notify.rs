//! Operator notifications.

use crate::settings::{MailSettings, command_argv};
use std::{
    io::{self, Write},
    process::{Command, Stdio},
    sync::{Arc, Mutex},
};
use tracing::{info, warn};

pub trait Notifier: Send + Sync {
    fn notify(&self, subject: &str, body: &str) -> io::Result<()>;
}

/// Hands an RFC 822 message to a local mail submission program
/// (`sendmail -t` by default) on stdin.
#[derive(Debug, Clone)]
pub struct MailCommandNotifier {
    settings: MailSettings,
}

impl MailCommandNotifier {
    pub fn new(settings: MailSettings) -> Self {
        Self { settings }
    }

    pub fn recipients(&self) -> Vec<String> {
        self.settings
            .to
            .split(',')
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .map(ToString::to_string)
            .collect()
    }

    pub fn message(&self, subject: &str, body: &str) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {subject}\n\n{body}\n",
            self.settings.from,
            self.recipients().join(", ")
        )
    }
}

impl Notifier for MailCommandNotifier {
    fn notify(&self, subject: &str, body: &str) -> io::Result<()> {
        if self.recipients().is_empty() {
            warn!("No mail recipients configured; dropping '{subject}'");
            return Ok(());
        }
        let argv = command_argv(&self.settings.command)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let Some((program, args)) = argv.split_first() else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty mail command",
            ));
        };
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .spawn()?;
        let written = match child.stdin.take() {
            Some(mut stdin) => stdin.write_all(self.message(subject, body).as_bytes()),
            None => Ok(()),
        };
        // stdin is closed here; always reap the mailer
        let status = child.wait()?;
        if let Err(e) = written {
            return Err(io::Error::new(
                e.kind(),
                format!("could not write message to {program} (exited with {status}): {e}"),
            ));
        }
        if !status.success() {
            return Err(io::Error::other(format!("{program} exited with {status}")));
        }
        info!("Sent notification '{subject}'");
        Ok(())
    }
}

/// Writes notifications to the log only.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, subject: &str, body: &str) -> io::Result<()> {
        info!("{subject}\n{body}");
        Ok(())
    }
}

/// Keeps every notification in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn subjects(&self) -> Vec<String> {
        self.sent().into_iter().map(|(subject, _)| subject).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, subject: &str, body: &str) -> io::Result<()> {
        self.sent
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((subject.to_string(), body.to_string()));
        Ok(())
    }
}
