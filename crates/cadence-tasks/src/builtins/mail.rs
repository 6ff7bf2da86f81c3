//! `SendMail`: compose a message from a JSON parameter and hand it to a
//! [`MailTransport`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use lettre::address::{Address, Envelope};
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::error::{Result, TaskError};
use crate::registry::BuiltinTask;

const LINE_WIDTH: usize = 76;
/// Port used when a server host is given without one.
const DEFAULT_SMTP_PORT: u16 = 25;
/// Implicit-TLS submission port; every other port upgrades with STARTTLS when offered.
const SMTPS_PORT: u16 = 465;

/// The `SendMail` parameter value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MailMessage {
    pub username: String,
    pub password: String,
    #[serde(rename = "serverhost")]
    pub server_host: String,
    #[serde(rename = "serverport")]
    pub server_port: u16,
    #[serde(rename = "senderaddr")]
    pub sender: String,
    #[serde(rename = "toaddr")]
    pub to: Vec<String>,
    #[serde(rename = "ccaddr")]
    pub cc: Vec<String>,
    #[serde(rename = "bccaddr")]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(rename = "msgbody")]
    pub body: String,
    /// Paths of files to attach.
    #[serde(rename = "attachment")]
    pub attachments: Vec<String>,
}

impl MailMessage {
    pub fn parse(value: &str) -> Result<Self> {
        serde_json::from_str(value).map_err(|e| invalid(format!("malformed message: {e}")))
    }

    pub fn validate(&self) -> Result<()> {
        if self.sender.trim().is_empty() {
            return Err(invalid("sender address is empty".into()));
        }
        if self.recipients().next().is_none() {
            return Err(invalid("at least one recipient is required".into()));
        }
        if let Some(bad) = self
            .recipients()
            .chain(std::iter::once(self.sender.as_str()))
            .find(|addr| !addr.contains('@') || addr.contains(['\r', '\n']))
        {
            return Err(invalid(format!("malformed address '{bad}'")));
        }
        if self.relay_requested() && self.server_host.trim().is_empty() {
            return Err(invalid("relay credentials given without a server host".into()));
        }
        if self.subject.contains(['\r', '\n']) {
            return Err(invalid("subject must be a single line".into()));
        }
        Ok(())
    }

    /// Every envelope recipient: to, cc, then bcc.
    pub fn recipients(&self) -> impl Iterator<Item = &str> {
        self.to
            .iter()
            .chain(&self.cc)
            .chain(&self.bcc)
            .map(String::as_str)
            .filter(|a| !a.trim().is_empty())
    }

    fn relay_requested(&self) -> bool {
        self.server_port != 0 || !self.username.is_empty()
    }

    /// Where the message goes: the named SMTP server, or the local sendmail
    /// when no server host is set.
    pub fn delivery(&self) -> Delivery<'_> {
        let host = self.server_host.trim();
        if host.is_empty() {
            return Delivery::Sendmail;
        }
        let port = match self.server_port {
            0 => DEFAULT_SMTP_PORT,
            port => port,
        };
        Delivery::Smtp { host, port }
    }

    /// Render an RFC 5322 message. Attachments are read from disk and sent
    /// base64 encoded in a `multipart/mixed` body.
    pub async fn render(&self) -> Result<String> {
        let mut attachments = Vec::with_capacity(self.attachments.len());
        for path in &self.attachments {
            let bytes = tokio::fs::read(path).await?;
            attachments.push((attachment_name(Path::new(path)), bytes));
        }
        let date = chrono::Utc::now().to_rfc2822();
        Ok(self.render_with(&date, &attachments))
    }

    fn render_with(&self, date: &str, attachments: &[(String, Vec<u8>)]) -> String {
        let mut out = String::new();
        header(&mut out, "Date", date);
        header(&mut out, "From", &self.sender);
        push_address_header(&mut out, "To", &self.to);
        push_address_header(&mut out, "Cc", &self.cc);
        push_address_header(&mut out, "Bcc", &self.bcc);
        header(&mut out, "Subject", &self.subject);
        header(&mut out, "MIME-Version", "1.0");

        if attachments.is_empty() {
            header(&mut out, "Content-Type", "text/plain; charset=utf-8");
            header(&mut out, "Content-Transfer-Encoding", "8bit");
            out.push_str("\r\n");
            out.push_str(&normalize_newlines(&self.body));
            out.push_str("\r\n");
            return out;
        }

        let boundary = boundary_for(date, &self.subject);
        header(
            &mut out,
            "Content-Type",
            &format!("multipart/mixed; boundary=\"{boundary}\""),
        );
        out.push_str("\r\n");

        out.push_str(&format!("--{boundary}\r\n"));
        header(&mut out, "Content-Type", "text/plain; charset=utf-8");
        header(&mut out, "Content-Transfer-Encoding", "8bit");
        out.push_str("\r\n");
        out.push_str(&normalize_newlines(&self.body));
        out.push_str("\r\n");

        for (name, bytes) in attachments {
            out.push_str(&format!("--{boundary}\r\n"));
            header(&mut out, "Content-Type", "application/octet-stream");
            header(&mut out, "Content-Transfer-Encoding", "base64");
            header(
                &mut out,
                "Content-Disposition",
                &format!("attachment; filename=\"{name}\""),
            );
            out.push_str("\r\n");
            let encoded = STANDARD.encode(bytes);
            for chunk in encoded.as_bytes().chunks(LINE_WIDTH) {
                // base64 output is ASCII
                out.push_str(std::str::from_utf8(chunk).unwrap_or_default());
                out.push_str("\r\n");
            }
        }
        out.push_str(&format!("--{boundary}--\r\n"));
        out
    }
}

fn invalid(reason: String) -> TaskError {
    TaskError::InvalidParameter {
        task: "SendMail",
        reason,
    }
}

fn header(out: &mut String, name: &str, value: &str) {
    out.push_str(&format!("{name}: {value}\r\n"));
}

fn push_address_header(out: &mut String, name: &str, addrs: &[String]) {
    let list: Vec<&str> = addrs
        .iter()
        .map(String::as_str)
        .filter(|a| !a.trim().is_empty())
        .collect();
    if !list.is_empty() {
        header(out, name, &list.join(", "));
    }
}

fn normalize_newlines(body: &str) -> String {
    body.replace("\r\n", "\n").replace('\n', "\r\n")
}

fn attachment_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().replace('"', ""))
        .unwrap_or_else(|| "attachment".to_string())
}

fn boundary_for(date: &str, subject: &str) -> String {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in date.bytes().chain(subject.bytes()) {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    format!("cadence-{hash:016x}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery<'a> {
    Smtp { host: &'a str, port: u16 },
    Sendmail,
}

/// The message as handed to an SMTP server: identical to `rendered` minus
/// the `Bcc` header, whose addresses only go into the envelope.
fn without_bcc_header(rendered: &str) -> String {
    let (head, body) = rendered.split_once("\r\n\r\n").unwrap_or((rendered, ""));
    let head: Vec<&str> = head
        .split("\r\n")
        .filter(|line| !line.starts_with("Bcc:"))
        .collect();
    format!("{}\r\n\r\n{body}", head.join("\r\n"))
}

/// Delivers a rendered message.
#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn send(&self, message: &MailMessage, rendered: &str) -> Result<()>;
}

/// Pipes messages into the local `sendmail -t -i`.
///
/// Recipients are taken from the headers; `Bcc` is stripped by sendmail.
#[derive(Debug, Clone)]
pub struct SendmailTransport {
    program: PathBuf,
}

impl SendmailTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for SendmailTransport {
    fn default() -> Self {
        Self::new("sendmail")
    }
}

#[async_trait]
impl MailTransport for SendmailTransport {
    async fn send(&self, message: &MailMessage, rendered: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .arg("-i")
            .arg("-f")
            .arg(&message.sender)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(rendered.as_bytes()).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(TaskError::Failed {
                task: "SendMail",
                reason: format!(
                    "{} exited with {}: {}",
                    self.program.display(),
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(())
    }
}

/// Sends through the SMTP server named in the message, authenticating when a
/// username is given.
#[derive(Debug, Clone, Default)]
pub struct SmtpTransport;

#[async_trait]
impl MailTransport for SmtpTransport {
    async fn send(&self, message: &MailMessage, rendered: &str) -> Result<()> {
        let Delivery::Smtp { host, port } = message.delivery() else {
            return Err(invalid("no SMTP server host given".into()));
        };

        let parameters =
            TlsParameters::new(host.to_string()).map_err(|e| smtp_failure(host, port, e))?;
        let tls = if port == SMTPS_PORT {
            Tls::Wrapper(parameters)
        } else {
            Tls::Opportunistic(parameters)
        };
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
            .port(port)
            .tls(tls);
        if !message.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                message.username.clone(),
                message.password.clone(),
            ));
        }
        let transport = builder.build();

        let envelope = envelope_for(message)?;
        transport
            .send_raw(&envelope, without_bcc_header(rendered).as_bytes())
            .await
            .map_err(|e| smtp_failure(host, port, e))?;
        debug!(host, port, "mail accepted by SMTP server");
        Ok(())
    }
}

fn envelope_for(message: &MailMessage) -> Result<Envelope> {
    let parse = |addr: &str| {
        addr.trim()
            .parse::<Address>()
            .map_err(|e| invalid(format!("malformed address '{addr}': {e}")))
    };
    let from = parse(&message.sender)?;
    let to = message.recipients().map(parse).collect::<Result<Vec<_>>>()?;
    Envelope::new(Some(from), to).map_err(|e| invalid(format!("unusable envelope: {e}")))
}

fn smtp_failure(host: &str, port: u16, err: impl std::fmt::Display) -> TaskError {
    TaskError::Failed {
        task: "SendMail",
        reason: format!("SMTP delivery via {host}:{port} failed: {err}"),
    }
}

/// Picks the transport per message from [`MailMessage::delivery`].
#[derive(Debug, Clone, Default)]
pub struct MailRouter {
    smtp: SmtpTransport,
    sendmail: SendmailTransport,
}

#[async_trait]
impl MailTransport for MailRouter {
    async fn send(&self, message: &MailMessage, rendered: &str) -> Result<()> {
        match message.delivery() {
            Delivery::Smtp { .. } => self.smtp.send(message, rendered).await,
            Delivery::Sendmail => self.sendmail.send(message, rendered).await,
        }
    }
}

pub struct SendMailTask {
    transport: Arc<dyn MailTransport>,
}

impl SendMailTask {
    pub fn new(transport: Arc<dyn MailTransport>) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl BuiltinTask for SendMailTask {
    async fn run(&self, value: &str) -> Result<()> {
        let message = MailMessage::parse(value)?;
        message.validate()?;
        let rendered = message.render().await?;
        debug!(
            recipients = message.recipients().count(),
            attachments = message.attachments.len(),
            "sending mail"
        );
        self.transport.send(&message, &rendered).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl MailTransport for CapturingTransport {
        async fn send(&self, _message: &MailMessage, rendered: &str) -> Result<()> {
            self.sent.lock().unwrap().push(rendered.to_string());
            Ok(())
        }
    }

    fn message() -> MailMessage {
        MailMessage {
            sender: "scheduler@example.com".into(),
            to: vec!["ops@example.com".into()],
            subject: "Nightly report".into(),
            body: "line one\nline two".into(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_the_wire_field_names() {
        let parsed = MailMessage::parse(
            r#"{"senderaddr":"a@b.c","toaddr":["d@e.f"],"ccaddr":[],"subject":"s","msgbody":"b","serverport":25,"serverhost":"smtp"}"#,
        )
        .unwrap();
        assert_eq!(parsed.sender, "a@b.c");
        assert_eq!(parsed.to, vec!["d@e.f".to_string()]);
        assert_eq!(parsed.server_port, 25);
        assert!(parsed.validate().is_ok());
    }

    #[test]
    fn a_message_needs_a_sender_and_a_recipient() {
        let mut m = message();
        m.sender.clear();
        assert!(m.validate().is_err());

        let mut m = message();
        m.to.clear();
        assert!(m.validate().is_err());

        let mut m = message();
        m.to.clear();
        m.bcc = vec!["hidden@example.com".into()];
        assert!(m.validate().is_ok());
    }

    #[test]
    fn relay_settings_require_a_host() {
        let mut m = message();
        m.server_port = 587;
        assert!(m.validate().is_err());
        m.server_host = "smtp.example.com".into();
        assert!(m.validate().is_ok());
    }

    #[test]
    fn server_host_selects_smtp_delivery() {
        let mut m = message();
        assert_eq!(m.delivery(), Delivery::Sendmail);

        m.server_host = "smtp.example.com".into();
        assert_eq!(
            m.delivery(),
            Delivery::Smtp {
                host: "smtp.example.com",
                port: 25
            }
        );

        m.server_port = 587;
        assert_eq!(
            m.delivery(),
            Delivery::Smtp {
                host: "smtp.example.com",
                port: 587
            }
        );
    }

    #[test]
    fn smtp_copy_drops_only_the_bcc_header() {
        let mut m = message();
        m.bcc = vec!["hidden@example.com".into()];
        m.body = "Bcc: stays in the body".into();
        let text = m.render_with("Mon, 1 Jan 2024 00:00:00 +0000", &[]);
        assert!(text.contains("Bcc: hidden@example.com\r\n"));

        let sent = without_bcc_header(&text);
        assert!(!sent.contains("hidden@example.com"));
        assert!(sent.contains("To: ops@example.com\r\n"));
        assert!(sent.ends_with("\r\n\r\nBcc: stays in the body\r\n"));
    }

    #[test]
    fn envelope_carries_every_recipient() {
        let mut m = message();
        m.cc = vec!["cc@example.com".into()];
        m.bcc = vec!["hidden@example.com".into()];
        let envelope = envelope_for(&m).unwrap();
        assert_eq!(envelope.to().len(), 3);
        assert_eq!(
            envelope.from().map(ToString::to_string).as_deref(),
            Some("scheduler@example.com")
        );
    }

    #[tokio::test]
    async fn smtp_transport_refuses_messages_without_a_host() {
        let err = SmtpTransport.send(&message(), "").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidParameter { task: "SendMail", .. }));
    }

    #[test]
    fn header_injection_is_refused() {
        let mut m = message();
        m.subject = "hi\r\nBcc: evil@example.com".into();
        assert!(m.validate().is_err());
    }

    #[test]
    fn plain_message_renders_headers_then_body() {
        let mut m = message();
        m.cc = vec!["cc@example.com".into()];
        let text = m.render_with("Mon, 1 Jan 2024 00:00:00 +0000", &[]);
        assert!(text.starts_with("Date: Mon, 1 Jan 2024 00:00:00 +0000\r\n"));
        assert!(text.contains("From: scheduler@example.com\r\n"));
        assert!(text.contains("To: ops@example.com\r\n"));
        assert!(text.contains("Cc: cc@example.com\r\n"));
        assert!(!text.contains("Bcc:"));
        assert!(text.ends_with("\r\n\r\nline one\r\nline two\r\n"));
    }

    #[test]
    fn attachments_are_base64_parts() {
        let m = message();
        let text = m.render_with(
            "Mon, 1 Jan 2024 00:00:00 +0000",
            &[("report.csv".into(), b"a,b\n1,2\n".to_vec())],
        );
        assert!(text.contains("multipart/mixed; boundary=\"cadence-"));
        assert!(text.contains("filename=\"report.csv\""));
        assert!(text.contains(&STANDARD.encode(b"a,b\n1,2\n")));
        assert!(text.trim_end().ends_with("--"));
    }

    #[tokio::test]
    async fn task_hands_the_rendered_message_to_the_transport() {
        let transport = Arc::new(CapturingTransport::default());
        let task = SendMailTask::new(transport.clone());
        let value = serde_json::to_string(&message()).unwrap();

        task.run(&value).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("Subject: Nightly report\r\n"));
    }

    #[tokio::test]
    async fn invalid_message_never_reaches_the_transport() {
        let transport = Arc::new(CapturingTransport::default());
        let task = SendMailTask::new(transport.clone());

        let err = task.run("{\"toaddr\":[]}").await.unwrap_err();
        assert!(matches!(err, TaskError::InvalidParameter { task: "SendMail", .. }));
        assert!(transport.sent.lock().unwrap().is_empty());
    }
}
