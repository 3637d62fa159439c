use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::{
    message::{header::ContentType, MultiPart, SinglePart},
    transport::smtp::authentication::Credentials,
    Message, SmtpTransport, Transport,
};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use crate::config::SmtpConfig;

/// What the recipient needs to redeem a code.
pub struct CodeDelivery<'a> {
    pub to_email: &'a str,
    pub full_name: &'a str,
    pub code: &'a SecretString,
    pub expires_at: DateTime<Utc>,
    pub custom_message: Option<&'a str>,
}

#[async_trait]
pub trait CodeMailer: Send + Sync {
    /// Deliver a code. Errors carry a human-readable reason and never the code itself.
    async fn send_activation_code(&self, delivery: CodeDelivery<'_>) -> Result<(), String>;
}

/// Records sends in the log without the code. Used when SMTP is not configured.
#[derive(Clone, Default)]
pub struct LogMailer;

#[async_trait]
impl CodeMailer for LogMailer {
    async fn send_activation_code(&self, delivery: CodeDelivery<'_>) -> Result<(), String> {
        tracing::info!(
            to = %delivery.to_email,
            expires_at = %delivery.expires_at,
            "SMTP not configured; activation code delivery logged only"
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct SmtpMailer {
    mailer: SmtpTransport,
    from_email: String,
}

impl SmtpMailer {
    pub fn new(config: &SmtpConfig) -> anyhow::Result<Self> {
        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().clone(),
        );

        let mailer = SmtpTransport::starttls_relay(&config.host)
            .map_err(|e| anyhow::anyhow!("Invalid SMTP relay {}: {}", config.host, e))?
            .credentials(creds)
            .port(config.port)
            .timeout(Some(Duration::from_secs(10)))
            .build();

        tracing::info!(host = %config.host, port = config.port, "Activation mailer initialized with SMTP");

        Ok(Self {
            mailer,
            from_email: config.from_email.clone(),
        })
    }
}

/// Escape text for an HTML element body or a quoted attribute.
fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

fn render_bodies(delivery: &CodeDelivery<'_>) -> (String, String) {
    let code = delivery.code.expose_secret();
    let expires = delivery.expires_at.format("%Y-%m-%d %H:%M UTC");
    let note = delivery.custom_message.unwrap_or_default();

    let plain = format!(
        "Hello {},\n\n{}\n\nYour activation code is: {}\n\nIt expires on {}. \
         The code can be used once. If you did not expect this message, ignore it.",
        delivery.full_name, note, code, expires
    );

    let html = format!(
        r###"<html>
    <body style="font-family: Arial, sans-serif;">
        <h2>Activate your account</h2>
        <p>Hello {},</p>
        <p>{}</p>
        <p style="font-size: 22px; letter-spacing: 3px;"><strong>{}</strong></p>
        <p style="color: #666; font-size: 12px;">
            This code expires on {} and can be used once. If you did not expect this message, ignore it.
        </p>
    </body>
</html>
"###,
        escape_html(delivery.full_name),
        escape_html(note),
        code,
        expires
    );

    (plain, html)
}

#[async_trait]
impl CodeMailer for SmtpMailer {
    async fn send_activation_code(&self, delivery: CodeDelivery<'_>) -> Result<(), String> {
        let (plain_body, html_body) = render_bodies(&delivery);

        let email = Message::builder()
            .from(
                self.from_email
                    .parse()
                    .map_err(|e: lettre::address::AddressError| e.to_string())?,
            )
            .to(delivery
                .to_email
                .parse()
                .map_err(|e: lettre::address::AddressError| e.to_string())?)
            .subject("Your activation code")
            .multipart(
                MultiPart::alternative()
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(plain_body),
                    )
                    .singlepart(
                        SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(html_body),
                    ),
            )
            .map_err(|e| e.to_string())?;

        // Send email in blocking thread pool to avoid blocking async runtime
        let mailer = self.mailer.clone();
        let result = tokio::task::spawn_blocking(move || mailer.send(&email))
            .await
            .map_err(|e| e.to_string())?;

        match result {
            Ok(_) => {
                tracing::info!(to = %delivery.to_email, "Activation code email sent");
                Ok(())
            }
            Err(e) => {
                tracing::error!(error = %e, to = %delivery.to_email, "Failed to send activation code email");
                Err(e.to_string())
            }
        }
    }
}
