use crate::config::SmtpConfig;
use crate::workflows::actions::render;
use crate::workflows::{CollaboratorError, CollaboratorResult, EmailSink};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::{authentication::Credentials, PoolConfig},
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{error, info};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailTemplate {
    pub subject: String,
    pub html_body: String,
    pub text_body: Option<String>,
}

impl EmailTemplate {
    /// Used for template names nobody registered: the data is sent as-is
    fn fallback(name: &str, data: &Value) -> Self {
        let body = serde_json::to_string_pretty(data).unwrap_or_default();
        Self {
            subject: name.replace(['_', '-'], " "),
            html_body: format!("<pre>{}</pre>", body),
            text_body: Some(body),
        }
    }

    fn rendered(&self, data: &Value) -> Self {
        Self {
            subject: render(&self.subject, data),
            html_body: render(&self.html_body, data),
            text_body: self.text_body.as_deref().map(|t| render(t, data)),
        }
    }
}

/// Sends workflow emails over SMTP, rendering named templates with the
/// action's data
#[derive(Debug, Clone)]
pub struct SmtpEmailSink {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_email: String,
    from_name: String,
    templates: HashMap<String, EmailTemplate>,
}

impl SmtpEmailSink {
    pub fn new(smtp_config: &SmtpConfig) -> Self {
        let creds = Credentials::new(
            smtp_config.username.clone(),
            smtp_config.password.clone(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&smtp_config.host)
            .port(smtp_config.port)
            .credentials(creds)
            .pool_config(PoolConfig::new().max_size(10))
            .timeout(Some(Duration::from_secs(10)))
            .build();

        Self {
            transport,
            from_email: smtp_config.from_email.clone(),
            from_name: smtp_config.from_name.clone(),
            templates: HashMap::new(),
        }
    }

    pub fn with_template(mut self, name: impl Into<String>, template: EmailTemplate) -> Self {
        self.templates.insert(name.into(), template);
        self
    }

    fn build_message(&self, to_email: &str, template: &EmailTemplate) -> CollaboratorResult<Message> {
        let from = format!("{} <{}>", self.from_name, self.from_email)
            .parse::<Mailbox>()
            .map_err(|e| CollaboratorError::Failed(format!("invalid sender: {}", e)))?;
        let to = to_email
            .parse::<Mailbox>()
            .map_err(|e| CollaboratorError::Failed(format!("invalid recipient {}: {}", to_email, e)))?;

        let builder = Message::builder().from(from).to(to).subject(&template.subject);

        let message = match &template.text_body {
            Some(text) => builder.multipart(
                lettre::message::MultiPart::alternative()
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_PLAIN)
                            .body(text.clone()),
                    )
                    .singlepart(
                        lettre::message::SinglePart::builder()
                            .header(ContentType::TEXT_HTML)
                            .body(template.html_body.clone()),
                    ),
            ),
            None => builder
                .header(ContentType::TEXT_HTML)
                .body(template.html_body.clone()),
        };

        message.map_err(|e| CollaboratorError::Failed(e.to_string()))
    }
}

#[async_trait]
impl EmailSink for SmtpEmailSink {
    async fn send(&self, template: &str, recipients: &[String], data: &Value) -> CollaboratorResult<()> {
        let rendered = match self.templates.get(template) {
            Some(registered) => registered.rendered(data),
            None => EmailTemplate::fallback(template, data),
        };

        for recipient in recipients {
            let message = self.build_message(recipient, &rendered)?;
            match self.transport.send(message).await {
                Ok(_) => info!("Email '{}' sent successfully to {}", template, recipient),
                Err(e) => {
                    error!("Failed to send email '{}' to {}: {}", template, recipient, e);
                    return Err(CollaboratorError::Failed(e.to_string()));
                }
            }
        }

        Ok(())
    }
}

/// Stand-in when SMTP is not configured: emails are only logged
#[derive(Debug, Clone, Default)]
pub struct LogEmailSink;

#[async_trait]
impl EmailSink for LogEmailSink {
    async fn send(&self, template: &str, recipients: &[String], _data: &Value) -> CollaboratorResult<()> {
        info!(
            "SMTP not configured, skipping email '{}' to {}",
            template,
            recipients.join(", ")
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_registered_template_is_rendered_with_data() {
        let template = EmailTemplate {
            subject: "Ticket {{ticket}} escalated".to_string(),
            html_body: "<p>{{ reason }}</p>".to_string(),
            text_body: None,
        };
        let rendered = template.rendered(&json!({"ticket": 42, "reason": "SLA breach"}));
        assert_eq!(rendered.subject, "Ticket 42 escalated");
        assert_eq!(rendered.html_body, "<p>SLA breach</p>");
    }

    #[test]
    fn test_unknown_template_falls_back_to_raw_data() {
        let fallback = EmailTemplate::fallback("ticket_escalated", &json!({"ticket": 42}));
        assert_eq!(fallback.subject, "ticket escalated");
        assert!(fallback.text_body.unwrap().contains("\"ticket\": 42"));
    }
}
