//! Payment confirmation delivery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;

/// Reply-to used when the tenant has no contact email.
pub const FALLBACK_REPLY_TO: &str = "soporte@promedia.mx";

/// Everything needed to tell a payer their payment went through.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PaymentConfirmation {
    pub payer_email: String,
    pub payer_name: Option<String>,
    pub tenant_name: String,
    pub reply_to: String,
    pub concept: String,
    pub amount: Decimal,
    pub currency: String,
    pub processor_reference: String,
}

impl PaymentConfirmation {
    pub fn subject(&self) -> String {
        format!(
            "Confirmación de tu pago: {} en {}",
            self.concept, self.tenant_name
        )
    }

    pub fn body(&self) -> String {
        let greeting = match &self.payer_name {
            Some(name) => format!("Hola {},", name),
            None => "Hola,".to_string(),
        };
        format!(
            "{}\n\nRecibimos tu pago de {} {} por \"{}\".\nReferencia: {}\n\n{}",
            greeting,
            self.amount,
            self.currency,
            self.concept,
            self.processor_reference,
            self.tenant_name
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_payment_confirmation(&self, confirmation: &PaymentConfirmation) -> Result<()>;
}

/// Logs confirmations instead of sending them. Used when no relay is set.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_payment_confirmation(&self, confirmation: &PaymentConfirmation) -> Result<()> {
        tracing::info!(
            to = %confirmation.payer_email,
            reply_to = %confirmation.reply_to,
            processor_reference = %confirmation.processor_reference,
            subject = %confirmation.subject(),
            "payment confirmation (log only)"
        );
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct RelayMessage<'a> {
    from: String,
    to: [&'a str; 1],
    reply_to: &'a str,
    subject: String,
    text: String,
}

/// Posts confirmations as JSON to an HTTP mail relay.
pub struct HttpRelayNotifier {
    client: reqwest::Client,
    relay_url: String,
    from_address: String,
}

impl HttpRelayNotifier {
    pub fn new(relay_url: impl Into<String>, from_address: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            relay_url: relay_url.into(),
            from_address: from_address.into(),
        }
    }

    fn message<'a>(&self, confirmation: &'a PaymentConfirmation) -> RelayMessage<'a> {
        RelayMessage {
            from: format!(
                "{} || Recibo de pago vía <{}>",
                confirmation.tenant_name, self.from_address
            ),
            to: [confirmation.payer_email.as_str()],
            reply_to: &confirmation.reply_to,
            subject: confirmation.subject(),
            text: confirmation.body(),
        }
    }
}

#[async_trait]
impl Notifier for HttpRelayNotifier {
    async fn send_payment_confirmation(&self, confirmation: &PaymentConfirmation) -> Result<()> {
        self.client
            .post(&self.relay_url)
            .json(&self.message(confirmation))
            .send()
            .await
            .context("Failed to send confirmation to mail relay")?
            .error_for_status()
            .context("Mail relay returned error status")?;
        tracing::debug!(
            processor_reference = %confirmation.processor_reference,
            "payment confirmation relayed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn confirmation() -> PaymentConfirmation {
        PaymentConfirmation {
            payer_email: "ana@example.com".into(),
            payer_name: Some("Ana".into()),
            tenant_name: "Clínica Sol".into(),
            reply_to: FALLBACK_REPLY_TO.into(),
            concept: "Consulta".into(),
            amount: Decimal::new(100000, 2),
            currency: "MXN".into(),
            processor_reference: "pi_1".into(),
        }
    }

    #[test]
    fn test_subject_and_body() {
        let c = confirmation();
        assert_eq!(c.subject(), "Confirmación de tu pago: Consulta en Clínica Sol");
        let body = c.body();
        assert!(body.starts_with("Hola Ana,"));
        assert!(body.contains("1000.00 MXN"));
        assert!(body.contains("pi_1"));
    }

    #[test]
    fn test_relay_message_shape() {
        let notifier = HttpRelayNotifier::new("http://relay.invalid/send", "contacto@promedia.mx");
        let c = confirmation();
        let json = serde_json::to_value(notifier.message(&c)).unwrap();
        assert_eq!(json["to"][0], "ana@example.com");
        assert_eq!(json["reply_to"], FALLBACK_REPLY_TO);
        assert_eq!(json["from"], "Clínica Sol || Recibo de pago vía <contacto@promedia.mx>");
    }

    #[tokio::test]
    async fn test_log_notifier_always_succeeds() {
        LogNotifier.send_payment_confirmation(&confirmation()).await.unwrap();
    }

    #[tokio::test]
    async fn test_relay_notifier_reports_transport_failure() {
        // Port 9 on localhost is never a mail relay.
        let notifier = HttpRelayNotifier::new("http://127.0.0.1:9/send", "no-reply@promedia.mx");
        assert!(notifier.send_payment_confirmation(&confirmation()).await.is_err());
    }
}
