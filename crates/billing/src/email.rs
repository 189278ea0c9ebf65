//! Billing email notifications.
//!
//! Past-due, cancellation, and trial-ending notices delivered through the
//! Resend HTTP API. The service degrades to a logged no-op when
//! `RESEND_API_KEY` is not configured; notification failures never fail the
//! billing mutation that triggered them.

use serde_json::json;

use crate::error::{BillingError, BillingResult};

/// Email configuration.
#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub api_key: String,
    pub from_address: String,
}

/// Billing notification sender.
#[derive(Clone)]
pub struct BillingEmailService {
    config: Option<EmailConfig>,
    client: reqwest::Client,
}

impl BillingEmailService {
    /// Build from `RESEND_API_KEY` / `BILLING_EMAIL_FROM`. Returns a
    /// disabled service when the key is absent.
    pub fn from_env() -> Self {
        let config = std::env::var("RESEND_API_KEY").ok().map(|api_key| EmailConfig {
            api_key,
            from_address: std::env::var("BILLING_EMAIL_FROM")
                .unwrap_or_else(|_| "billing@campus.app".to_string()),
        });

        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.is_some()
    }

    async fn send(&self, to: &str, subject: &str, html: String) -> BillingResult<()> {
        let Some(config) = &self.config else {
            tracing::debug!(to = %to, subject = %subject, "Email not configured, skipping notification");
            return Ok(());
        };

        let response = self
            .client
            .post("https://api.resend.com/emails")
            .bearer_auth(&config.api_key)
            .json(&json!({
                "from": config.from_address,
                "to": [to],
                "subject": subject,
                "html": html,
            }))
            .send()
            .await
            .map_err(|e| BillingError::Internal(format!("Email send failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(BillingError::Internal(format!(
                "Email API returned {}",
                response.status()
            )));
        }

        Ok(())
    }

    pub async fn send_subscription_past_due(&self, to: &str, course_title: &str) -> BillingResult<()> {
        self.send(
            to,
            "Payment issue with your course subscription",
            format!(
                "<p>We couldn't process your latest payment for <strong>{}</strong>. \
                 Your access continues for now; please update your payment method to avoid interruption.</p>",
                course_title
            ),
        )
        .await
    }

    pub async fn send_subscription_cancelled(
        &self,
        to: &str,
        course_title: &str,
        access_until: &str,
    ) -> BillingResult<()> {
        self.send(
            to,
            "Your subscription has been cancelled",
            format!(
                "<p>Your subscription to <strong>{}</strong> has been cancelled. \
                 You keep access until {}.</p>",
                course_title, access_until
            ),
        )
        .await
    }

    pub async fn send_trial_ending(
        &self,
        to: &str,
        course_title: &str,
        days_remaining: i64,
    ) -> BillingResult<()> {
        self.send(
            to,
            "Your trial is ending soon",
            format!(
                "<p>Your trial for <strong>{}</strong> ends in {} day(s). \
                 Your first payment will be collected automatically.</p>",
                course_title, days_remaining
            ),
        )
        .await
    }

    pub async fn send_payment_failed(
        &self,
        to: &str,
        course_title: &str,
        amount_minor: i64,
    ) -> BillingResult<()> {
        self.send(
            to,
            "Payment failed",
            format!(
                "<p>Your payment of {}.{:02} for <strong>{}</strong> did not go through. \
                 No charge was made; you can try again from the course page.</p>",
                amount_minor / 100,
                amount_minor % 100,
                course_title
            ),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_config() {
        let service = BillingEmailService {
            config: None,
            client: reqwest::Client::new(),
        };
        assert!(!service.is_enabled());
    }

    #[tokio::test]
    async fn test_disabled_send_is_noop() {
        let service = BillingEmailService {
            config: None,
            client: reqwest::Client::new(),
        };
        // No configured key: sending succeeds without network access.
        service
            .send("user@example.com", "subject", "<p>body</p>".to_string())
            .await
            .unwrap();
    }
}
