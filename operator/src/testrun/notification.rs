//! Delivers the completion message of a test run.
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client, ResourceExt};
use serde::Serialize;
use serde_json::json;
use testrun_common::outcome::Outcome;
use tracing::info;

use crate::{
    error::{Error, Result},
    testrun::{NotificationSpec, TestRun},
};

/// Secret key holding the endpoint URL when none is configured.
pub const DEFAULT_SECRET_KEY: &str = "webhook-url";

/// Content of a completion message.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationMessage {
    /// Namespace of the test run
    pub namespace: String,
    /// Name of the test run
    pub name: String,
    /// Result of the test run
    pub outcome: Outcome,
    /// Public URL of the report, when one was rendered
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_url: Option<String>,
}

impl NotificationMessage {
    /// Build the message for a run.
    pub fn new(run: &TestRun, report_url: Option<String>, outcome: Outcome) -> Self {
        Self {
            namespace: run.namespace().unwrap_or_default(),
            name: run.name_any(),
            outcome,
            report_url,
        }
    }

    /// Human readable summary.
    pub fn text(&self) -> String {
        let mut text = format!(
            "Test run {}/{} {}.",
            self.namespace, self.name, self.outcome
        );
        if let Some(url) = &self.report_url {
            text.push_str(&format!(" Report: {url}"));
        }
        text
    }
}

/// Supported notification endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationProvider {
    /// Slack incoming webhook
    Slack,
    /// Generic JSON webhook
    Webhook,
}

impl NotificationProvider {
    /// Select the provider of a notification spec.
    pub fn from_spec(spec: &NotificationSpec) -> Result<Self> {
        match spec.provider.as_str() {
            "slack" => Ok(NotificationProvider::Slack),
            "webhook" => Ok(NotificationProvider::Webhook),
            other => Err(Error::Config(format!(
                "unknown notification provider {other:?}"
            ))),
        }
    }

    /// Request body for `message`.
    pub fn payload(&self, message: &NotificationMessage) -> Result<serde_json::Value> {
        Ok(match self {
            NotificationProvider::Slack => json!({ "text": message.text() }),
            NotificationProvider::Webhook => {
                let mut body = serde_json::to_value(message)?;
                body["text"] = json!(message.text());
                body
            }
        })
    }
}

/// Delivers completion messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Send the outcome of `run`, with the report URL when available.
    async fn send(&self, run: &TestRun, report_url: Option<String>, outcome: Outcome)
        -> Result<()>;
}

/// Posts messages to a URL read from a secret.
pub struct WebhookNotifier {
    k_client: Client,
    http: reqwest::Client,
}

impl WebhookNotifier {
    /// Create a notifier whose requests time out after `timeout`.
    pub fn new(k_client: Client, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { k_client, http })
    }

    async fn endpoint(&self, run: &TestRun, spec: &NotificationSpec) -> Result<String> {
        let namespace = run.namespace().ok_or(Error::MissingNamespace)?;
        let secrets: Api<Secret> = Api::namespaced(self.k_client.clone(), &namespace);
        let key = spec.secret_key.as_deref().unwrap_or(DEFAULT_SECRET_KEY);
        let secret = match secrets.get_opt(&spec.secret_name).await? {
            Some(secret) => secret,
            None => {
                return Err(Error::Config(format!(
                    "notification secret {} not found",
                    spec.secret_name
                )))
            }
        };
        secret_value(&secret, key).ok_or_else(|| {
            Error::Config(format!(
                "notification secret {} has no key {key}",
                spec.secret_name
            ))
        })
    }
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret
        .data
        .as_ref()
        .and_then(|data| data.get(key))
        .and_then(|value| String::from_utf8(value.0.clone()).ok())
        .or_else(|| {
            secret
                .string_data
                .as_ref()
                .and_then(|data| data.get(key).cloned())
        })
        .map(|url| url.trim().to_owned())
        .filter(|url| !url.is_empty())
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn send(
        &self,
        run: &TestRun,
        report_url: Option<String>,
        outcome: Outcome,
    ) -> Result<()> {
        let spec = run.spec.notification.as_ref().ok_or_else(|| {
            Error::Config("notifyReport is set but no notification is configured".to_owned())
        })?;
        let provider = NotificationProvider::from_spec(spec)?;
        let url = self.endpoint(run, spec).await?;
        let message = NotificationMessage::new(run, report_url, outcome);
        self.http
            .post(url)
            .json(&provider.payload(&message)?)
            .send()
            .await?
            .error_for_status()?;
        info!(name = %message.name, namespace = %message.namespace, %outcome, "notification sent");
        Ok(())
    }
}
