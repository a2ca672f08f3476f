//! Alert rendering and chat webhook delivery.
//!
//! Webhook URLs are resolved on every dispatch so that rotated secrets take effect without a
//! restart. For each service the `<SERVICE>_WEBHOOK_URL` variable is read first and then
//! overridden by `{secret_dir}/<service>/webhook` when that file exists.

use minijinja::{Environment, context};
use reqwest::Client;
use serde_json::json;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::errors::{Error, Result};
use crate::state::PipelineState;

const DEFAULT_TEMPLATE: &str = include_str!("../templates/message.jinja");

/// Chat services and the env var holding each webhook URL.
const SERVICES: &[(&str, &str)] = &[("slack", "SLACK_WEBHOOK_URL"), ("gchat", "GCHAT_WEBHOOK_URL")];

#[derive(Debug, Clone)]
pub struct AlertRenderer {
    template_path: PathBuf,
}

impl AlertRenderer {
    pub fn new(template_path: impl Into<PathBuf>) -> Self {
        Self {
            template_path: template_path.into(),
        }
    }

    /// Renders the alert for every breached reservation in `state`.
    pub fn render(&self, state: &PipelineState) -> Result<String> {
        let source = match std::fs::read_to_string(&self.template_path) {
            Ok(source) => source,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %self.template_path.display(), "template not found, using built-in template");
                DEFAULT_TEMPLATE.to_string()
            }
            Err(e) => {
                return Err(Error::Other(
                    anyhow::Error::new(e).context(format!("failed to read template {}", self.template_path.display())),
                ));
            }
        };
        render_template(&source, state)
    }
}

pub fn render_template(source: &str, state: &PipelineState) -> Result<String> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);

    let breached: Vec<_> = state.breached().collect();
    let message = env.render_str(
        source,
        context! {
            reservations => &state.reservations,
            breached => breached,
        },
    )?;
    Ok(message)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct WebhookTargets {
    /// `(service, url)`; an empty URL means the service is not configured
    targets: Vec<(String, String)>,
}

impl WebhookTargets {
    pub fn resolve(secret_dir: &Path) -> Self {
        Self::resolve_with(|key| std::env::var(key).ok(), secret_dir)
    }

    pub fn resolve_with(lookup: impl Fn(&str) -> Option<String>, secret_dir: &Path) -> Self {
        let targets = SERVICES
            .iter()
            .map(|(service, var)| {
                let mut url = lookup(var).unwrap_or_default().trim().to_string();

                let secret = secret_dir.join(service).join("webhook");
                match std::fs::read_to_string(&secret) {
                    Ok(contents) => url = contents.trim().to_string(),
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => warn!(service, path = %secret.display(), error = %e, "failed to read webhook secret"),
                }

                (service.to_string(), url)
            })
            .collect();

        Self { targets }
    }

    pub fn url(&self, service: &str) -> Option<&str> {
        self.targets
            .iter()
            .find(|(name, _)| name == service)
            .map(|(_, url)| url.as_str())
            .filter(|url| !url.is_empty())
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self {
            targets: pairs.iter().map(|(s, u)| (s.to_string(), u.to_string())).collect(),
        }
    }
}

async fn deliver(http: &Client, service: &str, url: &str, message: &str) -> Result<()> {
    let webhook_error = |message: String| Error::Webhook {
        service: service.to_string(),
        message,
    };

    let response = http
        .post(url)
        .json(&json!({ "text": message }))
        .send()
        .await
        .map_err(|e| webhook_error(e.to_string()))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(webhook_error(format!("{status} - {body}")));
    }

    Ok(())
}

/// Posts `message` to every configured webhook. Returns how many deliveries succeeded.
pub async fn dispatch(http: &Client, targets: &WebhookTargets, message: &str) -> usize {
    let mut delivered = 0;

    for (service, url) in &targets.targets {
        if url.is_empty() {
            info!(service = %service, "webhook not configured, skipping");
            continue;
        }

        info!(service = %service, "publishing alert");
        match deliver(http, service, url, message).await {
            Ok(()) => delivered += 1,
            Err(e) => warn!(service = %service, error = %e, "alert delivery failed"),
        }
    }

    crate::metrics::record_alerts(delivered);
    delivered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Job, Reservation};
    use std::collections::HashMap;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn breached_state() -> PipelineState {
        let mut busy = Reservation::new("US", "R2", 10.0);
        busy.jobs = vec![
            Job {
                name: "a".to_string(),
                usage: 4.0,
            },
            Job {
                name: "b".to_string(),
                usage: 3.0,
            },
        ];
        busy.num_jobs = 2;
        busy.total_usage = 7.0;
        busy.total_usage_ceiling = 7;
        busy.threshold_breached = true;
        busy.percentage = "70.00".to_string();

        let mut quiet = Reservation::new("EU", "quiet", 100.0);
        quiet.percentage = "0.00".to_string();

        [busy, quiet].into_iter().collect()
    }

    #[test]
    fn test_default_template_lists_breached_only() {
        let message = render_template(DEFAULT_TEMPLATE, &breached_state()).unwrap();

        assert!(message.contains("`US.R2`: 70.00% of 10 slots"));
        assert!(message.contains("about 7 slots busy across 2 running queries"));
        assert!(!message.contains("quiet"));
    }

    #[test]
    fn test_template_for_capacityless_reservation() {
        let mut state = breached_state();
        if let Some(r) = state.reservations.get_mut("US.R2") {
            r.slots = 0.0;
            r.percentage = "n/a".to_string();
        }

        let message = render_template(DEFAULT_TEMPLATE, &state).unwrap();
        assert!(message.contains("`US.R2`: no committed slots"));
    }

    #[test]
    fn test_renderer_prefers_template_file() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("message.jinja");
        std::fs::write(&template, "{{ breached | length }} of {{ reservations | length }} over").unwrap();

        let message = AlertRenderer::new(&template).render(&breached_state()).unwrap();
        assert_eq!(message, "1 of 2 over");

        let fallback = AlertRenderer::new(dir.path().join("absent.jinja"))
            .render(&breached_state())
            .unwrap();
        assert!(fallback.contains("US.R2"));
    }

    #[test]
    fn test_broken_template_is_an_error() {
        let err = render_template("{% for r in breached %}", &breached_state()).unwrap_err();
        assert!(matches!(err, Error::Template(_)));
    }

    #[test]
    fn test_secret_files_override_env() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("gchat")).unwrap();
        std::fs::write(dir.path().join("gchat").join("webhook"), "https://chat.example/rotated\n").unwrap();

        let env: HashMap<&str, &str> = [
            ("SLACK_WEBHOOK_URL", "https://hooks.example/slack"),
            ("GCHAT_WEBHOOK_URL", "https://chat.example/stale"),
        ]
        .into_iter()
        .collect();

        let targets = WebhookTargets::resolve_with(|key| env.get(key).map(|v| v.to_string()), dir.path());

        assert_eq!(targets.url("slack"), Some("https://hooks.example/slack"));
        assert_eq!(targets.url("gchat"), Some("https://chat.example/rotated"));
    }

    #[test]
    fn test_unconfigured_services() {
        let dir = tempfile::tempdir().unwrap();
        let targets = WebhookTargets::resolve_with(|_| None, dir.path());

        assert_eq!(targets.url("slack"), None);
        assert_eq!(targets.url("gchat"), None);
    }

    #[tokio::test]
    async fn test_dispatch_posts_text_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/slack"))
            .and(body_json(json!({"text": "reservation US.R2 at 70.00%"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/gchat"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let slack = format!("{}/slack", server.uri());
        let gchat = format!("{}/gchat", server.uri());
        let targets = WebhookTargets::from_pairs(&[("slack", slack.as_str()), ("gchat", gchat.as_str()), ("teams", "")]);

        let delivered = dispatch(&crate::http_client().unwrap(), &targets, "reservation US.R2 at 70.00%").await;
        assert_eq!(delivered, 1);
    }
}
