//! Operator notifications (watering start/stop, phase summaries).
//! Delivery failures are logged by callers and never fatal.

use std::future::Future;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use tracing::info;

pub trait Notifier: Send + Sync {
    fn send(&self, text: &str) -> impl Future<Output = Result<()>> + Send;
}

/// Used when no Telegram credentials are configured.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        info!(target: "notify", "{text}");
        Ok(())
    }
}

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

pub struct TelegramNotifier {
    http: reqwest::Client,
    base_url: String,
    token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(token: String, chat_id: String) -> Result<Self> {
        Self::with_base_url("https://api.telegram.org".into(), token, chat_id)
    }

    pub fn with_base_url(base_url: String, token: String, chat_id: String) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base_url,
            token,
            chat_id,
        })
    }
}

impl Notifier for TelegramNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.token);
        let res = self
            .http
            .post(&url)
            .json(&SendMessage {
                chat_id: &self.chat_id,
                text,
            })
            .send()
            .await
            .context("telegram request failed")?;
        if !res.status().is_success() {
            bail!("telegram answered HTTP {}", res.status());
        }
        Ok(())
    }
}

/// Either backend, chosen at startup.
pub enum AnyNotifier {
    Telegram(TelegramNotifier),
    Log(LogNotifier),
}

impl Notifier for AnyNotifier {
    async fn send(&self, text: &str) -> Result<()> {
        match self {
            Self::Telegram(t) => t.send(text).await,
            Self::Log(l) => l.send(text).await,
        }
    }
}
