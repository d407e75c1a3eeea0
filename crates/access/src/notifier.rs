//! 验证码投递
//!
//! 邮件通道是外部系统，这里只定义投递接口和几种实现：
//! 日志（开发环境）、Webhook（转交给外部邮件服务）、发件箱（测试用）。

use crate::error::{AccessError, AccessResult};
use crate::types::OtpPurpose;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// 一次待投递的验证码
#[derive(Clone, Serialize, Deserialize)]
pub struct OtpDelivery {
    pub identifier: String,
    pub purpose: OtpPurpose,
    pub code: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for OtpDelivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OtpDelivery")
            .field("identifier", &self.identifier)
            .field("purpose", &self.purpose)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// 验证码投递接口
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, delivery: &OtpDelivery) -> AccessResult<()>;

    fn name(&self) -> &'static str;
}

/// 将标识符打码后用于日志，例如 `a***e@example.com`
pub fn mask_identifier(identifier: &str) -> String {
    match identifier.split_once('@') {
        Some((local, domain)) => {
            let mut chars = local.chars();
            match (chars.next(), chars.last()) {
                (Some(first), Some(last)) => format!("{first}***{last}@{domain}"),
                (Some(first), None) => format!("{first}***@{domain}"),
                _ => format!("***@{domain}"),
            }
        }
        None => "***".to_string(),
    }
}

/// 只写日志的投递实现（开发环境）
///
/// 验证码本身不会写入日志
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn deliver(&self, delivery: &OtpDelivery) -> AccessResult<()> {
        info!(
            "Delivering {} code to {} (expires at {})",
            delivery.purpose,
            mask_identifier(&delivery.identifier),
            delivery.expires_at
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "log"
    }
}

/// 通过 HTTP POST 将验证码转交给外部邮件服务
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    url: String,
    bearer_token: Option<String>,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, bearer_token: Option<String>, timeout: Duration) -> AccessResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AccessError::Config(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            url,
            bearer_token,
            client,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn deliver(&self, delivery: &OtpDelivery) -> AccessResult<()> {
        let mut request = self.client.post(&self.url).json(delivery);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }

        debug!(
            "Posting {} code for {} to webhook",
            delivery.purpose,
            mask_identifier(&delivery.identifier)
        );

        let response = request
            .send()
            .await
            .map_err(|e| AccessError::Notification(format!("Webhook request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AccessError::Notification(format!(
                "Webhook returned status {status}: {error_text}"
            )));
        }

        Ok(())
    }

    fn name(&self) -> &'static str {
        "webhook"
    }
}

#[derive(Debug, Default)]
struct OutboxState {
    sent: Vec<OtpDelivery>,
    fail_next: u32,
    delay: Option<Duration>,
}

/// 记录所有投递的发件箱
///
/// 可以注入失败或延迟，用于测试投递失败时的回滚行为
#[derive(Debug, Default, Clone)]
pub struct OutboxNotifier {
    state: Arc<Mutex<OutboxState>>,
}

impl OutboxNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, OutboxState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 接下来的 n 次投递失败
    pub fn fail_next(&self, n: u32) {
        self.state().fail_next = n;
    }

    /// 每次投递前等待指定时长
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.state().delay = delay;
    }

    /// 已成功投递的全部记录
    pub fn sent(&self) -> Vec<OtpDelivery> {
        self.state().sent.clone()
    }

    /// 指定标识符和用途下最近一次投递的验证码
    pub fn latest_code(&self, identifier: &str, purpose: OtpPurpose) -> Option<String> {
        self.state()
            .sent
            .iter()
            .rev()
            .find(|d| d.identifier == identifier && d.purpose == purpose)
            .map(|d| d.code.clone())
    }
}

#[async_trait]
impl Notifier for OutboxNotifier {
    async fn deliver(&self, delivery: &OtpDelivery) -> AccessResult<()> {
        let delay = self.state().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(AccessError::Notification(
                "Outbox delivery failure injected".to_string(),
            ));
        }
        state.sent.push(delivery.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "outbox"
    }
}
