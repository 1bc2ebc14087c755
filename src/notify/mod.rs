//! Telegram signal notifications.

use crate::config::TelegramConfig;
use crate::risk::ExitLevels;
use crate::strategy::{Side, Signal};
use crate::utils::decimal::safe_div;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

/// Sends messages through the Telegram Bot API.
pub struct TelegramNotifier {
    http: Client,
    bot_token: String,
    chat_id: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

impl TelegramNotifier {
    /// `None` when no bot token or chat is configured.
    pub fn from_config(config: &TelegramConfig) -> Result<Option<Self>> {
        if !config.is_enabled() {
            debug!("Telegram notifications disabled");
            return Ok(None);
        }
        Self::new(&config.bot_token, &config.chat_id, &config.base_url).map(Some)
    }

    pub fn new(bot_token: &str, chat_id: &str, base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            bot_token: bot_token.to_string(),
            chat_id: chat_id.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub async fn send_message(&self, text: &str) -> Result<()> {
        let url = format!("{}/bot{}/sendMessage", self.base_url, self.bot_token);
        let body = json!({
            "chat_id": self.chat_id,
            "text": text,
            "disable_web_page_preview": true,
        });

        let response: ApiResponse = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .context("Failed to reach Telegram")?
            .error_for_status()
            .context("Telegram request rejected")?
            .json()
            .await
            .context("Failed to parse Telegram response")?;

        if !response.ok {
            anyhow::bail!(
                "Telegram refused message: {}",
                response.description.unwrap_or_default()
            );
        }

        info!(chat_id = %self.chat_id, "Telegram message sent");
        Ok(())
    }
}

/// Human-readable alert for an actionable signal.
pub fn format_signal_message(
    symbol: &str,
    strategy: &str,
    signal: &Signal,
    price: Decimal,
    levels: &ExitLevels,
    at: DateTime<Utc>,
) -> String {
    let (emoji, side) = match signal.side {
        Side::Buy => ("🚀", "BUY"),
        Side::Sell => ("📉", "SELL"),
        Side::Hold => ("⏸", "HOLD"),
    };

    let mut lines = vec![
        format!("{} {} SIGNAL", emoji, side),
        "━━━━━━━━━━━━━━━━━━".to_string(),
        format!("📊 Symbol: {}", symbol),
        format!("💰 Entry: ${:.2}", price),
    ];

    match signal.entry.as_ref().filter(|plan| !plan.targets.is_empty()) {
        Some(plan) => {
            for target in &plan.targets {
                lines.push(format!(
                    "🎯 {}: ${:.2} ({:+.1}%)",
                    target.label,
                    target.price,
                    pct_from(price, target.price)
                ));
            }
        }
        None => lines.push(format!(
            "🎯 Target: ${:.2} ({:+.1}%)",
            levels.target,
            pct_from(price, levels.target)
        )),
    }
    lines.push(format!(
        "🛑 Stop Loss: ${:.2} ({:+.1}%)",
        levels.stop,
        pct_from(price, levels.stop)
    ));
    lines.push(format!("📈 Strategy: {}", strategy));
    lines.push(format!("🎯 Confidence: {:.0}%", signal.confidence * 100.0));
    if let Some(reason) = &signal.reason {
        lines.push(format!("📝 Reason: {}", reason));
    }
    lines.push(format!("⏰ Time: {}", at.format("%Y-%m-%d %H:%M UTC")));
    lines.push("━━━━━━━━━━━━━━━━━━".to_string());
    lines.push("⚠️ Not financial advice.".to_string());

    lines.join("\n")
}

fn pct_from(base: Decimal, level: Decimal) -> Decimal {
    safe_div(level - base, base) * Decimal::ONE_HUNDRED
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{EntryPlan, ExitTarget};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn create_test_levels() -> ExitLevels {
        ExitLevels {
            stop: dec!(97),
            target: dec!(106),
        }
    }

    fn create_test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap()
    }

    #[test]
    fn test_format_buy_message() {
        let signal = Signal::buy(0.85).with_reason("EMA cross up");
        let msg = format_signal_message(
            "BTCUSDT",
            "ema_cross",
            &signal,
            dec!(100),
            &create_test_levels(),
            create_test_time(),
        );

        assert!(msg.starts_with("🚀 BUY SIGNAL"));
        assert!(msg.contains("Symbol: BTCUSDT"));
        assert!(msg.contains("Target: $106.00 (+6.0%)"));
        assert!(msg.contains("Stop Loss: $97.00 (-3.0%)"));
        assert!(msg.contains("Confidence: 85%"));
        assert!(msg.contains("Reason: EMA cross up"));
        assert!(msg.contains("2024-03-01 14:00 UTC"));
    }

    #[test]
    fn test_format_lists_entry_targets() {
        let plan = EntryPlan {
            tag: "S3".to_string(),
            targets: vec![
                ExitTarget {
                    label: "R1".to_string(),
                    price: dec!(104),
                    fraction: dec!(0.5),
                },
                ExitTarget {
                    label: "R2".to_string(),
                    price: dec!(108),
                    fraction: dec!(0.5),
                },
            ],
        };
        let signal = Signal::buy(0.95).with_entry(plan);
        let msg = format_signal_message(
            "ETHUSDT",
            "pivot_levels",
            &signal,
            dec!(100),
            &create_test_levels(),
            create_test_time(),
        );

        assert!(msg.contains("R1: $104.00 (+4.0%)"));
        assert!(msg.contains("R2: $108.00 (+8.0%)"));
        assert!(!msg.contains("🎯 Target:"));
    }

    #[test]
    fn test_disabled_without_token() {
        let config = TelegramConfig::default();
        assert!(TelegramNotifier::from_config(&config).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_send_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .and(body_partial_json(json!({ "chat_id": "42", "text": "hello" })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("TOKEN", "42", &server.uri()).unwrap();
        notifier.send_message("hello").await.unwrap();
    }

    #[tokio::test]
    async fn test_send_message_refused() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/botTOKEN/sendMessage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!({ "ok": false, "description": "chat not found" }),
            ))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new("TOKEN", "42", &server.uri()).unwrap();
        let err = notifier.send_message("hello").await.unwrap_err();
        assert!(err.to_string().contains("chat not found"));
    }
}
