//! Read-only chat commands
//!
//! [`CommandResponder`] long-polls a [`MessageSource`] and answers `/start`,
//! `/status` and `/balance` from the latest published cycle report. Only the
//! configured chat is answered; nothing here touches the ledger.

use rust_decimal::Decimal;
use std::fmt::Write;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{AccountBalance, InboundMessage, MessageSink, MessageSource};
use crate::error::EngineResult;
use crate::report::render_broadcast;
use crate::sinks::SnapshotStore;

const RETRY_DELAY: Duration = Duration::from_secs(5);
const BALANCE_COIN: &str = "USDT";
const NO_CYCLE_YET: &str = "No cycle has completed yet.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Status,
    Balance,
}

impl Command {
    /// `"/balance@DigiBot now"` -> `Balance`. Text that is not a slash
    /// command yields `None`.
    pub fn parse(text: &str) -> Option<Result<Self, String>> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = word.split('@').next().unwrap_or(word).to_lowercase();
        Some(match name.as_str() {
            "start" | "help" => Ok(Command::Start),
            "status" => Ok(Command::Status),
            "balance" => Ok(Command::Balance),
            _ => Err(name),
        })
    }
}

pub struct CommandResponder {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn MessageSink>,
    chat_id: String,
    snapshots: SnapshotStore,
    balance: Option<Arc<dyn AccountBalance>>,
    offset: Option<i64>,
}

impl CommandResponder {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn MessageSink>,
        chat_id: impl Into<String>,
        snapshots: SnapshotStore,
    ) -> Self {
        Self {
            source,
            sink,
            chat_id: chat_id.into(),
            snapshots,
            balance: None,
            offset: None,
        }
    }

    /// Also report the exchange wallet on `/balance`
    pub fn with_account_balance(mut self, balance: Arc<dyn AccountBalance>) -> Self {
        self.balance = Some(balance);
        self
    }

    /// Poll until `shutdown` resolves; poll errors are logged and retried.
    pub async fn run<F>(&mut self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        info!(chat_id = %self.chat_id, "Command listener starting");

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Command poll failed");
                        tokio::select! {
                            _ = &mut shutdown => break,
                            _ = tokio::time::sleep(RETRY_DELAY) => {}
                        }
                    }
                }
            }
        }

        info!("Command listener stopped");
    }

    /// Fetch one batch of messages and answer the commands in it. Returns
    /// the number of replies sent.
    pub async fn poll_once(&mut self) -> EngineResult<usize> {
        let messages = self.source.poll_messages(self.offset).await?;
        let mut replies = 0;

        for message in messages {
            self.offset = Some(message.update_id + 1);
            let Some(reply) = self.answer(&message).await else {
                continue;
            };
            match self.sink.send_message(&self.chat_id, &reply).await {
                Ok(()) => replies += 1,
                Err(e) => warn!(update_id = message.update_id, error = %e, "Command reply failed"),
            }
        }
        Ok(replies)
    }

    async fn answer(&self, message: &InboundMessage) -> Option<String> {
        let parsed = Command::parse(&message.text)?;
        if message.chat_id != self.chat_id {
            debug!(chat_id = %message.chat_id, "Ignoring command from another chat");
            return None;
        }

        let command = match parsed {
            Ok(command) => command,
            Err(name) => return Some(format!("Unknown command /{}. {}", name, usage())),
        };
        debug!(?command, "Answering command");

        Some(match command {
            Command::Start => format!("DigiBot ready. {}", usage()),
            Command::Status => match self.snapshots.latest().await {
                Some(report) => render_broadcast(&report),
                None => NO_CYCLE_YET.to_string(),
            },
            Command::Balance => self.balance_reply().await,
        })
    }

    async fn balance_reply(&self) -> String {
        let mut out = String::new();
        match self.snapshots.latest().await {
            Some(report) => {
                let _ = writeln!(out, "Paper wallet: {} USDT", round(report.wallet));
                let _ = writeln!(out, "Vault: {} USDT", round(report.vault));
                let _ = write!(
                    out,
                    "Equity: {} USDT ({} open)",
                    round(report.equity),
                    report.open_positions
                );
            }
            None => out.push_str(NO_CYCLE_YET),
        }

        if let Some(balance) = &self.balance {
            let _ = writeln!(out);
            match balance.wallet_balance(BALANCE_COIN).await {
                Ok(amount) => {
                    let _ = write!(out, "Bybit {}: {}", BALANCE_COIN, round(amount));
                }
                Err(e) => {
                    warn!(error = %e, "Exchange balance lookup failed");
                    let _ = write!(out, "Bybit balance unavailable");
                }
            }
        }
        out
    }
}

fn usage() -> &'static str {
    "Commands: /status, /balance"
}

fn round(value: Decimal) -> Decimal {
    value.round_dp(2).normalize()
}
