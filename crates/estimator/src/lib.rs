//! Best-effort token-count estimation, calibrated against the real
//! tokenizer once (if available) but otherwise used on the hot path without
//! ever calling back into the inference subprocess.
//!
//! Undercounts long CJK content; intentionally conservative for the
//! Latin-heavy prompt bodies this system typically builds.

use futures::future::BoxFuture;
use orc_core::Message;

/// Async tokenize callback: takes text, returns a token count.
pub type TokenizeFn = std::sync::Arc<
    dyn Fn(String) -> BoxFuture<'static, anyhow::Result<usize>> + Send + Sync,
>;

const DEFAULT_CHARS_PER_TOKEN: f64 = 3.5;
const CALIBRATION_SAMPLE: &str =
    "The quick brown fox jumps over the lazy dog while the five boxing wizards \
     jump quickly. Pack my box with five dozen liquor jugs, then a jovial \
     zephyr flew across the vexed waltzing gnomes. How vexingly quick daft \
     zebras jump over lazy, puzzled sphinxes of black quartz, judging the \
     mixed vow.";

const ROLE_OVERHEAD: usize = 4;
const TOOL_CALL_OVERHEAD: usize = 4;

#[derive(Debug, Clone)]
pub struct TokenEstimator {
    chars_per_token: f64,
    calibrated: bool,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self {
            chars_per_token: DEFAULT_CHARS_PER_TOKEN,
            calibrated: false,
        }
    }
}

impl TokenEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_calibrated(&self) -> bool {
        self.calibrated
    }

    pub fn chars_per_token(&self) -> f64 {
        self.chars_per_token
    }

    /// Calibrate the ratio against a real tokenizer. Leaves the default ratio
    /// intact if `tokenize` fails or returns 0.
    pub async fn calibrate(&mut self, tokenize: &TokenizeFn) {
        match tokenize(CALIBRATION_SAMPLE.to_string()).await {
            Ok(n) if n > 0 => {
                self.chars_per_token = CALIBRATION_SAMPLE.len() as f64 / n as f64;
                self.calibrated = true;
                tracing::info!(chars_per_token = self.chars_per_token, "token estimator calibrated");
            }
            Ok(_) => tracing::warn!("calibration tokenize returned 0 tokens; keeping default ratio"),
            Err(err) => tracing::warn!(?err, "token estimator calibration failed; keeping default ratio"),
        }
    }

    pub fn estimate(&self, text: &str) -> usize {
        if text.is_empty() {
            return 0;
        }
        (text.chars().count() as f64 / self.chars_per_token).ceil() as usize
    }

    fn message_cost(&self, msg: &Message) -> usize {
        let mut cost = ROLE_OVERHEAD + self.estimate(&msg.content);
        for call in &msg.tool_calls {
            cost += TOOL_CALL_OVERHEAD
                + self.estimate(&call.function.name)
                + self.estimate(&call.function.arguments);
        }
        if msg.role == orc_core::Role::Tool {
            if let Some(id) = &msg.tool_call_id {
                cost += self.estimate(id);
            }
            if let Some(name) = &msg.tool_name {
                cost += self.estimate(name);
            }
        }
        cost
    }

    pub fn estimate_messages(&self, messages: &[Message]) -> usize {
        messages.iter().map(|m| self.message_cost(m)).sum()
    }
}
