//! AI decision subsystem: prompt templates, provider client, response parsing
//! and validation.

mod parser;
mod prompt;
mod provider;
mod templates;
mod validator;

pub use parser::parse_decisions;
pub use prompt::{build_prompt, PromptContext};
pub use provider::AiClient;
pub use templates::{TemplateInfo, TemplateStore};
pub use validator::{calculate_min_position_size, validate_decision};

use serde::{Deserialize, Serialize};

/// The action set an agent can be asked to perform. An unknown action fails
/// deserialization, which rejects the whole cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
	OpenLong,
	OpenShort,
	CloseLong,
	CloseShort,
	PartialClose,
	UpdateStopLoss,
	UpdateTakeProfit,
	Wait,
}

impl DecisionAction {
	pub fn is_open(&self) -> bool {
		matches!(self, DecisionAction::OpenLong | DecisionAction::OpenShort)
	}
}

/// One decision as returned by the provider. Unknown fields are permitted and
/// ignored; absent numeric fields default to zero and are caught by
/// validation where they matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
	pub symbol: String,
	pub action: DecisionAction,
	#[serde(default)]
	pub leverage: f64,
	#[serde(default)]
	pub position_size_usd: f64,
	#[serde(default)]
	pub stop_loss: f64,
	#[serde(default)]
	pub take_profit: f64,
	#[serde(default)]
	pub new_stop_loss: f64,
	#[serde(default)]
	pub new_take_profit: f64,
	#[serde(default)]
	pub close_percentage: f64,
	#[serde(default)]
	pub reasoning: String,
}
