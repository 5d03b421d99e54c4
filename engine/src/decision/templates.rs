//! Prompt template registry. Templates are plain-text files in the prompts
//! directory with an optional `templates.json` carrying display metadata.
//! Loaded once at startup; `reload` replaces the map under the write lock.

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::{collections::HashMap, path::PathBuf};
use tracing::{info, warn};

pub const DEFAULT_TEMPLATE_NAME: &str = "default";

/// Shipped fallback so a fresh install trades before anyone writes a prompt.
const BUILTIN_DEFAULT: &str = r#"You are an autonomous crypto perpetual-futures trading agent.

You receive the account state, open positions and recent candles for a set of
symbols. Respond with a JSON array of decision objects and nothing else. Each
object has: symbol, action (open_long | open_short | close_long | close_short |
partial_close | update_stop_loss | update_take_profit | wait), leverage,
position_size_usd, stop_loss, take_profit, new_stop_loss, new_take_profit,
close_percentage, reasoning.

Rules:
- Always set stop_loss and take_profit on opens.
- Never use thousands separators in numbers.
- Prefer wait over low-conviction trades.
"#;

#[derive(Debug, Clone, Serialize)]
pub struct TemplateInfo {
	pub name: String,
	/// Bilingual display name / description from templates.json, verbatim.
	pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
struct Template {
	body: String,
	metadata: serde_json::Value,
}

pub struct TemplateStore {
	dir: PathBuf,
	templates: RwLock<HashMap<String, Template>>,
}

impl TemplateStore {
	/// Load the registry. A missing directory is not an error; the builtin
	/// default is always present.
	pub fn load(dir: PathBuf) -> Result<Self> {
		let store =
			Self { dir, templates: RwLock::new(HashMap::new()) };
		store.reload()?;
		Ok(store)
	}

	/// Re-read every template from disk and swap the registry in one step.
	pub fn reload(&self) -> Result<()> {
		let mut templates = HashMap::new();
		templates.insert(
			DEFAULT_TEMPLATE_NAME.to_string(),
			Template { body: BUILTIN_DEFAULT.to_string(), metadata: serde_json::Value::Null },
		);

		let metadata: HashMap<String, serde_json::Value> = match std::fs::read_to_string(
			self.dir.join("templates.json"),
		) {
			Ok(raw) => serde_json::from_str(&raw)
				.context("templates.json is not a name -> metadata object")?,
			Err(_) => HashMap::new(),
		};

		match std::fs::read_dir(&self.dir) {
			Ok(entries) => {
				for entry in entries.flatten() {
					let path = entry.path();
					if path.extension().and_then(|e| e.to_str()) != Some("txt") {
						continue;
					}
					let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
						continue;
					};
					match std::fs::read_to_string(&path) {
						Ok(body) => {
							templates.insert(
								name.to_string(),
								Template {
									body,
									metadata: metadata
										.get(name)
										.cloned()
										.unwrap_or(serde_json::Value::Null),
								},
							);
						},
						Err(error) => {
							warn!(template = name, %error, "Skipping unreadable template");
						},
					}
				}
			},
			Err(_) => {
				info!(dir = %self.dir.display(), "No prompts directory, using builtin default");
			},
		}

		info!(count = templates.len(), "Loaded prompt templates");
		*self.templates.write() = templates;
		Ok(())
	}

	/// Template body by name, falling back to `default` for unknown names.
	pub fn body(&self, name: &str) -> String {
		let templates = self.templates.read();
		templates
			.get(name)
			.or_else(|| templates.get(DEFAULT_TEMPLATE_NAME))
			.map(|t| t.body.clone())
			.expect("default template always present")
	}

	pub fn get(&self, name: &str) -> Option<TemplateInfo> {
		self.templates.read().get(name).map(|t| TemplateInfo {
			name: name.to_string(),
			metadata: t.metadata.clone(),
		})
	}

	pub fn list(&self) -> Vec<TemplateInfo> {
		let mut infos: Vec<TemplateInfo> = self
			.templates
			.read()
			.iter()
			.map(|(name, t)| TemplateInfo { name: name.clone(), metadata: t.metadata.clone() })
			.collect();
		infos.sort_by(|a, b| a.name.cmp(&b.name));
		infos
	}

	/// Write (or overwrite) a template file and reload the registry.
	pub fn save(&self, name: &str, body: &str) -> Result<()> {
		anyhow::ensure!(
			name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'),
			"template name must be alphanumeric with dashes"
		);
		std::fs::create_dir_all(&self.dir)?;
		std::fs::write(self.dir.join(format!("{name}.txt")), body)?;
		self.reload()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn builtin_default_always_present() {
		let store = TemplateStore::load(PathBuf::from("/nonexistent/prompts")).unwrap();
		assert!(store.body("default").contains("JSON array"));
		// Unknown template names fall back to default
		assert_eq!(store.body("missing"), store.body("default"));
	}

	#[test]
	fn loads_and_reloads_from_disk() {
		let dir = tempfile::tempdir().unwrap();
		std::fs::write(dir.path().join("scalper.txt"), "scalp fast").unwrap();
		std::fs::write(
			dir.path().join("templates.json"),
			r#"{"scalper": {"name": {"en": "Scalper", "zh": "短线"}, "description": {"en": "fast"}}}"#,
		)
		.unwrap();

		let store = TemplateStore::load(dir.path().to_path_buf()).unwrap();
		assert_eq!(store.body("scalper"), "scalp fast");
		let info = store.get("scalper").unwrap();
		assert_eq!(info.metadata["name"]["zh"], "短线");

		// New file appears after reload
		std::fs::write(dir.path().join("swing.txt"), "swing slow").unwrap();
		store.reload().unwrap();
		assert_eq!(store.body("swing"), "swing slow");
		assert_eq!(store.list().len(), 3);
	}

	#[test]
	fn save_validates_names() {
		let dir = tempfile::tempdir().unwrap();
		let store = TemplateStore::load(dir.path().to_path_buf()).unwrap();
		assert!(store.save("../evil", "x").is_err());
		store.save("my-template", "body").unwrap();
		assert_eq!(store.body("my-template"), "body");
	}
}
