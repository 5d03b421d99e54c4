use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;

/// One AI provider configuration owned by a user. `api_key` is encrypted at
/// rest and decrypted on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiModelConfig {
	#[serde(default)]
	pub id: i64,
	pub model_id: String,
	#[serde(default)]
	pub user_id: String,
	pub name: String,
	pub provider: String,
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub api_key: String,
	#[serde(default)]
	pub custom_api_url: String,
	#[serde(default)]
	pub custom_model_name: String,
}

fn model_from_row(row: &Row) -> rusqlite::Result<AiModelConfig> {
	Ok(AiModelConfig {
		id: row.get(0)?,
		model_id: row.get(1)?,
		user_id: row.get(2)?,
		name: row.get(3)?,
		provider: row.get(4)?,
		enabled: row.get::<_, i64>(5)? != 0,
		api_key: row.get(6)?,
		custom_api_url: row.get(7)?,
		custom_model_name: row.get(8)?,
	})
}

const MODEL_COLUMNS: &str =
	"id, model_id, user_id, name, provider, enabled, api_key, custom_api_url, custom_model_name";

impl Store {
	pub fn get_ai_models(&self, user_id: &str) -> Result<Vec<AiModelConfig>> {
		let mut models = self.with_conn(|conn| {
			let mut stmt = conn.prepare(&format!(
				"SELECT {MODEL_COLUMNS} FROM ai_models WHERE user_id = ?1 ORDER BY model_id"
			))?;
			let models = stmt
				.query_map([user_id], model_from_row)?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(models)
		})?;
		for model in &mut models {
			model.api_key = self.vault().decrypt_from_storage(&model.api_key)?;
		}
		Ok(models)
	}

	pub fn get_ai_model(&self, user_id: &str, model_id: &str) -> Result<Option<AiModelConfig>> {
		let model = self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!(
						"SELECT {MODEL_COLUMNS} FROM ai_models
						 WHERE user_id = ?1 AND model_id = ?2"
					),
					[user_id, model_id],
					model_from_row,
				)
				.optional()?)
		})?;
		model
			.map(|mut m| {
				m.api_key = self.vault().decrypt_from_storage(&m.api_key)?;
				Ok(m)
			})
			.transpose()
	}

	pub fn get_ai_model_by_pk(&self, user_id: &str, id: i64) -> Result<Option<AiModelConfig>> {
		let model = self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!(
						"SELECT {MODEL_COLUMNS} FROM ai_models WHERE user_id = ?1 AND id = ?2"
					),
					params![user_id, id],
					model_from_row,
				)
				.optional()?)
		})?;
		model
			.map(|mut m| {
				m.api_key = self.vault().decrypt_from_storage(&m.api_key)?;
				Ok(m)
			})
			.transpose()
	}

	/// Upsert a model config. A blank `api_key` preserves whatever is already
	/// stored, so forms that omit unchanged secrets cannot erase them.
	pub fn update_ai_model(&self, user_id: &str, model: &AiModelConfig) -> Result<AiModelConfig> {
		let stored_key = if model.api_key.is_empty() {
			self.with_conn(|conn| {
				Ok(conn
					.query_row(
						"SELECT api_key FROM ai_models WHERE user_id = ?1 AND model_id = ?2",
						[user_id, model.model_id.as_str()],
						|row| row.get::<_, String>(0),
					)
					.optional()?
					.unwrap_or_default())
			})?
		} else {
			self.vault().encrypt_for_storage(&model.api_key)?
		};

		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO ai_models
					(model_id, user_id, name, provider, enabled, api_key, custom_api_url, custom_model_name)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
				 ON CONFLICT (user_id, model_id) DO UPDATE SET
					name = excluded.name,
					provider = excluded.provider,
					enabled = excluded.enabled,
					api_key = excluded.api_key,
					custom_api_url = excluded.custom_api_url,
					custom_model_name = excluded.custom_model_name",
				params![
					model.model_id,
					user_id,
					model.name,
					model.provider,
					model.enabled as i64,
					stored_key,
					model.custom_api_url,
					model.custom_model_name,
				],
			)?;
			Ok(())
		})?;

		self.get_ai_model(user_id, &model.model_id)?
			.ok_or_else(|| anyhow::anyhow!("model row vanished after upsert"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_utils::test_store;
	use crate::vault::is_encrypted_storage_value;

	fn sample() -> AiModelConfig {
		AiModelConfig {
			id: 0,
			model_id: "deepseek".to_string(),
			user_id: String::new(),
			name: "DeepSeek".to_string(),
			provider: "deepseek".to_string(),
			enabled: true,
			api_key: "sk-123456".to_string(),
			custom_api_url: String::new(),
			custom_model_name: String::new(),
		}
	}

	#[test]
	fn credentials_are_encrypted_at_rest() {
		let store = test_store();
		store.update_ai_model("default", &sample()).unwrap();

		let raw: String = store
			.with_conn(|conn| {
				Ok(conn.query_row(
					"SELECT api_key FROM ai_models WHERE model_id = 'deepseek'",
					[],
					|row| row.get(0),
				)?)
			})
			.unwrap();
		assert!(is_encrypted_storage_value(&raw));

		// Read path decrypts
		let loaded = store.get_ai_model("default", "deepseek").unwrap().unwrap();
		assert_eq!(loaded.api_key, "sk-123456");
	}

	#[test]
	fn blank_key_preserves_existing() {
		let store = test_store();
		store.update_ai_model("default", &sample()).unwrap();

		let mut update = sample();
		update.api_key = String::new();
		update.name = "DeepSeek R1".to_string();
		let updated = store.update_ai_model("default", &update).unwrap();

		assert_eq!(updated.name, "DeepSeek R1");
		assert_eq!(updated.api_key, "sk-123456");
	}
}
