use anyhow::{bail, Result};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::Store;

/// One venue configuration owned by a user. Credential fields are encrypted at
/// rest. The venue-specific wallet/signer fields are mutually exclusive per
/// exchange kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExchangeConfig {
	#[serde(default)]
	pub id: i64,
	pub exchange_id: String,
	#[serde(default)]
	pub user_id: String,
	#[serde(default)]
	pub enabled: bool,
	#[serde(default)]
	pub api_key: String,
	#[serde(default)]
	pub secret_key: String,
	#[serde(default)]
	pub testnet: bool,
	#[serde(default)]
	pub hyperliquid_main_wallet: String,
	#[serde(default)]
	pub aster_user_address: String,
	#[serde(default)]
	pub aster_signer_address: String,
	#[serde(default)]
	pub aster_private_key: String,
	#[serde(default)]
	pub lighter_wallet: String,
	#[serde(default)]
	pub lighter_api_private_key: String,
	#[serde(default)]
	pub lighter_account_index: i64,
}

pub const SUPPORTED_EXCHANGES: &[&str] = &["binance", "hyperliquid", "aster", "lighter"];

impl ExchangeConfig {
	/// The wallet/signer field groups belong to exactly one venue each.
	pub fn validate(&self) -> Result<()> {
		if !SUPPORTED_EXCHANGES.contains(&self.exchange_id.as_str()) {
			bail!("unsupported exchange {:?}", self.exchange_id);
		}
		let hyperliquid = !self.hyperliquid_main_wallet.is_empty();
		let aster = !self.aster_user_address.is_empty() ||
			!self.aster_signer_address.is_empty() ||
			!self.aster_private_key.is_empty();
		let lighter = !self.lighter_wallet.is_empty() || !self.lighter_api_private_key.is_empty();
		let groups = [hyperliquid, aster, lighter].iter().filter(|g| **g).count();
		if groups > 1 {
			bail!("venue-specific wallet fields are mutually exclusive");
		}
		match self.exchange_id.as_str() {
			"hyperliquid" if aster || lighter => bail!("wrong wallet fields for hyperliquid"),
			"aster" if hyperliquid || lighter => bail!("wrong wallet fields for aster"),
			"lighter" if hyperliquid || aster => bail!("wrong wallet fields for lighter"),
			"binance" if hyperliquid || aster || lighter =>
				bail!("binance takes no wallet fields"),
			_ => Ok(()),
		}
	}
}

fn exchange_from_row(row: &Row) -> rusqlite::Result<ExchangeConfig> {
	Ok(ExchangeConfig {
		id: row.get(0)?,
		exchange_id: row.get(1)?,
		user_id: row.get(2)?,
		enabled: row.get::<_, i64>(3)? != 0,
		api_key: row.get(4)?,
		secret_key: row.get(5)?,
		testnet: row.get::<_, i64>(6)? != 0,
		hyperliquid_main_wallet: row.get(7)?,
		aster_user_address: row.get(8)?,
		aster_signer_address: row.get(9)?,
		aster_private_key: row.get(10)?,
		lighter_wallet: row.get(11)?,
		lighter_api_private_key: row.get(12)?,
		lighter_account_index: row.get(13)?,
	})
}

const EXCHANGE_COLUMNS: &str = "id, exchange_id, user_id, enabled, api_key, secret_key, testnet, \
	hyperliquid_main_wallet, aster_user_address, aster_signer_address, aster_private_key, \
	lighter_wallet, lighter_api_private_key, lighter_account_index";

impl Store {
	fn decrypt_exchange(&self, mut e: ExchangeConfig) -> Result<ExchangeConfig> {
		e.api_key = self.vault().decrypt_from_storage(&e.api_key)?;
		e.secret_key = self.vault().decrypt_from_storage(&e.secret_key)?;
		e.aster_private_key = self.vault().decrypt_from_storage(&e.aster_private_key)?;
		e.lighter_api_private_key =
			self.vault().decrypt_from_storage(&e.lighter_api_private_key)?;
		Ok(e)
	}

	pub fn get_exchanges(&self, user_id: &str) -> Result<Vec<ExchangeConfig>> {
		let rows = self.with_conn(|conn| {
			let mut stmt = conn.prepare(&format!(
				"SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE user_id = ?1 ORDER BY exchange_id"
			))?;
			let rows = stmt
				.query_map([user_id], exchange_from_row)?
				.collect::<rusqlite::Result<Vec<_>>>()?;
			Ok(rows)
		})?;
		rows.into_iter().map(|e| self.decrypt_exchange(e)).collect()
	}

	pub fn get_exchange(&self, user_id: &str, exchange_id: &str) -> Result<Option<ExchangeConfig>> {
		let row = self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!(
						"SELECT {EXCHANGE_COLUMNS} FROM exchanges
						 WHERE user_id = ?1 AND exchange_id = ?2"
					),
					[user_id, exchange_id],
					exchange_from_row,
				)
				.optional()?)
		})?;
		row.map(|e| self.decrypt_exchange(e)).transpose()
	}

	pub fn get_exchange_by_pk(&self, user_id: &str, id: i64) -> Result<Option<ExchangeConfig>> {
		let row = self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!(
						"SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE user_id = ?1 AND id = ?2"
					),
					params![user_id, id],
					exchange_from_row,
				)
				.optional()?)
		})?;
		row.map(|e| self.decrypt_exchange(e)).transpose()
	}

	/// Upsert a venue config. Blank credential fields preserve the stored
	/// values; non-blank ones are re-encrypted.
	pub fn update_exchange(
		&self,
		user_id: &str,
		exchange: &ExchangeConfig,
	) -> Result<ExchangeConfig> {
		exchange.validate()?;

		let existing = self.with_conn(|conn| {
			Ok(conn
				.query_row(
					"SELECT api_key, secret_key, aster_private_key, lighter_api_private_key
					 FROM exchanges WHERE user_id = ?1 AND exchange_id = ?2",
					[user_id, exchange.exchange_id.as_str()],
					|row| {
						Ok((
							row.get::<_, String>(0)?,
							row.get::<_, String>(1)?,
							row.get::<_, String>(2)?,
							row.get::<_, String>(3)?,
						))
					},
				)
				.optional()?)
		})?;
		let (old_api, old_secret, old_aster, old_lighter) = existing.unwrap_or_default();

		let keep_or_encrypt = |new_value: &str, old_value: String| -> Result<String> {
			if new_value.is_empty() {
				Ok(old_value)
			} else {
				self.vault().encrypt_for_storage(new_value)
			}
		};
		let api_key = keep_or_encrypt(&exchange.api_key, old_api)?;
		let secret_key = keep_or_encrypt(&exchange.secret_key, old_secret)?;
		let aster_private_key = keep_or_encrypt(&exchange.aster_private_key, old_aster)?;
		let lighter_api_private_key =
			keep_or_encrypt(&exchange.lighter_api_private_key, old_lighter)?;

		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO exchanges
					(exchange_id, user_id, enabled, api_key, secret_key, testnet,
					 hyperliquid_main_wallet, aster_user_address, aster_signer_address,
					 aster_private_key, lighter_wallet, lighter_api_private_key,
					 lighter_account_index)
				 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
				 ON CONFLICT (user_id, exchange_id) DO UPDATE SET
					enabled = excluded.enabled,
					api_key = excluded.api_key,
					secret_key = excluded.secret_key,
					testnet = excluded.testnet,
					hyperliquid_main_wallet = excluded.hyperliquid_main_wallet,
					aster_user_address = excluded.aster_user_address,
					aster_signer_address = excluded.aster_signer_address,
					aster_private_key = excluded.aster_private_key,
					lighter_wallet = excluded.lighter_wallet,
					lighter_api_private_key = excluded.lighter_api_private_key,
					lighter_account_index = excluded.lighter_account_index",
				params![
					exchange.exchange_id,
					user_id,
					exchange.enabled as i64,
					api_key,
					secret_key,
					exchange.testnet as i64,
					exchange.hyperliquid_main_wallet,
					exchange.aster_user_address,
					exchange.aster_signer_address,
					aster_private_key,
					exchange.lighter_wallet,
					lighter_api_private_key,
					exchange.lighter_account_index,
				],
			)?;
			Ok(())
		})?;

		self.get_exchange(user_id, &exchange.exchange_id)?
			.ok_or_else(|| anyhow::anyhow!("exchange row vanished after upsert"))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::store::test_utils::test_store;
	use crate::vault::is_encrypted_storage_value;

	fn binance() -> ExchangeConfig {
		ExchangeConfig {
			exchange_id: "binance".to_string(),
			enabled: true,
			api_key: "key-abc".to_string(),
			secret_key: "secret-xyz".to_string(),
			..Default::default()
		}
	}

	#[test]
	fn wallet_fields_are_exclusive() {
		let mut config = binance();
		config.hyperliquid_main_wallet = "0xabc".to_string();
		assert!(config.validate().is_err());

		let hl = ExchangeConfig {
			exchange_id: "hyperliquid".to_string(),
			hyperliquid_main_wallet: "0xabc".to_string(),
			..Default::default()
		};
		assert!(hl.validate().is_ok());

		let mixed = ExchangeConfig {
			exchange_id: "hyperliquid".to_string(),
			hyperliquid_main_wallet: "0xabc".to_string(),
			aster_user_address: "0xdef".to_string(),
			..Default::default()
		};
		assert!(mixed.validate().is_err());
	}

	#[test]
	fn secrets_encrypted_and_preserved() {
		let store = test_store();
		store.update_exchange("default", &binance()).unwrap();

		let (raw_api, raw_secret): (String, String) = store
			.with_conn(|conn| {
				Ok(conn.query_row(
					"SELECT api_key, secret_key FROM exchanges WHERE exchange_id = 'binance'",
					[],
					|row| Ok((row.get(0)?, row.get(1)?)),
				)?)
			})
			.unwrap();
		assert!(is_encrypted_storage_value(&raw_api));
		assert!(is_encrypted_storage_value(&raw_secret));

		// Blank update keeps both secrets
		let mut update = binance();
		update.api_key = String::new();
		update.secret_key = String::new();
		update.testnet = true;
		let updated = store.update_exchange("default", &update).unwrap();
		assert!(updated.testnet);
		assert_eq!(updated.api_key, "key-abc");
		assert_eq!(updated.secret_key, "secret-xyz");
	}

	#[test]
	fn rejects_unknown_exchange() {
		let store = test_store();
		let bad = ExchangeConfig { exchange_id: "ftx".to_string(), ..Default::default() };
		assert!(store.update_exchange("default", &bad).is_err());
	}
}
