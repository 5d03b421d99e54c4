use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

use super::Store;

#[derive(Debug, Clone, Serialize)]
pub struct User {
	pub id: String,
	pub email: String,
	#[serde(skip_serializing)]
	pub password_hash: String,
	#[serde(skip_serializing)]
	pub otp_secret: String,
	pub otp_verified: bool,
	pub created_at: DateTime<Utc>,
	pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BetaCode {
	pub code: String,
	pub used: bool,
	pub used_by: String,
	pub used_at: Option<DateTime<Utc>>,
	pub created_at: DateTime<Utc>,
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
	Ok(User {
		id: row.get(0)?,
		email: row.get(1)?,
		password_hash: row.get(2)?,
		otp_secret: row.get(3)?,
		otp_verified: row.get::<_, i64>(4)? != 0,
		created_at: Store::parse_ts(&row.get::<_, String>(5)?),
		updated_at: Store::parse_ts(&row.get::<_, String>(6)?),
	})
}

const USER_COLUMNS: &str =
	"id, email, password_hash, otp_secret, otp_verified, created_at, updated_at";

impl Store {
	pub fn create_user(&self, email: &str, password_hash: &str, otp_secret: &str) -> Result<User> {
		let id = uuid::Uuid::new_v4().to_string();
		let now = Utc::now();
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO users (id, email, password_hash, otp_secret, otp_verified, created_at, updated_at)
				 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
				params![id, email, password_hash, otp_secret, now.to_rfc3339()],
			)?;
			Ok(())
		})?;
		Ok(User {
			id,
			email: email.to_string(),
			password_hash: password_hash.to_string(),
			otp_secret: otp_secret.to_string(),
			otp_verified: false,
			created_at: now,
			updated_at: now,
		})
	}

	pub fn get_user(&self, id: &str) -> Result<Option<User>> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"),
					[id],
					user_from_row,
				)
				.optional()?)
		})
	}

	pub fn get_user_by_email(&self, email: &str) -> Result<Option<User>> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					&format!("SELECT {USER_COLUMNS} FROM users WHERE email = ?1"),
					[email],
					user_from_row,
				)
				.optional()?)
		})
	}

	pub fn mark_otp_verified(&self, user_id: &str) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"UPDATE users SET otp_verified = 1, updated_at = ?2 WHERE id = ?1",
				params![user_id, Utc::now().to_rfc3339()],
			)?;
			Ok(())
		})
	}

	pub fn update_password(&self, user_id: &str, password_hash: &str) -> Result<()> {
		self.with_conn(|conn| {
			let updated = conn.execute(
				"UPDATE users SET password_hash = ?2, updated_at = ?3 WHERE id = ?1",
				params![user_id, password_hash, Utc::now().to_rfc3339()],
			)?;
			if updated == 0 {
				bail!("user {user_id} not found");
			}
			Ok(())
		})
	}

	// ===== beta codes =====

	pub fn create_beta_code(&self, code: &str) -> Result<()> {
		self.with_conn(|conn| {
			conn.execute(
				"INSERT INTO beta_codes (code, created_at) VALUES (?1, ?2)",
				params![code, Utc::now().to_rfc3339()],
			)?;
			Ok(())
		})
	}

	/// Atomically consume an unused code. Fails if the code is unknown or
	/// already used.
	pub fn consume_beta_code(&self, code: &str, email: &str) -> Result<()> {
		self.with_conn(|conn| {
			let updated = conn.execute(
				"UPDATE beta_codes SET used = 1, used_by = ?2, used_at = ?3
				 WHERE code = ?1 AND used = 0",
				params![code, email, Utc::now().to_rfc3339()],
			)?;
			if updated == 0 {
				bail!("beta code is invalid or already used");
			}
			Ok(())
		})
	}

	pub fn beta_code(&self, code: &str) -> Result<Option<BetaCode>> {
		self.with_conn(|conn| {
			Ok(conn
				.query_row(
					"SELECT code, used, used_by, used_at, created_at FROM beta_codes WHERE code = ?1",
					[code],
					|row| {
						Ok(BetaCode {
							code: row.get(0)?,
							used: row.get::<_, i64>(1)? != 0,
							used_by: row.get(2)?,
							used_at: row
								.get::<_, Option<String>>(3)?
								.and_then(|s| s.parse().ok()),
							created_at: Store::parse_ts(&row.get::<_, String>(4)?),
						})
					},
				)
				.optional()?)
		})
	}
}

#[cfg(test)]
mod tests {
	use crate::store::test_utils::test_store;

	#[test]
	fn user_lifecycle() {
		let store = test_store();
		let user = store.create_user("a@b.c", "hash", "SECRET").unwrap();
		assert!(!user.otp_verified);

		let loaded = store.get_user_by_email("a@b.c").unwrap().unwrap();
		assert_eq!(loaded.id, user.id);

		store.mark_otp_verified(&user.id).unwrap();
		assert!(store.get_user(&user.id).unwrap().unwrap().otp_verified);

		// Duplicate email rejected
		assert!(store.create_user("a@b.c", "hash2", "S2").is_err());
	}

	#[test]
	fn beta_code_single_use() {
		let store = test_store();
		store.create_beta_code("WELCOME").unwrap();
		store.consume_beta_code("WELCOME", "a@b.c").unwrap();
		assert!(store.consume_beta_code("WELCOME", "d@e.f").is_err());
		assert!(store.consume_beta_code("UNKNOWN", "a@b.c").is_err());

		let code = store.beta_code("WELCOME").unwrap().unwrap();
		assert!(code.used);
		assert_eq!(code.used_by, "a@b.c");
	}
}
