//! In-place schema migrations. Each migration is detectable from the live
//! schema, idempotent, and rebuilds tables inside a single transaction after
//! writing a backup of the database file.

use anyhow::{bail, Context, Result};
use rusqlite::Connection;
use std::path::Path;
use tracing::info;

pub fn run(conn: &Connection, db_file: &Path) -> Result<()> {
	if text_primary_key(conn, "ai_models")? {
		backup(db_file)?;
		rebuild_ai_models(conn)?;
	}
	if has_column(conn, "exchanges", "api_secret_plain")? {
		backup(db_file)?;
		drop_legacy_plaintext_column(conn)?;
	}
	Ok(())
}

fn column_type(conn: &Connection, table: &str, column: &str) -> Result<Option<String>> {
	use rusqlite::OptionalExtension;
	Ok(conn
		.query_row(
			&format!("SELECT type FROM pragma_table_info('{table}') WHERE name = ?1"),
			[column],
			|row| row.get::<_, String>(0),
		)
		.optional()?)
}

fn has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
	Ok(column_type(conn, table, column)?.is_some())
}

fn text_primary_key(conn: &Connection, table: &str) -> Result<bool> {
	Ok(column_type(conn, table, "id")?.is_some_and(|t| t.eq_ignore_ascii_case("TEXT")))
}

fn backup(db_file: &Path) -> Result<()> {
	let backup_path = db_file.with_extension(format!(
		"bak-{}",
		chrono::Utc::now().format("%Y%m%dT%H%M%S")
	));
	std::fs::copy(db_file, &backup_path)
		.with_context(|| format!("Could not back up database to {}", backup_path.display()))?;
	info!(backup = %backup_path.display(), "Wrote pre-migration database backup");
	Ok(())
}

/// Legacy installs keyed `ai_models` by the textual model id. Rebuild with a
/// surrogate autoincrement key and re-point `traders.ai_model_id`.
fn rebuild_ai_models(conn: &Connection) -> Result<()> {
	info!("Migrating ai_models to surrogate primary keys");
	conn.pragma_update(None, "foreign_keys", "OFF")?;
	let result = (|| -> Result<()> {
		conn.execute_batch(
			r#"
			BEGIN;
			CREATE TABLE ai_models_new (
				id INTEGER PRIMARY KEY AUTOINCREMENT,
				model_id TEXT NOT NULL,
				user_id TEXT NOT NULL REFERENCES users(id),
				name TEXT NOT NULL,
				provider TEXT NOT NULL,
				enabled INTEGER NOT NULL DEFAULT 0,
				api_key TEXT NOT NULL DEFAULT '',
				custom_api_url TEXT NOT NULL DEFAULT '',
				custom_model_name TEXT NOT NULL DEFAULT '',
				UNIQUE (user_id, model_id)
			);
			INSERT INTO ai_models_new
				(model_id, user_id, name, provider, enabled, api_key, custom_api_url, custom_model_name)
				SELECT id, user_id, name, provider, enabled, api_key, custom_api_url, custom_model_name
				FROM ai_models;
			UPDATE traders SET ai_model_id =
				(SELECT n.id FROM ai_models_new n
				 WHERE n.model_id = traders.ai_model_id AND n.user_id = traders.user_id);
			DROP TABLE ai_models;
			ALTER TABLE ai_models_new RENAME TO ai_models;
			COMMIT;
			"#,
		)?;

		// Every trader must still resolve its model before we call this done.
		let dangling: i64 = conn.query_row(
			"SELECT COUNT(*) FROM traders t
			 LEFT JOIN ai_models m ON m.id = t.ai_model_id WHERE m.id IS NULL",
			[],
			|row| row.get(0),
		)?;
		if dangling > 0 {
			bail!("ai_models migration left {dangling} traders without a model row");
		}
		Ok(())
	})();
	conn.pragma_update(None, "foreign_keys", "ON")?;
	result
}

/// Pre-encryption installs kept a plaintext secret column beside the encrypted
/// one. Remove it in a single transaction.
fn drop_legacy_plaintext_column(conn: &Connection) -> Result<()> {
	info!("Dropping legacy plaintext credential column from exchanges");
	conn.execute_batch(
		r#"
		BEGIN;
		ALTER TABLE exchanges DROP COLUMN api_secret_plain;
		COMMIT;
		"#,
	)?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn detects_text_primary_keys() {
		let conn = Connection::open_in_memory().unwrap();
		conn.execute_batch(
			"CREATE TABLE ai_models (id TEXT PRIMARY KEY, user_id TEXT, name TEXT,
			 provider TEXT, enabled INTEGER, api_key TEXT, custom_api_url TEXT,
			 custom_model_name TEXT);",
		)
		.unwrap();
		assert!(text_primary_key(&conn, "ai_models").unwrap());

		let conn2 = Connection::open_in_memory().unwrap();
		conn2
			.execute_batch("CREATE TABLE ai_models (id INTEGER PRIMARY KEY AUTOINCREMENT);")
			.unwrap();
		assert!(!text_primary_key(&conn2, "ai_models").unwrap());
	}

	#[test]
	fn rebuild_repoints_traders() {
		let conn = Connection::open_in_memory().unwrap();
		conn.execute_batch(
			r#"
			CREATE TABLE users (id TEXT PRIMARY KEY);
			INSERT INTO users VALUES ('u1');
			CREATE TABLE ai_models (id TEXT PRIMARY KEY, user_id TEXT, name TEXT,
				provider TEXT, enabled INTEGER DEFAULT 0, api_key TEXT DEFAULT '',
				custom_api_url TEXT DEFAULT '', custom_model_name TEXT DEFAULT '');
			INSERT INTO ai_models (id, user_id, name, provider) VALUES
				('deepseek', 'u1', 'DeepSeek', 'deepseek');
			CREATE TABLE traders (id TEXT PRIMARY KEY, user_id TEXT, ai_model_id TEXT);
			INSERT INTO traders VALUES ('t1', 'u1', 'deepseek');
			"#,
		)
		.unwrap();

		rebuild_ai_models(&conn).unwrap();

		let (model_pk, trader_ref): (i64, i64) = conn
			.query_row(
				"SELECT m.id, t.ai_model_id FROM traders t
				 JOIN ai_models m ON m.model_id = 'deepseek'",
				[],
				|row| Ok((row.get(0)?, row.get(1)?)),
			)
			.unwrap();
		assert_eq!(model_pk, trader_ref);

		// Idempotent: the rebuilt table no longer has a text primary key.
		assert!(!text_primary_key(&conn, "ai_models").unwrap());
	}
}
