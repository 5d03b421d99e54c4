use clap::Parser;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source, Value};
use serde::Deserialize;
use std::{
	collections::HashMap,
	env,
	path::{Path, PathBuf},
};

use crate::constants;

#[derive(Debug, Deserialize, Clone)]
pub struct Node {
	/// Port the HTTP control plane binds to.
	pub port: u16,
	/// "production" enables the strict CORS whitelist; anything else is development.
	pub environment: String,
	pub frontend_url: Option<String>,
	/// Comma-separated additional origins allowed in production.
	pub cors_allowed_origins: Option<String>,
	pub disable_cors: bool,
	pub trust_proxy: bool,
	pub enable_csrf: bool,
	pub enable_client_decrypt_api: bool,
}

impl Node {
	pub fn is_production(&self) -> bool {
		self.environment.eq_ignore_ascii_case("production")
	}
}

#[derive(Debug, Deserialize, Clone)]
pub struct Security {
	/// Master key for credential envelopes. Required, >= 32 characters.
	pub data_encryption_key: String,
	/// HMAC secret for JWTs. Generated and persisted on first start if absent.
	pub jwt_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
	pub db_file: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Prompts {
	pub dir: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
	pub node: Node,
	pub security: Security,
	pub store: StoreSettings,
	pub prompts: Prompts,
}

#[derive(Parser, Debug, Clone, Default)]
pub struct CommandLineOptions {
	/// Directory containing Settings.toml, the database and the prompts.
	#[clap(long = "config-root", env = "NOFX_CONFIG_ROOT")]
	config_root: Option<String>,
	#[clap(long = "node.port")]
	port: Option<u16>,
	#[clap(long = "store.db_file")]
	db_file: Option<String>,
	#[clap(long = "prompts.dir")]
	prompts_dir: Option<String>,
}

pub const DEFAULT_CONFIG_ROOT: &str = ".";
const SETTINGS_FILE: &str = "Settings.toml";

pub fn insert_command_line_option<T>(
	map: &mut HashMap<String, Value>,
	key: &str,
	option: &Option<T>,
) where
	T: ToString,
{
	if let Some(value) = option {
		map.insert(key.to_string(), Value::from(value.to_string()));
	}
}

impl Source for CommandLineOptions {
	fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
		Box::new((*self).clone())
	}

	fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
		let mut map: HashMap<String, Value> = HashMap::new();

		insert_command_line_option(&mut map, "node.port", &self.port);
		insert_command_line_option(&mut map, "store.db_file", &self.db_file);
		insert_command_line_option(&mut map, "prompts.dir", &self.prompts_dir);

		Ok(map)
	}
}

/// Flat environment variables recognised for operator convenience, mapped onto
/// their nested settings keys.
const ENV_OVERRIDES: &[(&str, &str)] = &[
	(constants::ENV_DATA_ENCRYPTION_KEY, "security.data_encryption_key"),
	(constants::ENV_JWT_SECRET, "security.jwt_secret"),
	(constants::ENV_ENVIRONMENT, "node.environment"),
	(constants::ENV_FRONTEND_URL, "node.frontend_url"),
	(constants::ENV_CORS_ALLOWED_ORIGINS, "node.cors_allowed_origins"),
	(constants::ENV_DISABLE_CORS, "node.disable_cors"),
	(constants::ENV_TRUST_PROXY, "node.trust_proxy"),
	(constants::ENV_ENABLE_CSRF, "node.enable_csrf"),
	(constants::ENV_ENABLE_CLIENT_DECRYPT_API, "node.enable_client_decrypt_api"),
	(constants::ENV_BACKEND_PORT, "node.port"),
];

impl Settings {
	pub fn new(opts: CommandLineOptions) -> anyhow::Result<Self> {
		let config_root =
			opts.config_root.clone().unwrap_or_else(|| DEFAULT_CONFIG_ROOT.to_string());

		let mut builder = Self::set_defaults(Config::builder(), &config_root)?;

		let settings_file = Path::new(&config_root).join(SETTINGS_FILE);
		if settings_file.is_file() {
			builder = builder.add_source(File::from(settings_file));
		}

		// Nested environment (NODE__PORT style) first, then the flat operator
		// variables from the README, then command-line flags on top.
		builder = builder.add_source(Environment::default().separator("__"));
		for (var, key) in ENV_OVERRIDES {
			builder = builder.set_override_option((*key).to_string(), env::var(var).ok())?;
		}

		let mut settings: Settings = builder.add_source(opts).build()?.try_deserialize()?;

		settings.validate(&config_root)?;
		Ok(settings)
	}

	fn set_defaults(
		builder: ConfigBuilder<config::builder::DefaultState>,
		config_root: &str,
	) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
		// Optional fields (frontend_url, cors_allowed_origins, jwt_secret)
		// default to absent rather than a sentinel value.
		builder
			.set_default("node.port", 8080)?
			.set_default("node.environment", "development")?
			.set_default("node.disable_cors", false)?
			.set_default("node.trust_proxy", false)?
			.set_default("node.enable_csrf", true)?
			.set_default("node.enable_client_decrypt_api", false)?
			.set_default(
				"store.db_file",
				Path::new(config_root).join("nofx.db").to_string_lossy().to_string(),
			)?
			.set_default(
				"prompts.dir",
				Path::new(config_root).join("prompts").to_string_lossy().to_string(),
			)
	}

	fn validate(&mut self, _config_root: &str) -> anyhow::Result<()> {
		let key = &self.security.data_encryption_key;
		anyhow::ensure!(
			key.len() >= 32,
			"{} must be at least 32 characters",
			constants::ENV_DATA_ENCRYPTION_KEY
		);
		anyhow::ensure!(
			!key.contains("PLEASE_GENERATE") && !key.contains("EXAMPLE"),
			"{} is still set to a placeholder value, generate a real key",
			constants::ENV_DATA_ENCRYPTION_KEY
		);
		if let Some(frontend_url) = &self.node.frontend_url {
			url::Url::parse(frontend_url)
				.map_err(|e| anyhow::anyhow!("invalid frontend_url {frontend_url:?}: {e}"))?;
		}
		Ok(())
	}

	/// Origins allowed in production mode: the frontend plus the explicit list.
	pub fn production_origins(&self) -> Vec<String> {
		let mut origins = Vec::new();
		if let Some(frontend) = &self.node.frontend_url {
			origins.push(frontend.trim_end_matches('/').to_string());
		}
		if let Some(list) = &self.node.cors_allowed_origins {
			origins.extend(
				list.split(',')
					.map(|o| o.trim().trim_end_matches('/').to_string())
					.filter(|o| !o.is_empty()),
			);
		}
		origins
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn test_options() -> CommandLineOptions {
		CommandLineOptions { config_root: Some("/tmp/nofx-test".to_string()), ..Default::default() }
	}

	// One test so the process-wide environment variable is not raced by the
	// parallel test runner.
	#[test]
	fn rejects_bad_master_keys() {
		std::env::set_var(constants::ENV_DATA_ENCRYPTION_KEY, "short");
		assert!(Settings::new(test_options()).is_err());

		std::env::set_var(
			constants::ENV_DATA_ENCRYPTION_KEY,
			"PLEASE_GENERATE_A_REAL_KEY_0123456789abcdef",
		);
		assert!(Settings::new(test_options()).is_err());

		std::env::remove_var(constants::ENV_DATA_ENCRYPTION_KEY);
	}

	#[test]
	fn production_origin_list() {
		let settings = Settings {
			node: Node {
				port: 8080,
				environment: "production".to_string(),
				frontend_url: Some("https://app.example.com/".to_string()),
				cors_allowed_origins: Some(
					"https://a.example.com, https://b.example.com".to_string(),
				),
				disable_cors: false,
				trust_proxy: false,
				enable_csrf: true,
				enable_client_decrypt_api: false,
			},
			security: Security {
				data_encryption_key: "0123456789abcdef0123456789abcdef".to_string(),
				jwt_secret: None,
			},
			store: StoreSettings { db_file: PathBuf::from("nofx.db") },
			prompts: Prompts { dir: PathBuf::from("prompts") },
		};
		assert!(settings.node.is_production());
		assert_eq!(
			settings.production_origins(),
			vec![
				"https://app.example.com".to_string(),
				"https://a.example.com".to_string(),
				"https://b.example.com".to_string()
			]
		);
	}
}
