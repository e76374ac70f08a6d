//! Token broker service binary.

// crates.io
use token_broker::{BrokerConfig, Result, server};

#[tokio::main]
async fn main() -> Result<()> {
	server::init_tracing();

	let config = BrokerConfig::from_env()?;

	if config.signing.secret == token_broker::config::PLACEHOLDER_SECRET {
		tracing::warn!("JWT_SECRET is unset; using the insecure placeholder secret");
	}

	#[cfg(feature = "prometheus")]
	token_broker::install_default_exporter()?;

	server::serve(config).await
}
