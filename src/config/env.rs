use super::{BrokerConfig, Environment, StorageBackend};

/// Apply environment variable overrides on top of file/default values.
pub fn apply_env_overrides(config: &mut BrokerConfig) {
    apply_overrides(config, |key| std::env::var(key).ok());
}

fn apply_overrides(config: &mut BrokerConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("BROKER_PORT") {
        if let Ok(port) = v.parse::<u16>() {
            config.server.port = port;
        }
    }
    if let Some(v) = lookup("BROKER_CORS_ORIGIN") {
        config.server.cors_origin = v;
    }
    if let Some(v) = lookup("BROKER_EXPOSE_TOKENS") {
        if let Ok(b) = v.parse::<bool>() {
            config.server.expose_tokens = b;
        }
    }
    if let Some(v) = lookup("BROKER_STORAGE") {
        match v.as_str() {
            "json" => config.storage.backend = StorageBackend::Json,
            "sqlite" => config.storage.backend = StorageBackend::Sqlite,
            _ => {}
        }
    }
    if let Some(v) = lookup("BROKER_DATA_DIR") {
        config.storage.directory = v.into();
    }
    if let Some(v) = lookup("BROKER_HTTP_TIMEOUT") {
        if let Ok(n) = v.parse::<u64>() {
            config.http.timeout_seconds = n;
        }
    }

    if let Some(v) = lookup("XERO_CLIENT_ID") {
        config.xero.client_id = Some(v);
    }
    if let Some(v) = lookup("XERO_CLIENT_SECRET") {
        config.xero.client_secret = Some(v);
    }
    // REDIRECT_URI is the older, unprefixed name for the Xero callback
    if let Some(v) = lookup("XERO_REDIRECT_URI").or_else(|| lookup("REDIRECT_URI")) {
        config.xero.redirect_uri = Some(v);
    }

    if let Some(v) = lookup("QB_CLIENT_ID") {
        config.quickbooks.client_id = Some(v);
    }
    if let Some(v) = lookup("QB_CLIENT_SECRET") {
        config.quickbooks.client_secret = Some(v);
    }
    if let Some(v) = lookup("QB_REDIRECT_URI") {
        config.quickbooks.redirect_uri = Some(v);
    }
    if let Some(v) = lookup("QB_ENVIRONMENT") {
        config.quickbooks.environment = if v == "production" {
            Environment::Production
        } else {
            Environment::Sandbox
        };
    }
}
