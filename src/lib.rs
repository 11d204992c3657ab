// Configuration (TOML file + environment)
pub mod config;

// Error taxonomy and HTTP mapping
pub mod error;

// Credential records and token stores
pub mod credentials;

// Provider descriptors and HTTP clients
pub mod provider;

// Always-valid token delivery
pub mod lifecycle;

// Authorization code flow
pub mod oauth;

// Transparent API proxy
pub mod proxy;

// HTTP routes
pub mod api;

#[cfg(test)]
pub(crate) mod testing;
