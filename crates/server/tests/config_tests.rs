use config::Config;
use jsonwebtoken::Algorithm;
use oidc_server::Endpoint;
use oidc_server::config::{AppConfig, ConfigError, load_config_from};
use oidc_server::stores::ClientType;
use std::env;
use std::fs;
use std::path::PathBuf;

fn temp_config(name: &str, contents: &str) -> PathBuf {
    let path = env::temp_dir().join(format!("oidc-server-{}-{name}.yaml", std::process::id()));
    fs::write(&path, contents).expect("Failed to write temp config");
    path
}

#[test]
fn test_app_config_deserialization() {
    let yaml_content = r#"
listen_address: "127.0.0.1:9000"
server:
  issuer: "https://id.example.org/"
  path_base: "/auth"
  require_pkce: true
  request_caching:
    logout: true
    ttl_seconds: 120
  passthrough:
    endpoints: ["authorization"]
  signing:
    algorithm: "HS512"
    secret: "0123456789abcdef0123456789abcdef"
  endpoints:
    device: "/connect/device"
clients:
  - client_id: "spa"
    redirect_uris: ["https://app.example/cb"]
  - client_id: "backend"
    client_secret: "s3cret"
    client_type: "confidential"
"#;

    let config = Config::builder()
        .add_source(config::File::from_str(
            yaml_content,
            config::FileFormat::Yaml,
        ))
        .build()
        .expect("Failed to build config");

    let app_config: AppConfig = config
        .try_deserialize()
        .expect("Failed to deserialize app config");
    assert!(app_config.validate().is_ok());

    assert_eq!(app_config.listen_address, "127.0.0.1:9000");
    let server = &app_config.server;
    assert_eq!(
        server.issuer.as_ref().map(|u| u.as_str()),
        Some("https://id.example.org/")
    );
    assert_eq!(server.path_base, "/auth");
    assert!(server.require_pkce);
    assert!(server.request_caching.logout);
    assert!(!server.request_caching.authorization);
    assert_eq!(server.request_caching.ttl_seconds, 120);
    assert_eq!(server.passthrough.endpoints, vec![Endpoint::Authorization]);
    assert_eq!(server.signing.algorithm, Algorithm::HS512);
    assert_eq!(server.endpoints.device.as_deref(), Some("/connect/device"));
    // Unset paths keep their defaults.
    assert_eq!(server.endpoints.token.as_deref(), Some("/connect/token"));
    assert_eq!(server.lifetimes.access_token, 3600);

    assert_eq!(app_config.clients.len(), 2);
    assert_eq!(app_config.clients[0].client_type, ClientType::Public);
    assert_eq!(app_config.clients[1].client_type, ClientType::Confidential);
    assert_eq!(app_config.clients[1].client_secret.as_deref(), Some("s3cret"));
}

#[test]
fn test_missing_config_file_uses_defaults() {
    let path = env::temp_dir().join("oidc-server-does-not-exist.yaml");
    let config = load_config_from(path.to_str().expect("utf-8 path")).expect("defaults");

    assert_eq!(config.listen_address, "0.0.0.0:8080");
    assert!(config.server.issuer.is_none());
    assert!(config.clients.is_empty());
}

#[test]
fn test_load_config_from_file() {
    let path = temp_config(
        "valid",
        r#"
listen_address: "127.0.0.1:8181"
server:
  lifetimes:
    access_token: 600
clients:
  - client_id: "cli"
"#,
    );

    let result = load_config_from(path.to_str().expect("utf-8 path"));
    fs::remove_file(&path).ok();

    let config = result.expect("Failed to load config");
    assert_eq!(config.listen_address, "127.0.0.1:8181");
    assert_eq!(config.server.lifetimes.access_token, 600);
    assert_eq!(config.server.lifetimes.refresh_token, 14 * 86400);
    assert_eq!(config.clients[0].client_id, "cli");
}

#[test]
fn test_invalid_config_file_is_refused() {
    let path = temp_config(
        "short-secret",
        r#"
server:
  signing:
    secret: "short"
"#,
    );

    let result = load_config_from(path.to_str().expect("utf-8 path"));
    fs::remove_file(&path).ok();

    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_malformed_config_is_a_build_error() {
    let path = temp_config("malformed", "server: [this is: not valid");

    let result = load_config_from(path.to_str().expect("utf-8 path"));
    fs::remove_file(&path).ok();

    assert!(matches!(result, Err(ConfigError::Build(_))));
}
