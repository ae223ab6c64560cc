use std::sync::Arc;

use color_eyre::eyre::WrapErr;
use oidc_server::OidcServer;
use oidc_server::cache::MemoryCache;
use oidc_server::config::load_config_or_panic;
use oidc_server::host::router::router;
use oidc_server::logging::init_tracing;
use oidc_server::server::token::SignInClientCredentials;
use oidc_server::stores::StaticApplicationStore;
use tracing::info;

#[tokio::main]
async fn main() -> color_eyre::eyre::Result<()> {
    color_eyre::install()?;
    dotenvy::dotenv().ok();
    init_tracing();

    let config = load_config_or_panic();
    let clients = config.clients.len();

    let server = OidcServer::builder(config.server)
        .with_cache(Arc::new(MemoryCache::new()))
        .with_application_store(Arc::new(StaticApplicationStore::new(config.clients)))
        .register(SignInClientCredentials::descriptor())
        .build()
        .wrap_err("failed to build the OIDC server")?;

    let issuer = server
        .options()
        .issuer
        .as_ref()
        .map(ToString::to_string)
        .unwrap_or_else(|| "<inferred per request>".into());
    info!(%issuer, clients, "server configured");

    let app = router(Arc::new(server));
    let listener = tokio::net::TcpListener::bind(&config.listen_address).await?;
    info!("Server running on http://{}", config.listen_address);
    axum::serve(listener, app.into_make_service())
        .await
        .map_err(|e| color_eyre::Report::msg(format!("Failed to start server: {e}")))?;

    Ok(())
}
