use std::sync::Arc;

use modelrelay::{AppState, Gateway, RelayConfig, StaticKeyResolver, router};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let path = args
        .next()
        .ok_or("usage: modelrelay-gateway <config.toml> [--listen HOST:PORT] [--json-logs]")?;

    let mut listen_override: Option<String> = None;
    let mut json_logs = false;
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--listen" | "--addr" => {
                listen_override = Some(args.next().ok_or("missing value for --listen/--addr")?);
            }
            "--json-logs" => {
                json_logs = true;
            }
            other => return Err(format!("unknown argument: {other}").into()),
        }
    }

    init_tracing(json_logs);

    let mut config = RelayConfig::load(&path)?;
    config.settings.apply_env_overrides();
    if let Some(listen) = listen_override {
        config.settings.listen = listen;
    }
    let listen = config.settings.listen.clone();

    let resolver = StaticKeyResolver::new(config.api_keys.clone());
    let gateway = Gateway::from_config(&config)?;
    let app = router(AppState {
        gateway: Arc::new(gateway),
        resolver: Arc::new(resolver),
    });

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, config = %path, "modelrelay-gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(json_logs: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    if json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }
}
