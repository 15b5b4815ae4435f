// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]
use aidp_config::Settings;
use aidp_idp::oauth::ClientDirectory;
use aidp_idp::{IdpState, build_app};
use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "aidp-idp", version, about = "Agent Identity Plane IDP")]
struct Args {
    /// Bind address.
    #[arg(long, default_value = "127.0.0.1:8081")]
    bind: String,

    /// Audience protecting the IDP's own endpoints.
    #[arg(long, default_value = "idp.localhost")]
    idp_audience: String,

    /// Enable request debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("aidp=debug,aidp_idp=debug")
    } else {
        EnvFilter::new("aidp=info,aidp_idp=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = Settings::from_env().context("read settings from environment")?;
    settings.validate().context("validate settings")?;
    for warning in settings.warnings() {
        warn!(%warning, "configuration warning");
    }

    let clients = ClientDirectory::dev_defaults(&args.idp_audience, &settings.expected_aud);
    let state = Arc::new(
        IdpState::initialize(&settings, clients, &args.idp_audience)
            .context("initialize IDP state")?,
    );

    let app = build_app(state, &settings);

    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, issuer = %settings.issuer, "aidp-idp listening");

    axum::serve(listener, app).await.context("serve")
}
