use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

use copr::control::Controller;
use copr::secrets::{self, Secrets};
use copr::service::Service;

#[derive(Debug, Parser)]
#[command(name = "coprd", version, about = "copr supervisor daemon")]
struct Args {
    /// HTTP bind address of the control plane.
    #[arg(long = "bind", default_value = "127.0.0.1:21001")]
    bind: String,

    /// Workspace directory holding the units.
    #[arg(long = "dir", default_value = ".")]
    dir: PathBuf,

    /// Password for the workspace secrets file.
    #[arg(long = "sec", default_value = "")]
    sec: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
    info!("{}", copr::build_banner());

    let args = Args::parse();

    let sec_path = args.dir.join(secrets::SECRET_FILE);
    let secs = Secrets::load(&sec_path, &args.sec)
        .with_context(|| format!("load secrets at {}", sec_path.display()))?;

    let api_key = secs
        .find("copr.apikey")
        .map(str::to_string)
        .context("found no copr.apikey in secrets")?;

    let env_path = args.dir.join(secrets::GLOBAL_ENV_FILE);
    let global_env: BTreeMap<String, String> = secrets::load_global_env(&env_path, &secs)
        .with_context(|| format!("load global env at {}", env_path.display()))?;

    let controller = Controller::new(&args.dir, Arc::new(secs), global_env)
        .with_context(|| format!("new controller in {}", args.dir.display()))?;
    let service = Service::new(args.bind.clone(), controller, api_key);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut term = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    tracing::error!("install SIGTERM handler: {e}");
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
            info!("signal received, shutting down");
            cancel.cancel();
        });
    }

    service.run_ctx(cancel).await
}
