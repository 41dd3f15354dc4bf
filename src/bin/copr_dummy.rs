//! Minimal HTTP child program for exercising the supervisor: answers probes,
//! reads its own environment, and crashes on demand.

use std::time::Duration;

use axum::extract::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use clap::Parser;
use tracing::info;

use copr::testkit::{self, DummyCommand};

#[derive(Debug, Parser)]
#[command(name = "copr-dummy", version, about = "test child for copr")]
struct Args {
    /// HTTP bind address.
    #[arg(long = "bind", default_value = "127.0.0.1:21000")]
    bind: String,
}

async fn handle(Json(cmd): Json<DummyCommand>) -> Response {
    match cmd.action.as_str() {
        testkit::ACTION_PROBE => StatusCode::OK.into_response(),
        testkit::ACTION_CRASH => {
            // Reply first, then die; the supervisor is expected to notice the
            // exit and restart us.
            tokio::spawn(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                std::process::exit(1);
            });
            StatusCode::OK.into_response()
        }
        testkit::ACTION_STRESS => {
            tokio::task::spawn_blocking(|| burn_cpu(Duration::from_secs(60)));
            StatusCode::OK.into_response()
        }
        testkit::ACTION_GETENV => {
            let value = std::env::var(&cmd.param).unwrap_or_default();
            (StatusCode::OK, value).into_response()
        }
        other => (
            StatusCode::BAD_REQUEST,
            format!("unknown action {other:?}"),
        )
            .into_response(),
    }
}

/// Busy-loops on a BBP series so the supervisor's stats collection has real
/// CPU and memory movement to observe.
fn burn_cpu(dur: Duration) {
    info!("stress for {dur:?}");
    let deadline = std::time::Instant::now() + dur;
    let mut pis: Vec<f64> = Vec::new();
    while std::time::Instant::now() < deadline {
        let mut pi = 0.0f64;
        for k in 0..10_000 {
            let k = k as f64;
            pi += 1.0 / 16.0f64.powf(k)
                * (4.0 / (8.0 * k + 1.0)
                    - 2.0 / (8.0 * k + 4.0)
                    - 1.0 / (8.0 * k + 5.0)
                    - 1.0 / (8.0 * k + 6.0));
        }
        pis.push(pi);
        pis.sort_by(f64::total_cmp);
    }
    info!("stress done");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let listener = tokio::net::TcpListener::bind(&args.bind).await?;
    info!("copr-dummy: listening on {:?}", args.bind);

    let app = Router::new().route("/", post(handle));
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    info!("copr-dummy: done");
    Ok(())
}
