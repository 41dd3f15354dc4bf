use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};

use copr::archive;
use copr::service::CtlResponse;

#[derive(Debug, Parser)]
#[command(name = "coprctl", version, about = "operator CLI for coprd")]
struct Args {
    /// coprd host, also read from COPRD_HOST.
    #[arg(long = "host")]
    host: Option<String>,

    /// API key, also read from COPRD_APIKEY.
    #[arg(long = "api-key")]
    api_key: Option<String>,

    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Show runtime stats for one unit, or all
    Stat { unit: Option<String> },
    /// Start all enabled units
    StartAll,
    /// Stop all running units
    StopAll,
    /// Start one unit
    Start { unit: String },
    /// Stop one unit
    Stop { unit: String },
    /// Enable a unit (persists, does not start it)
    Enable { unit: String },
    /// Disable a unit (stops it first if running)
    Disable { unit: String },
    /// Zip a local directory and deploy it as the named unit
    Deploy { unit: String, dir: PathBuf },
}

struct Client {
    http: reqwest::Client,
    host: String,
    api_key: String,
}

impl Client {
    fn new(host: String, api_key: String) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            http,
            host,
            api_key,
        })
    }

    async fn request(&self, req: reqwest::RequestBuilder) -> anyhow::Result<CtlResponse> {
        let resp = req
            .bearer_auth(&self.api_key)
            .send()
            .await
            .context("send request")?;
        let status = resp.status();
        let ctl: CtlResponse = resp.json().await.context("decode response")?;
        if !status.is_success() {
            for e in &ctl.errors {
                eprintln!("ERROR: COPR: {e}");
            }
            anyhow::bail!("status {status}");
        }
        Ok(ctl)
    }

    async fn get(&self, path: &str) -> anyhow::Result<CtlResponse> {
        self.request(self.http.get(format!("http://{}/{path}", self.host)))
            .await
    }

    async fn post(&self, path: &str, body: Option<Vec<u8>>) -> anyhow::Result<CtlResponse> {
        let mut req = self.http.post(format!("http://{}/{path}", self.host));
        if let Some(body) = body {
            req = req.body(body);
        }
        self.request(req).await
    }

    async fn exec(&self, cmd: Cmd) -> anyhow::Result<CtlResponse> {
        match cmd {
            Cmd::Stat { unit: Some(unit) } => self.get(&format!("stat?unit={unit}")).await,
            Cmd::Stat { unit: None } => self.get("stat").await,
            Cmd::StartAll => self.post("start-all", None).await,
            Cmd::StopAll => self.post("stop-all", None).await,
            Cmd::Start { unit } => self.post(&format!("start?unit={unit}"), None).await,
            Cmd::Stop { unit } => self.post(&format!("stop?unit={unit}"), None).await,
            Cmd::Enable { unit } => self.post(&format!("enable?unit={unit}"), None).await,
            Cmd::Disable { unit } => self.post(&format!("disable?unit={unit}"), None).await,
            Cmd::Deploy { unit, dir } => {
                let bundle = archive::zip_dir_to_vec(&dir)
                    .with_context(|| format!("zip {}", dir.display()))?;
                self.post(&format!("deploy?unit={unit}"), Some(bundle)).await
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let host = args
        .host
        .or_else(|| std::env::var("COPRD_HOST").ok())
        .unwrap_or_else(|| "127.0.0.1:21001".to_string());
    let api_key = args
        .api_key
        .or_else(|| std::env::var("COPRD_APIKEY").ok())
        .unwrap_or_default();

    let t0 = Instant::now();
    let outcome = match Client::new(host, api_key) {
        Ok(client) => client.exec(args.cmd).await,
        Err(e) => Err(e),
    };

    let failed = match outcome {
        Ok(ctl) => {
            for e in &ctl.errors {
                eprintln!("ERROR: COPR: {e}");
            }
            for m in &ctl.messages {
                println!("{m}");
            }
            !ctl.errors.is_empty()
        }
        Err(e) => {
            eprintln!("ERROR: REQUEST: {e:#}");
            true
        }
    };
    println!("{:?}", t0.elapsed());

    if failed {
        std::process::exit(1);
    }
}
