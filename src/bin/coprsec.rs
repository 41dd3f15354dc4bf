use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use copr::secrets::{Secrets, SECRET_FILE};

#[derive(Debug, Parser)]
#[command(name = "coprsec", version, about = "edit a copr secrets file")]
struct Args {
    /// Secrets file to operate on.
    #[arg(long = "file", default_value = SECRET_FILE)]
    file: PathBuf,

    /// Password; prompted on stdin when omitted.
    #[arg(long = "pwd")]
    pwd: Option<String>,

    #[command(subcommand)]
    cmd: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Print all keys and values (default)
    Show,
    /// Set a key
    Set { key: String, value: String },
    /// Delete a key
    Del { key: String },
}

fn read_password() -> anyhow::Result<String> {
    print!("Enter password: ");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read password")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn show(secs: &Secrets) {
    for key in secs.keys() {
        if let Some(value) = secs.find(key) {
            println!("{key:?} = {value:?}");
        }
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if !args.file.exists() {
        println!("There's no secrets file at {:?}. Continue to create a new one.", args.file);
    }
    let pwd = match args.pwd {
        Some(p) => p,
        None => read_password()?,
    };

    let mut secs = Secrets::load(&args.file, &pwd)
        .with_context(|| format!("load secrets at {}", args.file.display()))?;

    match args.cmd.unwrap_or(Cmd::Show) {
        Cmd::Show => show(&secs),
        Cmd::Set { key, value } => {
            secs.set(key, value);
            secs.save().context("save secrets")?;
            show(&secs);
        }
        Cmd::Del { key } => {
            secs.delete(&key);
            secs.save().context("save secrets")?;
            show(&secs);
        }
    }
    Ok(())
}
