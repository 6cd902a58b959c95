use std::{
    io::{self, BufRead, Write},
    path::PathBuf,
};

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use hsm_signer::{
    ProviderFactory, ProviderManager, SealedSecrets, SignerConfig, SignerError, SignerResult,
    SECRET_KEY_ENV,
};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use zeroize::Zeroizing;

const DEFAULT_LOG_FILTER: &str = "hsm_signer=info";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "HSM signing host",
    propagate_version = true
)]
struct Cli {
    /// Signer configuration (TOML).
    #[arg(long, short, env = "HSM_SIGNER_CONFIG", default_value = "hsm-signer.toml")]
    config: PathBuf,

    /// Base64 AES-256 key used to unseal configured PINs and passwords.
    #[arg(long, env = SECRET_KEY_ENV, hide_env_values = true)]
    secret_key: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Sign one or more base64 hashes with the key behind a certificate label.
    Sign {
        #[arg(long)]
        key: String,
        #[arg(required = true)]
        hashes: Vec<String>,
    },
    /// Answer JSON sign requests read line by line from stdin.
    Serve,
    /// Seal a PIN or password, read from the first line of stdin, for the
    /// configuration file.
    Seal,
}

#[derive(Debug, Deserialize)]
struct SignRequest {
    key: String,
    hash: HashInput,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HashInput {
    One(String),
    Many(Vec<String>),
}

impl HashInput {
    fn into_vec(self) -> Vec<String> {
        match self {
            HashInput::One(hash) => vec![hash],
            HashInput::Many(hashes) => hashes,
        }
    }
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(untagged)]
enum SignResponse {
    Signed { signatures: Vec<String> },
    Failed { error: String, kind: &'static str },
}

impl SignResponse {
    fn from_error(err: &SignerError) -> Self {
        SignResponse::Failed {
            error: err.to_string(),
            kind: err.kind().as_str(),
        }
    }
}

/// Owns the manager and applies the per-request recycling policy.
struct Host {
    manager: ProviderManager,
    singleton: bool,
}

impl Host {
    /// Any startup error stops the host; a provider that never loaded would
    /// otherwise fail every request.
    fn start(shared_dir: PathBuf, factory: ProviderFactory, singleton: bool) -> SignerResult<Self> {
        let mut manager = ProviderManager::new();
        manager.startup(shared_dir, factory)?;
        Ok(Self { manager, singleton })
    }

    fn sign(&mut self, key: &str, hashes: &[String]) -> SignerResult<Vec<String>> {
        if !self.singleton {
            self.manager.recycle()?;
        }
        self.manager.sign_batch(key, hashes)
    }

    /// Handles one request line. Fatal errors are returned after the response
    /// has been produced.
    fn respond(&mut self, line: &str) -> (SignResponse, Option<SignerError>) {
        let request: SignRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(err) => {
                let response = SignResponse::Failed {
                    error: format!("malformed request: {err}"),
                    kind: "request",
                };
                return (response, None);
            }
        };
        let hashes = request.hash.into_vec();
        match self.sign(&request.key, &hashes) {
            Ok(signatures) => (SignResponse::Signed { signatures }, None),
            Err(err) => {
                let response = SignResponse::from_error(&err);
                let fatal = err.kind().is_fatal().then_some(err);
                (response, fatal)
            }
        }
    }

    fn serve<R: BufRead, W: Write>(&mut self, input: R, mut output: W) -> anyhow::Result<()> {
        for line in input.lines() {
            let line = line.context("failed to read request")?;
            if line.trim().is_empty() {
                continue;
            }
            let (response, fatal) = self.respond(&line);
            if let SignResponse::Failed { error, kind } = &response {
                warn!(kind, error = %error, "sign request failed");
            }
            serde_json::to_writer(&mut output, &response).context("failed to encode response")?;
            output.write_all(b"\n").context("failed to write response")?;
            output.flush().context("failed to flush response")?;
            if let Some(err) = fatal {
                bail!(err);
            }
        }
        Ok(())
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(io::stderr),
        )
        .init();
}

fn read_secret<R: BufRead>(mut input: R) -> anyhow::Result<Zeroizing<String>> {
    let mut line = Zeroizing::new(String::new());
    input
        .read_line(&mut line)
        .context("failed to read secret from stdin")?;
    let secret = line.trim_end_matches(['\r', '\n']);
    if secret.is_empty() {
        bail!("no secret on stdin");
    }
    Ok(Zeroizing::new(secret.to_string()))
}

fn load_config(cli: &Cli) -> anyhow::Result<SignerConfig> {
    let mut config = SignerConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    if let Some(key) = &cli.secret_key {
        config.secret_key = Some(key.clone());
    }
    Ok(config)
}

fn start_host(cli: &Cli) -> anyhow::Result<Host> {
    let config = load_config(cli)?;
    let factory = config.factory().context("invalid provider configuration")?;
    info!(
        application = %config.application,
        singleton = config.singleton,
        "starting signer host"
    );
    Host::start(config.shared_dir.clone(), factory, config.singleton)
        .context("failed to start signing provider")
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Seal => {
            let Some(key) = &cli.secret_key else {
                bail!("sealing requires --secret-key or {SECRET_KEY_ENV}");
            };
            let secrets = SealedSecrets::from_base64(key).context("invalid secret key")?;
            let secret = read_secret(io::stdin().lock())?;
            println!("{}", secrets.seal(secret.as_bytes())?);
        }
        Commands::Sign { key, hashes } => {
            let mut host = start_host(&cli)?;
            match host.sign(key, hashes) {
                Ok(signatures) => {
                    for signature in signatures {
                        println!("{signature}");
                    }
                }
                Err(err) => {
                    error!(kind = err.kind().as_str(), error = %err, "signing failed");
                    return Err(err.into());
                }
            }
        }
        Commands::Serve => {
            let mut host = start_host(&cli)?;
            let stdin = io::stdin();
            host.serve(stdin.lock(), io::stdout().lock())?;
            info!("input closed, shutting down");
        }
    }
    Ok(())
}
