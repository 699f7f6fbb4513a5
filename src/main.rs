use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use gpgwrap::gpg::{GpgConfigBuilder, GpgContext, Imported, Key, KeyLookup, resolve_gpg_path};
use gpgwrap::logging::{LogConfig, init_logging};

/// CLI arguments for the gpg wrapper
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the gpg executable (overrides GPG_PATH env var)
    #[arg(long, value_name = "PATH")]
    gpg_path: Option<String>,

    /// Keyring directory passed to gpg as --homedir
    #[arg(long, value_name = "DIR")]
    homedir: Option<PathBuf>,

    /// Log level (overrides RUST_LOG env var)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Log file path (overrides GPGWRAP_LOG_FILE env var)
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Give up on any single gpg invocation after this many seconds
    #[arg(long, value_name = "SECS")]
    timeout: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the detected gpg version
    Version,

    /// List installed public keys, optionally only those for the given addresses
    List {
        /// Print keys as JSON
        #[arg(long)]
        json: bool,

        #[arg(value_name = "EMAIL")]
        emails: Vec<String>,
    },

    /// Look up the key for one address
    Find {
        #[arg(value_name = "EMAIL")]
        email: String,
    },

    /// Import the public key stored in a file
    Import {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Import every key file below a directory
    ImportDir {
        #[arg(value_name = "DIR")]
        dir: PathBuf,
    },

    /// Encrypt input to one or more recipients
    Encrypt {
        /// Recipient address, repeatable
        #[arg(short, long = "recipient", value_name = "EMAIL", required_unless_present = "all")]
        recipients: Vec<String>,

        /// Encrypt to every installed key
        #[arg(long, conflicts_with = "recipients")]
        all: bool,

        /// ASCII-armored output
        #[arg(long)]
        armor: bool,

        /// Read plaintext from FILE instead of stdin
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Write ciphertext to FILE instead of stdout
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Decrypt input with the keyring's secret keys
    Decrypt {
        /// Read ciphertext from FILE instead of stdin
        #[arg(long, value_name = "FILE")]
        input: Option<PathBuf>,

        /// Write plaintext to FILE instead of stdout
        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Delete the public key for an address
    Remove {
        #[arg(value_name = "EMAIL")]
        email: String,
    },
}

async fn read_input(path: Option<&Path>) -> std::io::Result<Vec<u8>> {
    match path {
        Some(path) => tokio::fs::read(path).await,
        None => {
            let mut data = Vec::new();
            tokio::io::stdin().read_to_end(&mut data).await?;
            Ok(data)
        }
    }
}

async fn write_output(path: Option<&Path>, data: &[u8]) -> std::io::Result<()> {
    match path {
        Some(path) => tokio::fs::write(path, data).await,
        None => {
            let mut stdout = tokio::io::stdout();
            stdout.write_all(data).await?;
            stdout.flush().await
        }
    }
}

fn describe(key: &Key) -> String {
    let mut line = format!("{}  {}", key.key_id, key.email);
    if let Some(name) = &key.name {
        line.push_str(&format!("  {}", name));
    }
    line
}

async fn run(ctx: &GpgContext, command: Command) -> Result<(), Box<dyn std::error::Error>> {
    let keyring = ctx.keyring();

    match command {
        Command::Version => {
            println!("{} (GnuPG {})", ctx.config().gpg_path, ctx.version());
            if let Some(home) = &ctx.version().home {
                println!("Home: {}", home.display());
            }
        }
        Command::List { json, emails } => {
            let keys = if emails.is_empty() {
                keyring.installed_public_keys().await?
            } else {
                keyring.all(&emails).await?
            };

            if json {
                println!("{}", serde_json::to_string_pretty(&keys)?);
            } else {
                for key in &keys {
                    println!("{}", describe(key));
                }
            }
        }
        Command::Find { email } => match keyring.find(&email).await? {
            KeyLookup::Found(key) => println!("{}", describe(&key)),
            KeyLookup::NotFound => return Err(format!("no key installed for {}", email).into()),
            KeyLookup::Malformed(record) => return Err(record.into()),
        },
        Command::Import { file } => match keyring.import_file(&file).await? {
            Imported::New(key) => println!("imported {}", describe(&key)),
            Imported::AlreadyInstalled(key) => println!("already installed {}", describe(&key)),
        },
        Command::ImportDir { dir } => {
            let report = keyring.import_keys_at(&dir).await?;
            for key in &report.imported {
                println!("imported {}", describe(key));
            }
            for key in &report.already_installed {
                println!("already installed {}", describe(key));
            }
            for skipped in &report.skipped {
                println!("skipped {}: {}", skipped.path.display(), skipped.reason);
            }
        }
        Command::Encrypt {
            recipients,
            all,
            armor,
            input,
            output,
        } => {
            let data = read_input(input.as_deref()).await?;
            let mut encryption = ctx.encrypt(data);
            if armor {
                encryption = encryption.armor(true);
            }

            let encryption = if all {
                encryption.keys(keyring.installed_public_keys().await?)
            } else {
                encryption.recipients(&recipients).await?
            };

            let ciphertext = encryption.result().await?;
            write_output(output.as_deref(), &ciphertext).await?;
        }
        Command::Decrypt { input, output } => {
            let ciphertext = read_input(input.as_deref()).await?;
            let plaintext = ctx.decrypt(&ciphertext).await?;
            write_output(output.as_deref(), &plaintext).await?;
        }
        Command::Remove { email } => {
            let key = keyring.remove(&email).await?;
            println!("removed {}", describe(&key));
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging with configuration from env vars and CLI args
    let log_config = LogConfig::from_env().with_overrides(args.log_level, args.log_file);

    if let Err(e) = init_logging(log_config) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    // Ctrl-C stops whatever gpg is doing
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, stopping gpg");
                cancel.cancel();
            }
        }
    });

    let mut builder = GpgConfigBuilder::new()
        .gpg_path(resolve_gpg_path(args.gpg_path))
        .cancellation_token(cancel);
    if let Some(homedir) = args.homedir {
        builder = builder.homedir(homedir);
    }
    if let Some(secs) = args.timeout {
        builder = builder.deadline(Duration::from_secs(secs));
    }

    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            std::process::exit(1);
        }
    };

    let ctx = match GpgContext::new(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            eprintln!("Failed to start gpg: {}", e);
            std::process::exit(1);
        }
    };
    info!("gpgwrap ready with GnuPG {}", ctx.version());

    if let Err(e) = run(&ctx, args.command).await {
        eprintln!("gpgwrap: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
