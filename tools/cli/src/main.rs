//! Bastion CLI - Command line interface for snapshot operations.
//!
//! This tool creates snapshots, runs key procedures against their vaults
//! and manages client store entries. Secrets are never printed; only
//! mnemonics, public keys and signatures leave the engine.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use bastion_common::Location;
use bastion_crypto::{Chain, KdfParams};
use bastion_vault::{
    Client, EngineConfig, KeyType, OutputLocation, Procedure, Slip10DeriveInput, Status,
    VaultManager,
};

const PASSWORD_ENV: &str = "BASTION_PASSWORD";

#[derive(Parser)]
#[command(name = "bastion")]
#[command(about = "Bastion - Encrypted secret vault")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Snapshot file (default: <data dir>/bastion/default.snapshot).
    #[arg(short, long, global = true)]
    snapshot: Option<PathBuf>,

    /// Client inside the snapshot.
    #[arg(short, long, global = true, default_value = "default")]
    client: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new snapshot.
    Init {
        /// KDF strength: "interactive", "moderate", or "sensitive".
        #[arg(long, default_value = "moderate")]
        strength: String,
    },

    /// Show snapshot information.
    Status,

    /// Generate a random SLIP-10 seed.
    Seed {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
        /// Seed length in bytes.
        #[arg(long, default_value_t = 64)]
        size: usize,
        /// Replace an existing record.
        #[arg(long)]
        overwrite: bool,
    },

    /// Generate a BIP-39 mnemonic and store its seed.
    Mnemonic {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        passphrase: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },

    /// Store the seed of an existing BIP-39 mnemonic.
    Recover {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        passphrase: Option<String>,
        #[arg(long)]
        overwrite: bool,
    },

    /// Derive an ed25519 key along a hardened SLIP-10 chain.
    Derive {
        /// Vault holding the seed or parent key.
        #[arg(long)]
        from_vault: String,
        #[arg(long)]
        from_record: String,
        /// Treat the source as an extended key instead of a seed.
        #[arg(long)]
        from_key: bool,
        /// Chain such as "m/44'/0'/0'" or "0/0/0".
        #[arg(long)]
        chain: String,
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
        #[arg(long)]
        overwrite: bool,
    },

    /// Print the public key of a private key record.
    PublicKey {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
    },

    /// Sign a message with a private key record.
    Sign {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
        #[arg(short, long)]
        message: String,
    },

    /// Put a value in the client store.
    StorePut {
        #[arg(short, long)]
        key: String,
        #[arg(long)]
        value: String,
        /// Drop the entry after this many seconds.
        #[arg(long)]
        ttl: Option<u64>,
    },

    /// Print a value from the client store.
    StoreGet {
        #[arg(short, long)]
        key: String,
    },

    /// Remove a value from the client store.
    StoreRemove {
        #[arg(short, long)]
        key: String,
    },

    /// Revoke a record.
    Remove {
        #[arg(long)]
        vault: String,
        #[arg(long)]
        record: String,
        /// Also purge revoked records of the vault.
        #[arg(long)]
        gc: bool,
    },

    /// Change the snapshot password.
    ChangePassword,

    /// Delete the snapshot file after checking its password.
    Destroy {
        /// Confirm the deletion.
        #[arg(long)]
        yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let path = match cli.snapshot {
        Some(path) => path,
        None => default_snapshot_path()?,
    };
    let client = cli.client.as_str();

    match cli.command {
        Commands::Init { strength } => cmd_init(&path, client, &strength).await,
        Commands::Status => cmd_status(&path).await,
        Commands::Seed {
            vault,
            record,
            size,
            overwrite,
        } => {
            let output = output(&vault, &record, overwrite);
            run(&path, client, |c| async move {
                c.execute_procedure(Procedure::Slip10Generate {
                    output,
                    size_bytes: Some(size),
                })
                .await?;
                println!("Seed stored at {}/{}", vault, record);
                Ok(true)
            })
            .await
        }
        Commands::Mnemonic {
            vault,
            record,
            passphrase,
            overwrite,
        } => {
            let output = output(&vault, &record, overwrite);
            run(&path, client, |c| async move {
                let phrase = c
                    .execute_procedure(Procedure::Bip39Generate { passphrase, output })
                    .await?
                    .into_mnemonic()
                    .context("Procedure returned no mnemonic")?;
                println!("Write down this mnemonic and keep it offline:\n\n{}\n", *phrase);
                Ok(true)
            })
            .await
        }
        Commands::Recover {
            vault,
            record,
            passphrase,
            overwrite,
        } => {
            let mnemonic = Zeroizing::new(
                rpassword::prompt_password("Enter mnemonic: ")
                    .context("Failed to read mnemonic")?,
            );
            let output = output(&vault, &record, overwrite);
            run(&path, client, |c| async move {
                c.execute_procedure(Procedure::Bip39Recover {
                    mnemonic: mnemonic.trim().to_string(),
                    passphrase,
                    output,
                })
                .await?;
                println!("Seed recovered to {}/{}", vault, record);
                Ok(true)
            })
            .await
        }
        Commands::Derive {
            from_vault,
            from_record,
            from_key,
            chain,
            vault,
            record,
            overwrite,
        } => {
            let chain = parse_chain(&chain)?;
            let source = Location::generic(from_vault.as_str(), from_record.as_str());
            let input = if from_key {
                Slip10DeriveInput::Key(source)
            } else {
                Slip10DeriveInput::Seed(source)
            };
            let output = output(&vault, &record, overwrite);
            run(&path, client, |c| async move {
                c.execute_procedure(Procedure::Slip10Derive {
                    chain,
                    input,
                    output,
                })
                .await?;
                println!("Key derived to {}/{}", vault, record);
                Ok(true)
            })
            .await
        }
        Commands::PublicKey { vault, record } => {
            run(&path, client, |c| async move {
                let public = c
                    .execute_procedure(Procedure::PublicKey {
                        ty: KeyType::Ed25519,
                        private_key: Location::generic(vault.as_str(), record.as_str()),
                    })
                    .await?
                    .into_public_key()
                    .context("Procedure returned no public key")?;
                println!("{}", hex::encode(public));
                Ok(false)
            })
            .await
        }
        Commands::Sign {
            vault,
            record,
            message,
        } => {
            run(&path, client, |c| async move {
                let signature = c
                    .execute_procedure(Procedure::Ed25519Sign {
                        private_key: Location::generic(vault.as_str(), record.as_str()),
                        msg: message.into_bytes(),
                    })
                    .await?
                    .into_signature()
                    .context("Procedure returned no signature")?;
                println!("{}", hex::encode(signature));
                Ok(false)
            })
            .await
        }
        Commands::StorePut { key, value, ttl } => {
            run(&path, client, |c| async move {
                c.store()
                    .insert(key.as_str(), value.into_bytes(), ttl.map(Duration::from_secs))
                    .await?;
                println!("Stored {}", key);
                Ok(true)
            })
            .await
        }
        Commands::StoreGet { key } => {
            run(&path, client, |c| async move {
                match c.store().get(key.as_str()).await? {
                    Some(value) => println!("{}", String::from_utf8_lossy(&value)),
                    None => println!("No entry for {}", key),
                }
                Ok(false)
            })
            .await
        }
        Commands::StoreRemove { key } => {
            run(&path, client, |c| async move {
                match c.store().remove(key.as_str()).await? {
                    Some(_) => println!("Removed {}", key),
                    None => println!("No entry for {}", key),
                }
                Ok(true)
            })
            .await
        }
        Commands::Remove { vault, record, gc } => {
            run(&path, client, |c| async move {
                c.vault(vault.as_str()).remove(record.as_str(), gc).await?;
                println!("Record {}/{} revoked", vault, record);
                Ok(true)
            })
            .await
        }
        Commands::ChangePassword => cmd_change_password(&path).await,
        Commands::Destroy { yes } => cmd_destroy(&path, yes).await,
    }
}

fn default_snapshot_path() -> Result<PathBuf> {
    let dir = dirs::data_dir().context("Could not determine data directory")?;
    Ok(dir.join("bastion").join("default.snapshot"))
}

/// Read the password from the environment, else prompt for it.
fn read_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password.into_bytes()));
    }
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    Ok(Zeroizing::new(password.into_bytes()))
}

/// Prompt twice and require both entries to match.
fn read_new_password() -> Result<Zeroizing<Vec<u8>>> {
    if let Ok(password) = std::env::var(PASSWORD_ENV) {
        return Ok(Zeroizing::new(password.into_bytes()));
    }
    let password = Zeroizing::new(
        rpassword::prompt_password("Enter new password: ")
            .context("Failed to read password")?
            .into_bytes(),
    );
    let confirm = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ")
            .context("Failed to read password")?
            .into_bytes(),
    );

    if password != confirm {
        anyhow::bail!("Passwords do not match");
    }
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(password)
}

fn output(vault: &str, record: &str, overwrite: bool) -> OutputLocation {
    OutputLocation::from(Location::generic(vault, record)).overwrite(overwrite)
}

/// Parse a hardened derivation chain. Accepts an optional leading "m" and
/// optional `'` or `h` suffixes; every index is hardened either way.
fn parse_chain(chain: &str) -> Result<Chain> {
    let indices = chain
        .trim()
        .split('/')
        .filter(|part| !part.is_empty() && *part != "m")
        .map(|part| {
            part.trim_end_matches(&['\'', 'h'][..])
                .parse::<u32>()
                .with_context(|| format!("Invalid chain index: {}", part))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Chain::from_u32_hardened(indices))
}

/// Open an existing snapshot and its client.
async fn open(path: &Path, client: &str) -> Result<(VaultManager, Client)> {
    if !path.exists() {
        anyhow::bail!(
            "No snapshot at {}. Run `bastion init` first.",
            path.display()
        );
    }
    let password = read_password("Enter password: ")?;

    let manager = VaultManager::local(EngineConfig::default());
    manager
        .load(path, &password)
        .await
        .context("Failed to open snapshot")?;
    let client = manager
        .load_client(path, client)
        .await
        .with_context(|| format!("Client {} not found", client))?;
    Ok((manager, client))
}

/// Run `op` on the client and save afterwards if it reports a change.
async fn run<F, Fut>(path: &Path, client: &str, op: F) -> Result<()>
where
    F: FnOnce(Client) -> Fut,
    Fut: std::future::Future<Output = Result<bool>>,
{
    let (manager, client) = open(path, client).await?;
    let changed = op(client).await.context("Operation failed")?;
    if changed {
        manager.save(path).await.context("Failed to save snapshot")?;
        info!(path = %path.display(), "Snapshot saved");
    }
    manager.unload(path).await?;
    Ok(())
}

/// Create a new snapshot with one empty client.
async fn cmd_init(path: &Path, client: &str, strength: &str) -> Result<()> {
    if path.exists() {
        anyhow::bail!("Snapshot already exists: {}", path.display());
    }

    let kdf_params = match strength {
        "interactive" => KdfParams::interactive(),
        "moderate" => KdfParams::moderate(),
        "sensitive" => KdfParams::sensitive(),
        _ => {
            anyhow::bail!("Invalid strength. Use: interactive, moderate, or sensitive");
        }
    };
    let password = read_new_password()?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create snapshot directory")?;
    }

    let manager = VaultManager::local(EngineConfig::default().with_kdf_params(kdf_params));
    manager.load(path, &password).await?;
    manager
        .create_client(path, client)
        .await
        .context("Failed to create client")?;
    manager
        .save(path)
        .await
        .context("Failed to save snapshot")?;

    println!("Snapshot created successfully!");
    println!("  Location: {}", path.display());
    println!("  Client: {}", client);
    Ok(())
}

/// Show snapshot information.
async fn cmd_status(path: &Path) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("No snapshot at {}", path.display());
    }
    let password = read_password("Enter password: ")?;

    let manager = VaultManager::local(EngineConfig::default());
    let snapshot = manager
        .load(path, &password)
        .await
        .context("Failed to open snapshot")?;

    let status = match snapshot.status().await? {
        Status::Locked => "locked".to_string(),
        Status::Unlocked { remaining: None } => "unlocked".to_string(),
        Status::Unlocked {
            remaining: Some(remaining),
        } => format!("unlocked ({}s left)", remaining.as_secs()),
    };
    let clients = snapshot.client_ids().await?;
    let metadata = manager.metadata(path).await?;

    println!("Snapshot Information:");
    println!("  Location: {}", path.display());
    println!("  Size: {} bytes", metadata.size);
    println!("  Modified: {}", metadata.modified.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("  Status: {}", status);
    println!("  Clients: {}", clients.len());
    for id in clients {
        println!("    {}", id);
    }

    manager.unload(path).await?;
    Ok(())
}

/// Delete the snapshot file once the password checks out.
async fn cmd_destroy(path: &Path, confirmed: bool) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("No snapshot at {}", path.display());
    }
    if !confirmed {
        anyhow::bail!("Refusing to delete {} without --yes", path.display());
    }
    let password = read_password("Enter password: ")?;

    let manager = VaultManager::local(EngineConfig::default());
    manager
        .load(path, &password)
        .await
        .context("Failed to open snapshot")?;
    manager
        .delete(path)
        .await
        .context("Failed to delete snapshot")?;

    println!("Snapshot deleted: {}", path.display());
    Ok(())
}

/// Re-encrypt the snapshot under a new password.
async fn cmd_change_password(path: &Path) -> Result<()> {
    info!("Changing snapshot password");

    if !path.exists() {
        anyhow::bail!("No snapshot at {}", path.display());
    }
    let old_password = Zeroizing::new(
        rpassword::prompt_password("Enter current password: ")
            .context("Failed to read password")?
            .into_bytes(),
    );
    let new_password = read_new_password()?;

    let manager = VaultManager::local(EngineConfig::default());
    manager
        .load(path, &old_password)
        .await
        .context("Failed to open snapshot")?;
    manager
        .save_with_password(path, &new_password)
        .await
        .context("Failed to change password")?;

    println!("Password changed successfully!");
    manager.unload(path).await?;
    Ok(())
}
