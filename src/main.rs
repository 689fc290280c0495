//! tenantseal - Tenant-isolated encryption engine
//!
//! Usage:
//!   tenantseal init                          - Write a default config file
//!   tenantseal provision <org>               - Provision key material for an organization
//!   tenantseal encrypt-field <org> <value>   - Encrypt a field value
//!   tenantseal decrypt-field <org> <blob>    - Decrypt a field value
//!   tenantseal token <org> <value>           - Compute a search token
//!   tenantseal rotate start <org>            - Register and rotate to a new key version
//!   tenantseal rotate status <job-id>        - Poll a rotation job
//!   tenantseal verify <org> <blob>           - Verify a stored blob

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tenantseal::{
    config::Config,
    document::DocumentEncryption,
    field::FieldEncryption,
    keys::{KeyMaterialStore, KeyService},
    rotation::{RotationJobStore, RotationManager},
    store::{RecordStore, SledRecordStore},
    verify::IntegrityVerifier,
    Error, Result,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tenantseal")]
#[command(author = "tenantseal Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Tenant-isolated field and document encryption engine")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "~/.config/tenantseal/config.yaml")]
    config: PathBuf,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init,

    /// Provision key material for a new organization
    Provision {
        /// Organization identifier
        organization: String,

        /// Generate a random master secret instead of prompting for one
        #[arg(long)]
        generate_secret: bool,
    },

    /// Encrypt a field value under the organization's active key
    EncryptField {
        organization: String,
        value: String,
    },

    /// Decrypt a field blob
    DecryptField {
        organization: String,
        blob: String,
    },

    /// Compute the search token for a value
    Token {
        organization: String,
        value: String,
    },

    /// Encrypt a document file
    EncryptDoc {
        organization: String,
        document_id: String,
        input: PathBuf,

        /// Output path (defaults to <input>.sealed)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Decrypt a document file
    DecryptDoc {
        organization: String,
        document_id: String,
        input: PathBuf,

        /// Output path
        #[arg(short, long)]
        output: PathBuf,
    },

    /// Key rotation operations
    #[command(subcommand)]
    Rotate(RotateCommands),

    /// Verify a stored blob against its organization
    Verify {
        organization: String,
        blob: String,
    },

    /// Show provisioned organizations and active key versions
    Status,
}

#[derive(Subcommand)]
enum RotateCommands {
    /// Register the next key version and rotate all ciphertext onto it
    Start { organization: String },

    /// Poll a rotation job
    Status { job_id: String },

    /// Ask a running job to stop after its current batch
    Cancel { job_id: String },

    /// List all rotation jobs
    List,
}

/// Engine handles shared by the CLI commands
struct Engine {
    keys: Arc<KeyService>,
    fields: FieldEncryption,
    documents: DocumentEncryption,
    rotation: Arc<RotationManager>,
    records: Arc<SledRecordStore>,
}

fn open_engine(config: &Config) -> Result<Engine> {
    config.ensure_directories()?;

    let material = Arc::new(KeyMaterialStore::open(config.key_store_path())?);
    let keys = Arc::new(KeyService::new(material));
    let records = Arc::new(SledRecordStore::open(config.record_store_path())?);
    let jobs = Arc::new(RotationJobStore::open(config.job_store_path())?);

    let rotation = Arc::new(RotationManager::new(
        keys.clone(),
        records.clone() as Arc<dyn RecordStore>,
        jobs,
        config.rotation.clone(),
    ));

    Ok(Engine {
        fields: FieldEncryption::new(keys.clone()),
        documents: DocumentEncryption::with_limit(
            keys.clone(),
            config.documents.max_document_bytes,
        ),
        keys,
        rotation,
        records,
    })
}

fn expand_path(path: &PathBuf) -> PathBuf {
    if let Some(s) = path.to_str() {
        if let Some(rest) = s.strip_prefix("~/") {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
    }
    path.clone()
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let path = expand_path(path);
    if path.exists() {
        Config::load(path)
    } else {
        Ok(Config::default())
    }
}

fn read_master_secret(generate: bool) -> Result<Vec<u8>> {
    if generate {
        use rand::RngCore;
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        return Ok(secret);
    }

    let secret = rpassword::prompt_password("Master secret: ")?;
    if secret.is_empty() {
        return Err(Error::InvalidConfig(
            "Master secret must not be empty".to_string(),
        ));
    }
    Ok(secret.into_bytes())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("tenantseal=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tenantseal=info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Init => {
            let path = expand_path(&cli.config);
            if path.exists() {
                return Err(Error::Config(format!(
                    "Config file already exists: {}",
                    path.display()
                )));
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let config = Config::default();
            config.save(&path)?;
            println!("Wrote default config to {}", path.display());
        }

        Commands::Provision {
            organization,
            generate_secret,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            let secret = read_master_secret(generate_secret)?;

            engine.keys.store().provision(
                &organization,
                secret,
                config.kdf.derivation_params(),
            )?;
            println!("Provisioned organization {} at key version 1", organization);
        }

        Commands::EncryptField {
            organization,
            value,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            println!("{}", engine.fields.encrypt_field(&value, &organization)?);
        }

        Commands::DecryptField {
            organization,
            blob,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            println!("{}", engine.fields.decrypt_field(&blob, &organization)?);
        }

        Commands::Token {
            organization,
            value,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;
            println!("{}", engine.fields.search_token(&value, &organization)?);
        }

        Commands::EncryptDoc {
            organization,
            document_id,
            input,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;

            let buffer = std::fs::read(&input)?;
            let blob = engine
                .documents
                .encrypt_document(&buffer, &organization, &document_id)?;

            let output = output.unwrap_or_else(|| {
                let mut path = input.clone();
                path.set_extension("sealed");
                path
            });
            std::fs::write(&output, blob)?;
            println!("Sealed {} -> {}", input.display(), output.display());
        }

        Commands::DecryptDoc {
            organization,
            document_id,
            input,
            output,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;

            let blob = std::fs::read_to_string(&input)?;
            let buffer = engine
                .documents
                .decrypt_document(&blob, &organization, &document_id)?;
            std::fs::write(&output, &buffer)?;
            println!("Opened {} -> {}", input.display(), output.display());
        }

        Commands::Rotate(rotate) => match rotate {
            RotateCommands::Start { organization } => {
                let config = load_config(&cli.config)?;
                let engine = open_engine(&config)?;

                let target = engine
                    .keys
                    .store()
                    .add_version(&organization, config.kdf.derivation_params())?;
                let job = engine.rotation.schedule(&organization, target)?;
                info!(job_id = %job.id, target_version = target, "Rotation scheduled");

                let done = engine.rotation.run(&job.id).await?;
                engine.records.flush()?;
                println!(
                    "Rotation {}: {:?} ({}/{} records, {} failed)",
                    done.id,
                    done.status,
                    done.progress.processed_records,
                    done.progress.total_records,
                    done.progress.failed_records
                );
            }
            RotateCommands::Status { job_id } => {
                let config = load_config(&cli.config)?;
                let engine = open_engine(&config)?;

                let job = engine.rotation.status(&job_id)?;
                println!(
                    "{} {:?} org={} v{}->v{} {}/{} failed={}",
                    job.id,
                    job.status,
                    job.organization_id,
                    job.source_version,
                    job.target_version,
                    job.progress.processed_records,
                    job.progress.total_records,
                    job.progress.failed_records
                );
            }
            RotateCommands::Cancel { job_id } => {
                let config = load_config(&cli.config)?;
                let engine = open_engine(&config)?;
                engine.rotation.cancel(&job_id)?;
                println!("Cancellation requested for {}", job_id);
            }
            RotateCommands::List => {
                let config = load_config(&cli.config)?;
                let engine = open_engine(&config)?;
                for job in engine.rotation.list()? {
                    println!(
                        "{} {:?} org={} v{}->v{}",
                        job.id,
                        job.status,
                        job.organization_id,
                        job.source_version,
                        job.target_version
                    );
                }
            }
        },

        Commands::Verify {
            organization,
            blob,
        } => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;

            let verifier = IntegrityVerifier::new(engine.keys.clone());
            let outcome = verifier.verify(&blob, &organization)?;
            if outcome.is_ok() {
                println!("ok: {:?}", outcome);
            } else {
                warn!(?outcome, organization, "Verification failed");
                println!("FAILED: {:?}", outcome);
                std::process::exit(2);
            }
        }

        Commands::Status => {
            let config = load_config(&cli.config)?;
            let engine = open_engine(&config)?;

            let orgs = engine.keys.store().list_organizations()?;
            if orgs.is_empty() {
                println!("No organizations provisioned");
            }
            for org in orgs {
                let material = engine.keys.store().get(&org)?;
                println!(
                    "{}: active v{}, {} version(s)",
                    org,
                    material.active_key_version,
                    material.versions.len()
                );
            }
        }
    }

    Ok(())
}
