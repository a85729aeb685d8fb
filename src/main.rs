use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use stepwise_migrations::utils::{compute_hash, CONFIG_FILE};
use stepwise_migrations::{
    build_service, read_config, EngineConfig, MigrationContext, MigrationDefinition, MigrationFormat,
    MigrationService, MigrationStatus, OutputSink, TemplateEngine,
};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Stepwise - run declarative, resumable migrations
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the configuration file
    #[arg(short, long, env = "STEPWISE_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show every known migration with its status
    Status,

    /// Execute pending migrations
    Migrate {
        /// Files or directories to take migrations from (default: configured directories)
        paths: Vec<PathBuf>,

        /// Also re-run migrations which were already executed
        #[arg(long)]
        force: bool,

        /// Do not wrap each migration in a transaction
        #[arg(long)]
        no_transaction: bool,

        /// Login to assume when committing
        #[arg(long)]
        admin_login: Option<String>,

        /// Inject a reference before the first step, as name=value (value may be JSON)
        #[arg(long = "set-reference", value_name = "NAME=VALUE")]
        set_references: Vec<String>,
    },

    /// Resume suspended migrations
    Resume {
        /// Only resume this migration
        name: Option<String>,
    },

    /// Mark migrations as skipped without executing them
    Skip { path: PathBuf },

    /// Record migrations as to-do without executing them
    Add { path: PathBuf },

    /// Forget the record of a migration
    Delete { name: String },

    /// Write a new migration file
    Generate {
        name: String,

        #[arg(long, default_value = "yaml")]
        format: String,

        /// Step type whose executor generates the steps
        #[arg(long = "type")]
        step_type: Option<String>,

        /// Match conditions, as JSON
        #[arg(long = "match", default_value = "{\"all\": true}")]
        match_conditions: String,

        #[arg(long, default_value = "create")]
        mode: String,
    },
}

/// Prints step output to the console
struct ConsoleOutput;

impl OutputSink for ConsoleOutput {
    fn write_line(&self, line: &str) {
        println!("{}", line);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let args = Args::parse();

    let config = match read_config(&args.config).await? {
        Some(config) => config,
        None => {
            info!("No configuration at {}, using defaults", args.config.display());
            EngineConfig::default().resolved(&std::env::current_dir()?)
        }
    };

    let mut service = build_service(&config).await?;
    service.set_output(Arc::new(ConsoleOutput));

    match args.command {
        Command::Status => status(&service).await,
        Command::Migrate {
            paths,
            force,
            no_transaction,
            admin_login,
            set_references,
        } => {
            let mut context = MigrationContext::new()
                .with_force_execution(force)
                .with_transaction(config.use_transaction && !no_transaction);
            if let Some(login) = admin_login {
                context = context.with_admin_login(login);
            }
            for (name, value) in parse_references(&set_references)? {
                context = context.with_forced_reference(name, value);
            }
            migrate(&mut service, &paths, context).await
        }
        Command::Resume { name } => resume(&mut service, name.as_deref()).await,
        Command::Skip { path } => {
            for definition in definitions_at(&service, &path).await? {
                service.skip_migration(&definition).await?;
                println!("Skipped {}", definition.name);
            }
            Ok(())
        }
        Command::Add { path } => {
            for definition in definitions_at(&service, &path).await? {
                service.add_migration(&definition).await?;
                println!("Added {}", definition.name);
            }
            Ok(())
        }
        Command::Delete { name } => {
            let migration = service
                .get_migration(&name)
                .await?
                .with_context(|| format!("No migration named '{}'", name))?;
            service.delete_migration(&migration).await?;
            println!("Deleted {}", name);
            Ok(())
        }
        Command::Generate {
            name,
            format,
            step_type,
            match_conditions,
            mode,
        } => {
            let format: MigrationFormat = format.parse().map_err(anyhow::Error::msg)?;
            let steps = match step_type {
                Some(step_type) => {
                    let conditions: Value = serde_json::from_str(&match_conditions)
                        .context("--match must be valid JSON")?;
                    service
                        .generate_migration(&step_type, &conditions, &mode)
                        .await?
                }
                None => Vec::new(),
            };

            let dir = config
                .migration_dirs
                .first()
                .cloned()
                .unwrap_or_else(|| PathBuf::from("migrations"));
            let path = TemplateEngine::new()?
                .write_migration(&dir, format, &name, &steps)
                .await?;
            println!("Generated {}", path.display());
            Ok(())
        }
    }
}

/// `name=value` pairs; values are JSON when they parse as such, strings otherwise
fn parse_references(raw: &[String]) -> anyhow::Result<BTreeMap<String, Value>> {
    let mut references = BTreeMap::new();
    for entry in raw {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("Invalid reference '{}', expected name=value", entry);
        };
        let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
        references.insert(name.trim().to_string(), value);
    }
    Ok(references)
}

async fn definitions_at(
    service: &MigrationService,
    path: &PathBuf,
) -> anyhow::Result<Vec<MigrationDefinition>> {
    let definitions = service
        .get_migrations_definitions(std::slice::from_ref(path))
        .await?;
    if definitions.is_empty() {
        bail!("No migration definition found at {}", path.display());
    }
    Ok(definitions)
}

async fn status(service: &MigrationService) -> anyhow::Result<()> {
    let definitions = service.get_migrations_definitions(&[]).await?;
    let mut records: BTreeMap<String, _> = service
        .get_migrations(None, None)
        .await?
        .into_iter()
        .map(|m| (m.name.clone(), m))
        .collect();

    println!("{:<48} {:<16} {:<24} notes", "migration", "status", "executed");
    for definition in &definitions {
        match records.remove(&definition.name) {
            Some(migration) => {
                let drift = if migration.content_hash != compute_hash(&definition.raw_definition) {
                    "source changed since execution"
                } else {
                    ""
                };
                let executed = migration
                    .execution_date
                    .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{:<48} {:<16} {:<24} {}", definition.name, migration.status, executed, drift);
            }
            None => println!("{:<48} {:<16}", definition.name, "not executed"),
        }
    }
    for migration in records.values() {
        println!(
            "{:<48} {:<16} {:<24} definition missing",
            migration.name, migration.status, ""
        );
    }
    Ok(())
}

async fn migrate(
    service: &mut MigrationService,
    paths: &[PathBuf],
    context: MigrationContext,
) -> anyhow::Result<()> {
    let definitions = service.get_migrations_definitions(paths).await?;

    let mut executed = 0;
    for definition in definitions {
        let pending = match service.get_migration(&definition.name).await? {
            None => true,
            Some(migration) if migration.status == MigrationStatus::ToDo => true,
            Some(migration) => {
                context.force_execution
                    && !matches!(
                        migration.status,
                        MigrationStatus::Suspended | MigrationStatus::Started
                    )
            }
        };
        if !pending {
            continue;
        }

        let name = definition.name.clone();
        println!("Processing {}", name);
        service
            .execute_migration(definition, context.clone())
            .await
            .with_context(|| format!("Migration '{}' failed", name))?;
        executed += 1;
    }

    println!("{} migration(s) executed", executed);
    Ok(())
}

async fn resume(service: &mut MigrationService, name: Option<&str>) -> anyhow::Result<()> {
    let migrations = match name {
        Some(name) => vec![service
            .get_migration(name)
            .await?
            .with_context(|| format!("No migration named '{}'", name))?],
        None => {
            service
                .get_migrations_by_status(MigrationStatus::Suspended, None, None)
                .await?
        }
    };

    for migration in &migrations {
        println!("Resuming {}", migration.name);
        service
            .resume_migration(migration, MigrationContext::new())
            .await
            .with_context(|| format!("Migration '{}' failed", migration.name))?;
    }
    Ok(())
}
