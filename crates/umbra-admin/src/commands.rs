//! Argument parsing and dispatch for the admin CLI.

use anyhow::bail;
use clap::{Parser, Subcommand};
use umbra_shared::ServerSecret;
use umbra_store::{
    BackupKind, BackupManager, ConfigStore, EndpointRotator, StoreSettings,
};

/// Manage the Umbra users store, snapshots, backups and endpoint paths.
#[derive(Debug, Parser)]
#[command(
    name = "umbra-admin",
    version,
    after_help = "Settings come from UMBRA_* environment variables; logging from RUST_LOG."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Mint the deployment secrets and set the admin password
    InitServer { password: String },
    /// Create a user with fresh credentials
    AddUser { username: String },
    RemoveUser { username: String },
    ShowUser { username: String },
    ListUsers,
    /// Enable or disable a user
    SetActive {
        username: String,
        #[arg(
            action = clap::ArgAction::Set,
            value_parser = clap::builder::BoolishValueParser::new()
        )]
        active: bool,
    },
    /// Regenerate one server secret: wireguard, xray or session
    RotateSecret {
        #[arg(value_parser = parse_secret)]
        which: ServerSecret,
    },
    Status,
    /// Run pending schema migrations
    Migrate,
    #[command(subcommand)]
    Snapshot(SnapshotCommand),
    #[command(subcommand)]
    Backup(BackupCommand),
    #[command(subcommand)]
    Endpoints(EndpointsCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum SnapshotCommand {
    Create,
    List,
    Restore { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum BackupCommand {
    /// Archive the configuration directory
    Create { description: Vec<String> },
    List,
    Restore { name: String },
    Delete { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum EndpointsCommand {
    Show,
    /// Generate a new endpoint set if the current one is due
    Rotate {
        #[arg(long)]
        force: bool,
    },
    Validate,
}

fn parse_secret(s: &str) -> Result<ServerSecret, String> {
    ServerSecret::parse(s)
        .ok_or_else(|| format!("expected wireguard, xray or session, got '{s}'"))
}

pub fn run(command: Command, settings: StoreSettings) -> anyhow::Result<()> {
    let store = ConfigStore::open(settings)?;
    match command {
        Command::InitServer { password } => {
            store.initialize_server(&password)?;
            println!("Server configuration initialized");
        }
        Command::AddUser { username } => {
            let user = store.add_user(&username)?;
            println!("{}", serde_json::to_string_pretty(&user)?);
        }
        Command::RemoveUser { username } => {
            if store.remove_user(&username)? {
                println!("Removed user {username}");
            } else {
                bail!("no user named '{username}'");
            }
        }
        Command::ShowUser { username } => match store.get_user(&username)? {
            Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
            None => bail!("no user named '{username}'"),
        },
        Command::ListUsers => {
            for user in store.list_users()? {
                println!(
                    "{:<32} {:<8} created {:<32} last seen {}",
                    user.username,
                    if user.is_active { "active" } else { "disabled" },
                    user.created_at.as_deref().unwrap_or("-"),
                    user.last_seen.as_deref().unwrap_or("never"),
                );
            }
        }
        Command::SetActive { username, active } => {
            store.set_user_active(&username, active)?;
            println!(
                "User {username} is now {}",
                if active { "active" } else { "disabled" }
            );
        }
        Command::RotateSecret { which } => {
            store.rotate_server_secret(which)?;
            println!("Rotated {which:?} secret");
        }
        Command::Status => {
            println!("{}", serde_json::to_string_pretty(&store.status()?)?);
        }
        Command::Migrate => {
            let doc = store.migrate()?;
            println!("Store document is at schema version {}", doc.schema_version);
        }
        Command::Snapshot(SnapshotCommand::Create) => {
            let snapshot = store.create_snapshot(BackupKind::Manual)?;
            println!("Created {}", snapshot.filename);
        }
        Command::Snapshot(SnapshotCommand::List) => {
            for snapshot in store.list_snapshots()? {
                println!(
                    "{:<48} {:<14} {:>10} bytes",
                    snapshot.filename, snapshot.kind, snapshot.size
                );
            }
        }
        Command::Snapshot(SnapshotCommand::Restore { name }) => {
            let doc = store.restore_snapshot(&name)?;
            println!("Restored {name}: {} users", doc.users.len());
        }
        Command::Backup(BackupCommand::Create { description }) => {
            let record = BackupManager::for_store(&store).create_backup(&description.join(" "))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Backup(BackupCommand::List) => {
            for record in BackupManager::for_store(&store).list_backups()? {
                println!(
                    "{:<40} {:<14} v{:<4} {:>10} bytes  {}",
                    record.filename, record.kind, record.version, record.size, record.description
                );
            }
        }
        Command::Backup(BackupCommand::Restore { name }) => {
            let result = BackupManager::for_store(&store).restore_backup(&name)?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            for step in &result.manual_steps {
                eprintln!("manual step: {step}");
            }
        }
        Command::Backup(BackupCommand::Delete { name }) => {
            BackupManager::for_store(&store).delete_backup(&name)?;
            println!("Deleted {name}");
        }
        Command::Endpoints(EndpointsCommand::Show) => {
            let rotator = EndpointRotator::new(store.settings(), store.lock_handle());
            match rotator.current()? {
                Some(set) => println!("{}", serde_json::to_string_pretty(&set)?),
                None => println!("No endpoint set generated yet"),
            }
        }
        Command::Endpoints(EndpointsCommand::Rotate { force }) => {
            let rotator = EndpointRotator::new(store.settings(), store.lock_handle());
            let set = rotator.generate(force)?;
            if store.load()?.server.is_some() {
                store.set_obfuscated_endpoints(set.paths.clone())?;
            }
            println!("{}", serde_json::to_string_pretty(&set)?);
        }
        Command::Endpoints(EndpointsCommand::Validate) => {
            let rotator = EndpointRotator::new(store.settings(), store.lock_handle());
            let Some(set) = rotator.current()? else {
                bail!("no endpoint set to validate");
            };
            let errors = rotator.validation_errors(&set);
            if !errors.is_empty() {
                for error in &errors {
                    eprintln!("  {error}");
                }
                bail!("endpoint set has {} problem(s)", errors.len());
            }
            match rotator.age(&set) {
                Some(age) => println!("Endpoint set is valid ({} days old)", age.num_days()),
                None => println!("Endpoint set is valid"),
            }
        }
    }
    Ok(())
}
