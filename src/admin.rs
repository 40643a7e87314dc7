use crate::auth::{CredentialStore, PgCredentialStore};
use crate::secret::{self, SecretDeriver};
use crate::settings::{Backend, Settings};
use clap::Subcommand;

/// Administration of the user table: the provisioning and reset side that
/// the verifier itself never performs.
#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Create a user with no password. The first login binds one.
    AddUser {
        /// Username of the new record.
        username: String,
        /// Permissions token returned to the host.
        #[clap(long, default_value = "read")]
        permissions: String,
    },
    /// Prompt for a password and store it, replacing any existing one.
    SetPassword {
        /// Username of the record.
        username: String,
    },
    /// Clear the password so the next login binds a new one.
    ResetPassword {
        /// Username of the record.
        username: String,
    },
    /// Delete a user.
    RemoveUser {
        /// Username of the record.
        username: String,
    },
    /// Print a user and whether a password is bound.
    Show {
        /// Username of the record.
        username: String,
    },
}

/// Executes `command` against the store. `password` is only read by
/// `SetPassword`. Returns the line to report to the operator.
pub async fn apply(
    command: &AdminCommand,
    store: &dyn CredentialStore,
    deriver: &dyn SecretDeriver,
    password: Option<&str>,
) -> anyhow::Result<String> {
    match command {
        AdminCommand::AddUser {
            username,
            permissions,
        } => {
            if username.is_empty() {
                anyhow::bail!("username cannot be empty");
            }
            store.insert_user(username, permissions).await?;
            Ok(format!("created {} with permissions {}", username, permissions))
        }
        AdminCommand::SetPassword { username } => {
            let password =
                password.ok_or_else(|| anyhow::anyhow!("a password is required"))?;
            let secret = deriver.derive(password).await?;
            if !store.set_secret(username, Some(&secret)).await? {
                anyhow::bail!("no such user {}", username);
            }
            Ok(format!("password set for {}", username))
        }
        AdminCommand::ResetPassword { username } => {
            if !store.set_secret(username, None).await? {
                anyhow::bail!("no such user {}", username);
            }
            Ok(format!("password cleared for {}", username))
        }
        AdminCommand::RemoveUser { username } => {
            if !store.remove_user(username).await? {
                anyhow::bail!("no such user {}", username);
            }
            Ok(format!("removed {}", username))
        }
        AdminCommand::Show { username } => match store.find(username).await? {
            Some(record) => Ok(format!(
                "{} permissions={} password={}",
                record.username,
                record.permissions,
                if record.password.is_some() {
                    "set"
                } else {
                    "unset"
                }
            )),
            None => anyhow::bail!("no such user {}", username),
        },
    }
}

/// Reads a password twice from the terminal without echo.
pub fn prompt_password(username: &str) -> anyhow::Result<String> {
    let password = rpassword::prompt_password(format!("Password for {}: ", username))?;
    let confirm = rpassword::prompt_password("Repeat password: ")?;
    if password != confirm {
        anyhow::bail!("passwords do not match");
    }
    Ok(password)
}

/// Connects to the configured database and runs one admin command.
pub async fn run_admin(command: AdminCommand, settings: &Settings) -> anyhow::Result<()> {
    if settings.database.backend != Backend::Postgres {
        anyhow::bail!("administration needs the postgres backend");
    }
    let password = match &command {
        AdminCommand::SetPassword { username } => Some(prompt_password(username)?),
        _ => None,
    };

    let store = PgCredentialStore::connect(&settings.database).await?;
    let deriver = secret::from_settings(&settings.secret)?;
    let res = apply(&command, &store, &*deriver, password.as_deref()).await;
    store.close().await;

    println!("{}", res?);
    Ok(())
}
