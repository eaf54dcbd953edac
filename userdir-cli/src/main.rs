mod cli;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use userdir::{
    AdConfig, Bind, Config, DirectoryConfig, DirectoryError, LdapDirectoryConfig, OpenLdapConfig,
    PrincipalSearchType, TlsMode, UserDirectory,
};

use cli::{Cli, Command, DirectoryKind};

const VALIDATION_FAILED: &str = "Invalid user name or password";

fn directory_for(kind: DirectoryKind) -> DirectoryConfig {
    match kind {
        DirectoryKind::ActiveDirectory => DirectoryConfig::ActiveDirectory(AdConfig::default()),
        DirectoryKind::Ldap => DirectoryConfig::Ldap(LdapDirectoryConfig::default()),
        DirectoryKind::OpenLdap => DirectoryConfig::OpenLdap(OpenLdapConfig::default()),
    }
}

fn load_config(args: &Cli) -> Result<Config> {
    let mut config: Config = if let Some(path) = &args.config {
        let file = String::from_utf8(std::fs::read(path)?)?;
        toml::from_str(&file)?
    } else {
        Config {
            timeout_seconds: 30,
            backend: Default::default(),
            credentials: Default::default(),
            directory: directory_for(args.kind),
        }
    };

    if let Some(timeout_seconds) = args.timeout_seconds {
        config.timeout_seconds = timeout_seconds;
    }

    if let Some(backend) = args.backend {
        config.backend = backend.into();
    }

    let connection = config.directory.connection_mut();

    if let Some(host) = &args.host {
        connection.host = Some(host.clone());
    }

    if let Some(port) = args.port {
        connection.port = Some(port);
    }

    if args.tls {
        connection.tls = TlsMode::Tls;
    }

    if args.skip_cert_verification {
        connection.tls = TlsMode::TlsNoVerify;
    }

    if let Some(dn) = &args.binddn {
        let pass = args
            .bindpass
            .clone()
            .ok_or_else(|| anyhow!("--binddn needs --bindpass"))?;
        connection.bind = Some(Bind {
            dn: dn.clone(),
            pass,
        });
    }

    if let Some(basedn) = &args.basedn {
        match &mut config.directory {
            DirectoryConfig::Ldap(ldap) => ldap.base_dn = Some(basedn.clone()),
            DirectoryConfig::OpenLdap(openldap) => {
                openldap.users_base_dn = Some(basedn.clone());
                openldap.groups_base_dn = Some(basedn.clone());
            }
            DirectoryConfig::ActiveDirectory(_) => tracing::warn!(
                "Active Directory derives search bases from domains, ignoring --basedn"
            ),
        }
    }

    Ok(config)
}

fn print(value: serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

async fn run(directory: &dyn UserDirectory, command: Command) -> Result<()> {
    match command {
        Command::Find(find) => {
            let search_type = if find.users {
                PrincipalSearchType::Users
            } else if find.groups {
                PrincipalSearchType::Groups
            } else {
                PrincipalSearchType::UsersAndGroups
            };
            let found = directory.find_principals(&find.term, search_type).await?;
            tracing::info!("Found {} principals", found.len());
            print(json!(found.iter().map(|p| p.summary()).collect::<Vec<_>>()))
        }
        Command::User { name } => match directory.try_get_user(&name).await? {
            Some(user) => print(json!(user.summary())),
            None => bail!("No user {name}"),
        },
        Command::Group { name } => match directory.try_get_group(&name).await? {
            Some(group) => print(json!(group.summary())),
            None => bail!("No group {name}"),
        },
        Command::Groups { name } => {
            let Some(user) = directory.try_get_user(&name).await? else {
                bail!("No user {name}");
            };
            let mut groups = user
                .groups()
                .await
                .iter()
                .map(|group| group.full_name())
                .collect::<Vec<_>>();
            groups.sort_by_key(|name| name.to_lowercase());
            print(json!({ "user": user.name(), "groups": groups }))
        }
        Command::Validate(validate) => {
            match directory
                .try_get_and_validate_user(&validate.name, &validate.password)
                .await
            {
                Ok(Some(user)) => print(json!({ "user": user.name(), "valid": true })),
                Ok(None) => {
                    tracing::debug!("No user {}", validate.name);
                    bail!(VALIDATION_FAILED)
                }
                Err(DirectoryError::Authentication(detail)) => {
                    tracing::debug!("{detail}");
                    bail!(VALIDATION_FAILED)
                }
                Err(error) => Err(error.into()),
            }
        }
        Command::Members { group } => {
            let members = directory.get_group_members(&group).await?;
            print(json!(members.iter().map(|m| m.summary()).collect::<Vec<_>>()))
        }
        Command::ParseLogon { logon } => match directory.parse_logon_name(&logon) {
            Some(id) => print(json!({
                "principal": id.principal(),
                "domain": id.domain_alias(),
                "name": id.full_name(),
            })),
            None => bail!("Cannot parse logon name {logon:?}"),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = load_config(&args)?;
    tracing::debug!("Using {:?}", config.directory);

    let cancel_token = CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to register ctrl-c handler: {}", e);
            return;
        };
        tracing::info!("Received ctrl-c");
        ctrl_c_token.cancel();
    });

    let directory = config.build(cancel_token)?;
    run(directory.as_ref(), args.command).await
}
