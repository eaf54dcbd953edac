use std::path::PathBuf;

use clap::{ArgGroup, Args, Parser, Subcommand, ValueEnum};
use userdir::ClientBackend;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum DirectoryKind {
    ActiveDirectory,
    Ldap,
    OpenLdap,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendArg {
    Auto,
    Async,
    Blocking,
}

impl From<BackendArg> for ClientBackend {
    fn from(value: BackendArg) -> Self {
        match value {
            BackendArg::Auto => ClientBackend::Auto,
            BackendArg::Async => ClientBackend::Async,
            BackendArg::Blocking => ClientBackend::Blocking,
        }
    }
}

#[derive(Args, Clone, Debug)]
#[clap(group = ArgGroup::new("only").multiple(false))]
pub struct Find {
    /// Name prefix, optionally scoped with `@domain`
    pub term: String,

    /// Only users
    #[clap(group = "only")]
    #[arg(short, long, default_value_t = false)]
    pub users: bool,

    /// Only groups
    #[clap(group = "only")]
    #[arg(short, long, default_value_t = false)]
    pub groups: bool,
}

#[derive(Args, Clone, Debug)]
pub struct Validate {
    pub name: String,

    #[arg(short, long, env = "USERDIR_PASSWORD", hide_env_values = true)]
    pub password: String,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Search users and groups by name prefix
    Find(Find),
    /// Look up one user
    User { name: String },
    /// Look up one group
    Group { name: String },
    /// List every group a user belongs to
    Groups { name: String },
    /// Check a user's password
    Validate(Validate),
    /// List the users of a group
    Members { group: String },
    /// Turn `DOMAIN\user` or `user@domain` into a principal name
    ParseLogon { logon: String },
}

/// Query LDAP, OpenLDAP and Active Directory user directories
#[derive(Parser, Clone, Debug)]
#[clap(group(ArgGroup::new("bind").requires_all(["binddn", "bindpass"]).multiple(true)))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file
    #[clap(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Directory kind when no configuration file is given
    #[clap(short = 'k', long, value_enum, default_value_t = DirectoryKind::Ldap)]
    pub kind: DirectoryKind,

    #[clap(short = 'H', long)]
    pub host: Option<String>,

    #[clap(short = 'p', long)]
    pub port: Option<u16>,

    /// Use LDAPS
    #[clap(short = 'S', long, default_value_t = false)]
    pub tls: bool,

    /// Disable TLS cert verification
    #[clap(short = 'C', long, default_value_t = false)]
    pub skip_cert_verification: bool,

    #[clap(short = 'D', long)]
    #[clap(group = "bind")]
    pub binddn: Option<String>,

    #[clap(short = 'w', long, env = "USERDIR_BIND_PASSWORD", hide_env_values = true)]
    #[clap(group = "bind")]
    pub bindpass: Option<String>,

    /// Search base. For OpenLDAP both users and groups live below it
    #[clap(short = 'b', long)]
    pub basedn: Option<String>,

    /// Per-call timeout
    #[clap(short = 'T', long)]
    pub timeout_seconds: Option<u64>,

    #[clap(long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Debug logging. RUST_LOG takes precedence
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn find_accepts_one_kind_filter() {
        let cli = Cli::try_parse_from(["userdir", "find", "jd", "--users"]).unwrap();
        assert!(matches!(cli.command, Command::Find(Find { users: true, groups: false, .. })));

        assert!(Cli::try_parse_from(["userdir", "find", "jd", "--users", "--groups"]).is_err());
    }

    #[test]
    fn bind_needs_dn_and_password() {
        assert!(Cli::try_parse_from(["userdir", "-D", "cn=reader", "user", "jdoe"]).is_err());

        let cli = Cli::try_parse_from([
            "userdir", "-H", "dc1.corp", "-D", "cn=reader", "-w", "pw", "-k", "active-directory",
            "user", "jdoe",
        ])
        .unwrap();
        assert_eq!(cli.kind, DirectoryKind::ActiveDirectory);
        assert_eq!(cli.host.as_deref(), Some("dc1.corp"));
    }
}
