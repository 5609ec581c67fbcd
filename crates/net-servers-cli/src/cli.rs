use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "net-servers")]
#[command(about = "Declarative control plane for the net-servers container fleet", long_about = None)]
pub struct Cli {
    /// Render structured JSON instead of human-readable output
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage deployment environments
    Environments {
        #[command(subcommand)]
        command: EnvironmentCommands,
    },
    /// Manage service containers
    Container {
        #[command(subcommand)]
        command: ContainerCommands,
    },
    /// Manage configuration documents and projections
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Manage TLS certificates
    Certificates {
        #[command(subcommand)]
        command: CertificateCommands,
    },
}

#[derive(Subcommand)]
pub enum EnvironmentCommands {
    /// List every registered environment
    List,
    /// Show the current environment
    Current,
    /// Register a new environment
    Add {
        name: String,
        /// Root directory for the environment's config, state and logs
        #[arg(long)]
        base_path: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "local.dev")]
        domain: String,
        #[arg(long, default_value = "admin@local.dev")]
        admin_email: String,
        /// none, self_signed or acme
        #[arg(long, default_value = "self_signed")]
        certificate_mode: String,
        #[arg(long)]
        tag: Vec<String>,
    },
    /// Remove an environment (not the current or last enabled one)
    Remove { name: String },
    /// Enable an environment
    Enable { name: String },
    /// Disable an environment
    Disable { name: String },
    /// Make an environment current
    Switch { name: String },
    /// Show one environment in detail
    Info { name: String },
    /// Validate the registry, including base-path conflicts
    Validate,
    /// Create a fresh environment registry
    Init {
        /// Overwrite an existing registry
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
pub enum ContainerCommands {
    /// Build a service image
    Build {
        service: String,
        /// Rebuild without the layer cache
        #[arg(long)]
        rebuild: bool,
    },
    /// Start a service container
    Run {
        service: String,
        /// Start even when a wanted host port is bound by an unrelated process
        #[arg(long)]
        force_port: bool,
    },
    /// Stop a service container
    Stop { service: String },
    /// Remove a service container
    Remove {
        service: String,
        #[arg(long)]
        force: bool,
    },
    /// Show container logs
    Logs {
        service: String,
        #[arg(long)]
        tail: Option<u32>,
    },
    /// List managed containers
    List,
    /// Smoke-test a running container
    Test { service: String },
    /// Build every service image
    BuildAll {
        #[arg(long)]
        rebuild: bool,
    },
    /// Start every configured service
    StartAll {
        #[arg(long)]
        force_port: bool,
    },
    /// Stop every configured service
    StopAll,
    /// Remove every configured service container
    RemoveAll {
        #[arg(long)]
        force: bool,
    },
    /// Stop and remove every container and image
    CleanAll,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Write default configuration files for the current environment
    Init,
    /// Validate every configuration document
    Validate,
    /// Reconcile every synchronizer once
    Sync {
        /// Compute and print the diff without touching disk
        #[arg(long)]
        dry_run: bool,
        /// Write projections but skip container reloads
        #[arg(long)]
        skip_reload: bool,
    },
    /// Watch the config directory and reconcile on change
    Watch {
        /// Debounce window in milliseconds
        #[arg(long, default_value_t = 250)]
        debounce_ms: u64,
        #[arg(long)]
        skip_reload: bool,
    },
    /// Manage users
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Manage domains
    Domain {
        #[command(subcommand)]
        command: DomainCommands,
    },
}

#[derive(Subcommand)]
pub enum UserCommands {
    /// Add a user and synchronize the projections
    Add {
        username: String,
        #[arg(long)]
        email: String,
        /// Domains the user belongs to (repeatable)
        #[arg(long, required = true)]
        domain: Vec<String>,
        #[arg(long)]
        role: Vec<String>,
        #[arg(long, default_value = "500M")]
        quota: String,
        /// Initial password, stored in secrets.yaml
        #[arg(long)]
        password: Option<String>,
    },
    /// List users
    List,
    /// Delete a user and their projections
    Delete { username: String },
    /// Set a user's password in secrets.yaml
    SetPassword {
        username: String,
        #[arg(long)]
        password: String,
    },
}

#[derive(Subcommand)]
pub enum DomainCommands {
    /// Add a domain
    Add {
        name: String,
        /// MX target short names (repeatable, ordered)
        #[arg(long)]
        mx: Vec<String>,
        /// A records as short=ipv4 (repeatable)
        #[arg(long)]
        a: Vec<String>,
        /// none, self_signed or acme
        #[arg(long, default_value = "self_signed")]
        certificate_mode: String,
    },
    /// List domains
    List,
}

#[derive(Subcommand)]
pub enum CertificateCommands {
    /// List certificates with their validity
    List,
    /// Show one certificate's metadata
    Info { domain: String },
    /// Issue a self-signed certificate
    ProvisionSelfSigned {
        domain: String,
        #[arg(long)]
        force: bool,
    },
    /// Order a certificate from the configured ACME directory
    ProvisionAcme {
        domain: String,
        #[arg(long)]
        force: bool,
    },
}
