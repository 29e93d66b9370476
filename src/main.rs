use anyhow::{Context, bail};
use azprofile::arm::ArmClient;
use azprofile::identity::AadClient;
use azprofile::profile::profile_path;
use azprofile::{
    Account, AuthenticationContext, CloudEnvironment, FileTokenCache, LoginMode, Profile,
    ServicePrincipalSecret,
};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "azp")]
#[command(author, version, about = "Azure account login and subscription profile", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and add the visible subscriptions to the profile
    Login {
        /// User name, or application id with --service-principal
        #[arg(short, long)]
        username: Option<String>,

        /// Password, or client secret with --service-principal
        #[arg(short, long)]
        password: Option<String>,

        /// Tenant to authenticate against (defaults to all tenants of the user)
        #[arg(long)]
        tenant: Option<String>,

        /// Log in as a service principal
        #[arg(long)]
        service_principal: bool,

        /// PEM file with the service principal certificate and private key
        #[arg(long, requires = "service_principal")]
        certificate_file: Option<PathBuf>,

        /// Hex thumbprint of the certificate
        #[arg(long, requires = "certificate_file")]
        thumbprint: Option<String>,

        /// Log in through the device code flow
        #[arg(long, conflicts_with_all = ["username", "password", "service_principal"])]
        interactive: bool,

        /// Import tokens from AZURE_CONSOLE_TOKENS
        #[arg(long, conflicts_with_all = ["username", "password", "service_principal", "interactive"])]
        cloud_console: bool,
    },

    /// Remove a user or service principal and its cached tokens
    Logout {
        /// User name or application id
        username: String,
    },

    /// Inspect and change the current subscriptions
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },
}

#[derive(Subcommand)]
enum AccountCommands {
    /// List subscriptions in the profile
    List,

    /// Set the default subscription
    Set {
        /// Subscription id or name
        subscription: String,
    },
}

struct LoginArgs {
    username: Option<String>,
    password: Option<String>,
    service_principal: bool,
    certificate_file: Option<PathBuf>,
    thumbprint: Option<String>,
    interactive: bool,
    cloud_console: bool,
}

fn login_mode(args: LoginArgs) -> anyhow::Result<LoginMode> {
    if args.cloud_console {
        return Ok(LoginMode::cloud_console_from_env()?);
    }
    if args.interactive {
        return Ok(LoginMode::Interactive);
    }

    if args.service_principal {
        let app_id = args
            .username
            .context("--username (the application id) is required with --service-principal")?;
        let secret = match (args.certificate_file, args.password) {
            (Some(file), _) => ServicePrincipalSecret::Certificate {
                file,
                thumbprint: args.thumbprint.context("--thumbprint is required with --certificate-file")?,
            },
            (None, Some(secret)) => ServicePrincipalSecret::Secret(secret),
            (None, None) => bail!("A service principal needs --password or --certificate-file"),
        };
        return Ok(LoginMode::ServicePrincipal { app_id, secret });
    }

    let Some(username) = args.username else {
        return Ok(LoginMode::Interactive);
    };

    let password = args.password.context("--password is required with --username")?;
    Ok(LoginMode::UsernamePassword { username, password })
}

fn build_context() -> anyhow::Result<AuthenticationContext> {
    let provider = AadClient::new()?;
    let cache = FileTokenCache::in_config_dir();
    tracing::debug!("Token cache at {}", cache.path().display());
    Ok(AuthenticationContext::new(Arc::new(provider), Arc::new(cache)))
}

async fn login(environment: CloudEnvironment, tenant: Option<String>, args: LoginArgs) -> anyhow::Result<()> {
    let mode = login_mode(args)?;
    let context = build_context()?;
    let arm = ArmClient::new(&environment.resource_manager_endpoint_url)?;
    let account = Account::new(environment, context, Arc::new(arm)).with_user_code_handler(|code| {
        println!("{} {}", "!".yellow().bold(), code.message);
    });

    let result = match account.load(tenant.as_deref(), mode).await {
        Ok(result) => result,
        Err(err) => {
            if err.warn_to_user_interactive() {
                eprintln!(
                    "{} This account needs an interactive login. Run {}",
                    "!".yellow().bold(),
                    "azp login --interactive".cyan()
                );
            }
            return Err(err.into());
        }
    };

    if result.subscriptions.is_empty() {
        println!(
            "{} No subscriptions found in {} tenant(s)",
            "!".yellow().bold(),
            result.tenant_ids.len()
        );
        return Ok(());
    }

    let path = profile_path();
    let mut profile = Profile::load(&path)?;
    for subscription in &result.subscriptions {
        println!(
            "{} Added subscription {} ({})",
            "✓".green(),
            subscription.name.bold(),
            subscription.id.dimmed()
        );
    }
    profile.add_subscriptions(result.subscriptions);
    profile.save(&path)?;

    if let Some(default) = profile.default_subscription() {
        println!("\nDefault subscription: {}", default.name.cyan());
    }
    Ok(())
}

async fn logout(username: &str) -> anyhow::Result<()> {
    let path = profile_path();
    let mut profile = Profile::load(&path)?;
    let context = build_context()?;

    let removed = profile.logout(username, &context).await?;
    profile.save(&path)?;
    println!(
        "{} Logged out {} ({} subscriptions removed)",
        "✓".green(),
        username.bold(),
        removed
    );
    Ok(())
}

fn list_accounts() -> anyhow::Result<()> {
    let profile = Profile::load(&profile_path())?;
    if profile.subscriptions.is_empty() {
        println!("No subscriptions found. Run {} to log in.", "azp login".cyan());
        return Ok(());
    }

    for subscription in &profile.subscriptions {
        let marker = if subscription.is_default { "*".green().bold() } else { " ".normal() };
        println!(
            "{} {}  {}  {}  {}",
            marker,
            subscription.name.bold(),
            subscription.id,
            subscription.state.dimmed(),
            subscription.user.name.dimmed()
        );
    }
    Ok(())
}

fn set_account(subscription: &str) -> anyhow::Result<()> {
    let path = profile_path();
    let mut profile = Profile::load(&path)?;
    profile.set_default(subscription)?;
    profile.save(&path)?;
    if let Some(default) = profile.default_subscription() {
        println!("{} Default subscription is now {}", "✓".green(), default.name.cyan());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let environment = CloudEnvironment::from_env()?;

    match cli.command {
        Some(Commands::Login {
            username,
            password,
            tenant,
            service_principal,
            certificate_file,
            thumbprint,
            interactive,
            cloud_console,
        }) => {
            let args = LoginArgs {
                username,
                password,
                service_principal,
                certificate_file,
                thumbprint,
                interactive,
                cloud_console,
            };
            login(environment, tenant, args).await?;
        }
        Some(Commands::Logout { username }) => {
            logout(&username).await?;
        }
        Some(Commands::Account { command }) => match command {
            AccountCommands::List => list_accounts()?,
            AccountCommands::Set { subscription } => set_account(&subscription)?,
        },
        None => {
            println!("Run {} to see available commands.", "azp --help".cyan());
        }
    }

    Ok(())
}
