use crate::chat_info::{self, room_capabilities};
use crate::config::Config;
use crate::host::spawn_login;
use crate::ids::{ChatId, LoginId, UserId};
use crate::login::{self, LoginInput};
use crate::store::BridgeStore;
use crate::zulip::ZulipClient;
use colored::*;
use tokio::signal;
use tracing::{error, info};

/// Entry point shared by the `zulink` binary. `args` includes the program name.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("zulink")
        .to_string();

    let (config, positionals) = Config::from_args(args.get(1..).unwrap_or_default())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = positionals.first() else {
        print_usage(&bin);
        return Ok(());
    };
    let rest = &positionals[1..];

    match command.as_str() {
        "run" => run_bridge(&config).await?,
        "login" => {
            if rest.len() < 3 {
                eprintln!(
                    "{}",
                    format!("Usage: {} login <server_url> <email> <api_key> [host_user]", bin)
                        .yellow()
                );
                return Ok(());
            }
            let input = LoginInput {
                url: rest[0].clone(),
                email: rest[1].clone(),
                token: rest[2].clone(),
            };
            login_command(&config, &input, rest.get(3).cloned()).await?;
        }
        "logins" => list_logins(&config)?,
        "logout" => {
            let Some(login) = rest.first() else {
                eprintln!("{}", format!("Usage: {} logout <login_id>", bin).yellow());
                return Ok(());
            };
            logout(&config, login.parse()?)?;
        }
        "chat-info" => {
            if rest.len() < 2 {
                eprintln!(
                    "{}",
                    format!("Usage: {} chat-info <login_id> <chat_id>", bin).yellow()
                );
                return Ok(());
            }
            show_chat_info(&config, rest[0].parse()?, &rest[1].parse()?).await?;
        }
        "user-info" => {
            if rest.len() < 2 {
                eprintln!(
                    "{}",
                    format!("Usage: {} user-info <login_id> <user_id>", bin).yellow()
                );
                return Ok(());
            }
            show_user_info(&config, rest[0].parse()?, rest[1].parse()?).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "⚡ zulink".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} <command> [args] [flags]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                                   Poll all logins until Ctrl+C", "run".cyan());
    println!(
        "  {} <url> <email> <key> [host_user]  Log in with an API key",
        "login".cyan()
    );
    println!("  {}                                List stored logins", "logins".cyan());
    println!("  {} <login_id>                     Forget a login", "logout".cyan());
    println!(
        "  {} <login_id> <chat_id>         Show chat metadata",
        "chat-info".cyan()
    );
    println!(
        "  {} <login_id> <user_id>         Show user metadata",
        "user-info".cyan()
    );
    println!();
    println!("{}", "Flags:".bright_white().bold());
    println!("  --data-dir <path>  --retry-interval <secs>  --http-timeout <secs>");
    println!("  --media-timeout <secs>  --stop-timeout <secs>  --split-portals  --ghost-domain <name>");
}

fn open_store(config: &Config) -> anyhow::Result<BridgeStore> {
    std::fs::create_dir_all(&config.data_dir)?;
    BridgeStore::new(&config.data_dir).map_err(|e| anyhow::anyhow!("{}", e))
}

fn client_for(store: &BridgeStore, config: &Config, login: LoginId) -> anyhow::Result<ZulipClient> {
    let meta = store
        .get_login(login)?
        .ok_or_else(|| anyhow::anyhow!("No login with id {}", login))?;
    Ok(ZulipClient::new(
        meta.credentials(),
        config.http_timeout,
        config.media_timeout,
    )?)
}

async fn run_bridge(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let logins = store.list_logins()?;
    if logins.is_empty() {
        println!("{}", "No logins stored, use `login` first".yellow());
        return Ok(());
    }

    let mut supervisors = Vec::with_capacity(logins.len());
    for (login, meta) in &logins {
        match spawn_login(config, &store, *login, meta) {
            Ok(supervisor) => supervisors.push(supervisor),
            Err(e) => error!("Failed to start login {}: {}", login, e),
        }
    }
    info!("Bridging {} login(s)", supervisors.len());

    wait_for_shutdown().await;
    info!("Shutdown signal received, stopping polls...");

    for supervisor in &supervisors {
        supervisor.cancel();
    }
    for supervisor in &supervisors {
        let exit = supervisor.stop(config.stop_timeout).await;
        info!("Login {} stopped: {:?}", supervisor.login(), exit);
    }
    store.flush()?;
    info!("Bridge stopped");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Ctrl+C received");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("SIGTERM received");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn login_command(
    config: &Config,
    input: &LoginInput,
    host_user: Option<String>,
) -> anyhow::Result<()> {
    let store = open_store(config)?;
    match login::login(&store, input, host_user, config.http_timeout).await {
        Ok(outcome) => {
            store.flush()?;
            println!(
                "{} {} (login id {})",
                "✓".green().bold(),
                outcome.message(),
                outcome.login.to_string().cyan()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("{} Login failed: {}", "✗".red().bold(), e.to_string().red());
            Err(e.into())
        }
    }
}

fn list_logins(config: &Config) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let logins = store.list_logins()?;
    if logins.is_empty() {
        println!("{}", "No logins stored".yellow());
        return Ok(());
    }
    println!(
        "{}",
        format!("Logins ({})", logins.len()).bright_cyan().bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for (login, meta) in logins {
        let queue = match meta.queue_state() {
            Some(state) => format!("queue {} @ {}", state.queue_id, state.last_event_id).green(),
            None => "no queue".to_string().yellow(),
        };
        println!(
            "  {} {} <{}> @ {} [{}]",
            login.to_string().cyan(),
            meta.full_name,
            meta.email,
            meta.url.green(),
            queue
        );
    }
    Ok(())
}

fn logout(config: &Config, login: LoginId) -> anyhow::Result<()> {
    let store = open_store(config)?;
    if store.remove_login(login)? {
        store.flush()?;
        println!("{} Removed login {}", "✓".green().bold(), login.to_string().cyan());
    } else {
        eprintln!("{} No login with id {}", "✗".red().bold(), login.to_string().red());
    }
    Ok(())
}

async fn show_chat_info(config: &Config, login: LoginId, chat: &ChatId) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let client = client_for(&store, config, login)?;
    let info = chat_info::fetch_chat_info(&client, login, chat).await?;
    let out = serde_json::json!({
        "chat": chat,
        "info": info,
        "capabilities": room_capabilities(chat),
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

async fn show_user_info(config: &Config, login: LoginId, user: UserId) -> anyhow::Result<()> {
    let store = open_store(config)?;
    let client = client_for(&store, config, login)?;
    let info = chat_info::fetch_user_info(&client, user).await?;
    println!("{}", serde_json::to_string_pretty(&info)?);
    Ok(())
}
