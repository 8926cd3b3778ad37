//! Timer-rooms command line client: account session, checkout confirmation, and live room view.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use timer_rooms_client::{
    config::AppConfig,
    dao::token_store::FileTokenStore,
    dto::auth::{LoginForm, RegisterForm},
    error::FormError,
    services::{
        api_client::ApiClient,
        auth_reconciler::watch_invalidations,
        checkout_poller::{CheckoutOutcome, CheckoutPoller, CheckoutRequest, CheckoutUpdate},
        room_connection::{ConnectOptions, RoomAccess, RoomConnection},
        ws_transport::WebSocketTransport,
    },
    state::{Notice, SessionManager, SharedSession, connection::ConnectionState},
};

/// How often the token file is checked for changes made by other processes.
const TOKEN_WATCH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Parser)]
#[command(name = "timer-rooms", version, about = "Timer rooms client")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Sign in with email and password.
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// Create an account.
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        name: String,
    },
    /// End the session and remove the stored token.
    Logout,
    /// Show the signed-in user.
    Whoami,
    /// Follow a room's timers live until interrupted.
    WatchRoom {
        room_id: String,
        #[arg(long, conflicts_with = "viewer_token")]
        controller_token: Option<String>,
        #[arg(long)]
        viewer_token: Option<String>,
    },
    /// Wait for a subscription to become active after paying.
    Checkout {
        /// Redirect URL handed back by the payment provider.
        #[arg(long, conflicts_with_all = ["session_id", "return_url"])]
        redirect_url: Option<String>,
        #[arg(long)]
        session_id: Option<String>,
        #[arg(long)]
        return_url: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = AppConfig::load();

    let store = FileTokenStore::new(config.token_path.clone());
    let token_watcher = store.spawn_watcher(TOKEN_WATCH_INTERVAL);
    let session = SessionManager::new(Arc::new(store));
    session
        .restore()
        .await
        .context("restoring stored session token")?;
    let invalidations = watch_invalidations(session.clone());
    let mut notices = session.notices().subscribe();

    let client = ApiClient::new(&config.api_base_url, session.clone(), &config.auth)
        .context("building API client")?;

    let result = run(cli.command, &config, &session, &client).await;

    flush_notices(&mut notices);
    invalidations.abort();
    token_watcher.abort();
    session.teardown();
    result
}

async fn run(
    command: Command,
    config: &AppConfig,
    session: &SharedSession,
    client: &ApiClient,
) -> anyhow::Result<()> {
    match command {
        Command::Login { email, password } => {
            let profile = client
                .login(&LoginForm { email, password })
                .await
                .map_err(form_failure)?;
            println!("logged in as {} (id {})", profile.email, profile.id);
        }
        Command::Register {
            email,
            password,
            name,
        } => {
            let profile = client
                .register(&RegisterForm {
                    email,
                    password,
                    full_name: name,
                })
                .await
                .map_err(form_failure)?;
            println!("registered {}; log in to continue", profile.email);
        }
        Command::Logout => {
            if let Err(err) = client.logout().await {
                warn!(error = %err, "logout request failed");
            }
            println!("logged out");
        }
        Command::Whoami => {
            if session.token().await.is_none() {
                println!("not logged in");
                return Ok(());
            }
            let profile = client.me().await.context("fetching profile")?;
            match profile.full_name {
                Some(name) => println!("{name} <{}> (id {})", profile.email, profile.id),
                None => println!("{} (id {})", profile.email, profile.id),
            }
        }
        Command::WatchRoom {
            room_id,
            controller_token,
            viewer_token,
        } => {
            let access = match (controller_token, viewer_token) {
                (Some(token), _) => RoomAccess::Controller(token),
                (None, Some(token)) => RoomAccess::Viewer(token),
                (None, None) => {
                    let token = session
                        .token()
                        .await
                        .ok_or_else(|| anyhow!("not logged in; pass a room token or log in first"))?;
                    RoomAccess::Session(token.as_str().to_owned())
                }
            };
            watch_room(config, room_id, access).await?;
        }
        Command::Checkout {
            redirect_url,
            session_id,
            return_url,
        } => {
            let request = match redirect_url {
                Some(url) => CheckoutRequest::from_redirect(&url, &config.checkout)
                    .context("reading checkout redirect")?,
                None => CheckoutRequest::new(
                    session_id,
                    return_url.unwrap_or_else(|| config.checkout.default_return_url.clone()),
                ),
            };
            confirm_checkout(config, session, client, request).await?;
        }
    }
    Ok(())
}

async fn watch_room(config: &AppConfig, room_id: String, access: RoomAccess) -> anyhow::Result<()> {
    let transport =
        WebSocketTransport::from_api_base(&config.api_base_url).context("preparing room socket")?;
    let room = RoomConnection::new(Arc::new(transport), access);
    let mut updates = WatchStream::new(room.subscribe());

    tokio::select! {
        result = room.connect(room_id.clone(), ConnectOptions::from(&config.room)) => {
            result.with_context(|| format!("connecting to room {room_id}"))?;
        }
        _ = tokio::signal::ctrl_c() => {
            room.disconnect();
            return Ok(());
        }
    }

    loop {
        tokio::select! {
            snapshot = updates.next() => {
                let Some(snapshot) = snapshot else { break };
                info!(
                    state = ?snapshot.state,
                    timers = snapshot.timers.len(),
                    displays = snapshot.displays.len(),
                    connections = snapshot.connection_count(),
                    "room updated"
                );
                for timer in snapshot.timers.values() {
                    debug!(
                        id = %timer.id,
                        name = %timer.name,
                        status = ?timer.status,
                        remaining_ms = timer.remaining_ms,
                        "timer"
                    );
                }
                if snapshot.state == ConnectionState::Error {
                    room.disconnect();
                    bail!(
                        "lost room {room_id}: {}",
                        snapshot.last_error.as_deref().unwrap_or("unknown error")
                    );
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; leaving room");
                break;
            }
        }
    }

    room.disconnect();
    Ok(())
}

async fn confirm_checkout(
    config: &AppConfig,
    session: &SharedSession,
    client: &ApiClient,
    request: CheckoutRequest,
) -> anyhow::Result<()> {
    let poller = CheckoutPoller::new(
        Arc::new(client.clone()),
        config.checkout.clone(),
        session.notices().clone(),
    );
    let mut handle = poller.spawn(request);

    loop {
        tokio::select! {
            update = handle.next_update() => match update {
                Some(CheckoutUpdate::Polling { attempt }) => {
                    info!(attempt, max = config.checkout.max_attempts, "checking subscription status");
                }
                Some(CheckoutUpdate::Redirect(url)) => println!("continue at {url}"),
                Some(other) => debug!(update = ?other, "checkout update"),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                handle.cancel();
                bail!("checkout confirmation interrupted");
            }
        }
    }

    match handle.outcome().await {
        Some(CheckoutOutcome::Succeeded { subscription_id }) => {
            println!("subscription {subscription_id} is active");
            Ok(())
        }
        Some(CheckoutOutcome::Pending) => {
            println!("payment still processing; check again shortly");
            Ok(())
        }
        Some(CheckoutOutcome::Failed) => bail!("could not confirm the subscription"),
        None => bail!("checkout polling stopped unexpectedly"),
    }
}

/// Log field errors individually before handing the failure to `anyhow`.
fn form_failure(err: FormError) -> anyhow::Error {
    if let FormError::Fields(fields) = &err {
        for (field, messages) in fields {
            for message in messages {
                error!(%field, %message, "invalid field");
            }
        }
    }
    anyhow!(err)
}

fn flush_notices(notices: &mut broadcast::Receiver<Notice>) {
    loop {
        match notices.try_recv() {
            Ok(Notice::Success(message)) => info!(%message, "notice"),
            Ok(Notice::Info(message)) => info!(%message, "notice"),
            Ok(Notice::Error(message)) => error!(%message, "notice"),
            Err(TryRecvError::Lagged(skipped)) => warn!(skipped, "notices dropped"),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,timer_rooms_client=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
