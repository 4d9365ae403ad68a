//! Tally - serverless planning poker
//!
//! One participant's process relays the room; everyone else dials it with
//! the room code. The console reads commands from stdin and prints the room
//! whenever it changes. Logs go to stderr.

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tally_core::{SessionState, Settings};
use tally_net::RoomCode;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod cli;
mod console;
mod dispatch;
mod error;
mod session;
mod state;

use cli::{Cli, Command};
use console::Input;
use session::{CreateOptions, SessionEvent, SessionManager};
use state::AppState;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    info!("Starting Tally");

    let app = AppState::new(cli.config.as_deref(), cli.data_dir.clone())
        .context("Failed to initialize application")?;
    let ctx = app.session_context()?;

    let manager = match cli.command {
        Command::Create(args) => {
            let mut settings = app.config.session.settings();
            if args.auto_reveal {
                settings.auto_reveal = true;
            }
            if let Some(duration) = args.duration {
                settings.auto_reveal_duration = duration;
            }
            let options = CreateOptions {
                name: args.name,
                listen: args.listen,
                advertise: args.advertise,
                settings,
            };
            SessionManager::create_room(ctx, options)
                .await
                .context("Failed to create room")?
        }
        Command::Join(args) => {
            let code = RoomCode::parse(&args.room_code)?;
            SessionManager::join_room(ctx, code, args.name)
                .await
                .context("Failed to join room")?
        }
        Command::Resume => SessionManager::resume(ctx)
            .await
            .context("Failed to resume")?,
    };

    println!("Room code: {}", manager.snapshot().await.room_code);
    println!("{}", console::HELP);
    run_console(manager).await
}

async fn run_console(mut manager: SessionManager) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut shown: Option<SessionState> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    manager.dispose().await;
                    break;
                };
                match console::parse(&line) {
                    Ok(Some(Input::Quit)) => {
                        manager.dispose().await;
                        break;
                    }
                    Ok(Some(Input::Leave)) => {
                        manager.leave().await;
                        println!("Left the room");
                        break;
                    }
                    Ok(Some(Input::Status)) => print_room(&manager).await,
                    Ok(Some(input)) => {
                        if let Err(e) = handle_input(&manager, input).await {
                            println!("error: {:#}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(e) => println!("{}", e),
                }
            }
            event = manager.next_event() => {
                match event {
                    Some(SessionEvent::StateChanged) => {
                        let view = manager.snapshot().await;
                        if shown.as_ref() != Some(&view.state) {
                            print!("{}", console::render(&view, Utc::now()));
                            shown = Some(view.state);
                        }
                    }
                    Some(SessionEvent::ConnectionChanged(state)) => {
                        println!("connection: {:?}", state);
                    }
                    Some(SessionEvent::Failed(reason)) => println!("error: {}", reason),
                    None => {
                        warn!("Session ended");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                manager.dispose().await;
                break;
            }
        }
    }
    Ok(())
}

async fn handle_input(manager: &SessionManager, input: Input) -> Result<()> {
    match input {
        Input::Vote(card) => manager.vote(Some(card)).await?,
        Input::Unvote => manager.vote(None).await?,
        Input::Reveal => manager.reveal().await?,
        Input::Hide => manager.hide().await?,
        Input::Reset => manager.reset().await?,
        Input::Host(name) => {
            let view = manager.snapshot().await;
            let target = view
                .state
                .participant_by_name(&name)
                .map(|p| p.user_id)
                .with_context(|| format!("no participant named '{}'", name))?;
            manager.transfer_host_to(target).await?;
        }
        Input::AutoOn(secs) => {
            let current = manager.snapshot().await.state.settings;
            let settings = Settings {
                auto_reveal: true,
                auto_reveal_duration: secs.unwrap_or(current.auto_reveal_duration),
            };
            manager.update_settings(settings).await?;
        }
        Input::AutoOff => {
            let current = manager.snapshot().await.state.settings;
            let settings = Settings {
                auto_reveal: false,
                ..current
            };
            manager.update_settings(settings).await?;
        }
        Input::Reconnect => manager.reconnect().await?,
        Input::Status => print_room(manager).await,
        Input::Help => println!("{}", console::HELP),
        Input::Quit | Input::Leave => {}
    }
    Ok(())
}

async fn print_room(manager: &SessionManager) {
    let view = manager.snapshot().await;
    print!("{}", console::render(&view, Utc::now()));
}
