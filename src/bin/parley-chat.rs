//! Interactive chat client for the parley backend.
//!
//! This binary provides a streaming REPL over a [`SessionStore`]: every line you type is
//! sent on the current session and the reply is printed as it arrives.
//!
//! # Usage
//!
//! ```bash
//! # Talk to a backend on localhost
//! parley-chat
//!
//! # Point at another backend and keep sessions between runs
//! parley-chat --base-url https://chat.example.com/api/ --state-dir ~/.parley
//!
//! # Disable colors (useful for piping output)
//! parley-chat --no-color
//! ```
//!
//! # Commands
//!
//! While chatting, you can use slash commands:
//! - `/help` - Show available commands
//! - `/new` - Start a new session
//! - `/sessions` - List sessions
//! - `/select <n>` - Switch sessions
//! - `/quit` - Exit the application
//!
//! Press Ctrl-C while a reply is streaming to cancel it.

use std::env;
use std::sync::{Arc, Mutex, PoisonError};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use parley::chat::{
    ChatArgs, ChatCommand, FileStorage, MemoryStorage, SessionStore, StateStorage,
    TerminalObserver, format_config, format_sessions, format_transcript, help_text,
    parse_command,
};
use parley::{ChatClient, Error};

type Store = SessionStore<ChatClient>;

/// Main entry point for the parley-chat application.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(Level::WARN.into()))
        .with_writer(std::io::stderr)
        .init();

    let (args, _) = ChatArgs::from_command_line_relaxed("parley-chat [OPTIONS]");
    let use_color = !args.no_color;

    let base_url = args.base_url.clone().or_else(|| env::var("PARLEY_API_URL").ok());
    let client = ChatClient::with_options(base_url, args.timeout())?;
    let storage: Arc<dyn StateStorage> = match args.state_dir() {
        Some(dir) => Arc::new(FileStorage::new(dir)),
        None => Arc::new(MemoryStorage::new()),
    };
    let store = SessionStore::load(client, storage)?;
    if args.overrides_config() {
        store.update_config(|config| args.apply_to(config))?;
    }
    store.subscribe(Arc::new(TerminalObserver::new(use_color)));

    // Session whose reply is streaming, for the Ctrl-C handler.
    let active: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let handler_store = store.clone();
    let handler_active = Arc::clone(&active);
    ctrlc::set_handler(move || {
        let active = handler_active
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(session_id) = active.as_deref() {
            handler_store.cancel_turn(session_id);
        }
    })?;

    let session = store.current_session().await?;
    println!("parley chat ({})", store.transport().base_url());
    println!("Session: {}", session.topic);
    println!("Type /help for commands, /quit to exit\n");

    let mut rl = DefaultEditor::new()?;
    loop {
        let readline = rl.readline("You: ");

        match readline {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if let Some(cmd) = parse_command(line) {
                    if cmd == ChatCommand::Quit {
                        println!("Goodbye!");
                        break;
                    }
                    if let Err(err) = run_command(&store, cmd, use_color).await {
                        print_error(&err);
                    }
                    continue;
                }

                let session_id = match store.current_session().await {
                    Ok(session) => session.id,
                    Err(err) => {
                        print_error(&err);
                        continue;
                    }
                };
                *active.lock().unwrap_or_else(PoisonError::into_inner) = Some(session_id);
                println!("Assistant:");
                let result = store.on_user_input(line).await;
                *active.lock().unwrap_or_else(PoisonError::into_inner) = None;
                if let Err(err) = result {
                    print_error(&err);
                }
            }
            Err(ReadlineError::Interrupted) => {
                // Ctrl+C at prompt - soft interrupt
                println!();
                continue;
            }
            Err(ReadlineError::Eof) => {
                // Ctrl+D - exit
                println!("\nGoodbye!");
                break;
            }
            Err(err) => {
                eprintln!("Input error: {}", err);
                break;
            }
        }
    }

    if let Err(err) = store.save() {
        print_error(&err);
    }
    Ok(())
}

async fn run_command(store: &Store, cmd: ChatCommand, use_color: bool) -> Result<(), Error> {
    match cmd {
        ChatCommand::New => {
            store.new_session().await?;
            println!("Started a new session.");
        }
        ChatCommand::Delete(index) => {
            let index = index.unwrap_or_else(|| store.current_index());
            store.remove_session(index).await?;
            println!("Deleted session {index}.");
        }
        ChatCommand::Select(index) => {
            store.select_session(index)?;
            let session = store.current_session().await?;
            println!("Switched to: {}", session.topic);
        }
        ChatCommand::Sessions => {
            store.initialize().await?;
            print!(
                "{}",
                format_sessions(&store.sessions(), store.current_index(), use_color)
            );
        }
        ChatCommand::History => {
            let session = store.current_session().await?;
            println!("{}", format_transcript(&session, use_color));
        }
        ChatCommand::ShowConfig => {
            println!("{}", format_config(&store.config()));
        }
        ChatCommand::SetHistory(count) => {
            store.update_config(|config| config.history_message_count = count)?;
            println!("history_message_count set to {count}");
        }
        ChatCommand::SetCompress(threshold) => {
            store.update_config(|config| config.compress_message_length_threshold = threshold)?;
            println!("compress_message_length_threshold set to {threshold}");
        }
        ChatCommand::ResetConfig => {
            store.reset_config();
            println!("Configuration reset to defaults.");
        }
        ChatCommand::Summarize => {
            store.summarize_session().await?;
            let session = store.current_session().await?;
            println!("Topic: {}", session.topic);
            if !session.memory_prompt.is_empty() {
                println!("Memory: {}", session.memory_prompt);
            }
        }
        ChatCommand::ClearAll => {
            store.clear_all_data()?;
            println!("All sessions and preferences cleared.");
        }
        ChatCommand::Help => {
            for line in help_text().lines() {
                println!("    {}", line);
            }
        }
        ChatCommand::Quit => {}
        ChatCommand::Invalid(message) => {
            eprintln!("{message}");
        }
    }
    Ok(())
}

fn print_error(err: &Error) {
    eprintln!("\nError: {err}");
}
