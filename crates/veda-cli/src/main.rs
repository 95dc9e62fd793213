use std::io::Write;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;
use tokio::io::{AsyncBufReadExt, BufReader};
use veda_core::config::{self, VedaConfig};
use veda_core::conversation::ConversationSnapshot;
use veda_core::model::{expand_history, Message, Role};
use veda_core::orchestrator::{ChatOrchestrator, SendOutcome, SEND_FAILED_MESSAGE};
use veda_core::transport::{ChatBackend, HttpTransport, SessionContext};

#[derive(Parser)]
#[command(name = "veda", about = "Veda: chat with your assistant from the terminal", version)]
enum Cli {
    /// Sign in and print the issued token
    Login {
        #[arg(long)]
        email: String,
        #[arg(long)]
        password: String,
    },
    /// List your chat sessions, newest first
    Sessions {
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the messages of one session
    History {
        /// Session ID
        id: String,
        /// Output raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Send one message and stream the reply to stdout
    Send {
        /// Message text
        message: String,
        /// Continue this session instead of starting a new one
        #[arg(short, long)]
        session: Option<String>,
    },
    /// Interactive chat (/new, /open ID, /sessions, /quit)
    Chat {
        /// Session to open on start
        #[arg(short, long)]
        session: Option<String>,
    },
}

type Orchestrator = ChatOrchestrator<HttpTransport>;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("veda=warn")),
        )
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let cli = Cli::parse();
    let config = VedaConfig::load(Some(&std::env::current_dir()?)).unwrap_or_else(|e| {
        tracing::warn!("config: {e}, using defaults");
        VedaConfig::default_config()
    });

    let transport = make_transport(&config)?;
    run(cli, transport, &config).await
}

fn make_transport(config: &VedaConfig) -> Result<HttpTransport> {
    let context = SessionContext::new(config::resolve_token(&config.auth))
        .with_unauthorized_handler(|| {
            eprintln!(
                "{} session expired or not signed in, run {} and set {}",
                "!".yellow(),
                "veda login".bold(),
                "VEDA_TOKEN".bold()
            );
        });
    HttpTransport::from_config(config, Arc::new(context))
        .context("failed to create backend client")
}

async fn run(cli: Cli, transport: HttpTransport, config: &VedaConfig) -> Result<()> {
    match cli {
        Cli::Login { email, password } => cmd_login(&transport, &email, &password).await,
        Cli::Sessions { json } => cmd_sessions(&transport, json).await,
        Cli::History { id, json } => cmd_history(&transport, &id, json).await,
        Cli::Send { message, session } => {
            let orch = ChatOrchestrator::new(Arc::new(transport), config.chat.clone());
            cmd_send(&orch, &message, session.as_deref()).await
        }
        Cli::Chat { session } => {
            let orch = ChatOrchestrator::new(Arc::new(transport), config.chat.clone());
            cmd_chat(&orch, session.as_deref()).await
        }
    }
}

async fn cmd_login(transport: &HttpTransport, email: &str, password: &str) -> Result<()> {
    let token = transport
        .login(email, password)
        .await
        .context("login failed")?;
    eprintln!("{} signed in as {}", "ok".green(), email.bold());
    println!("{token}");
    Ok(())
}

async fn cmd_sessions(transport: &HttpTransport, json: bool) -> Result<()> {
    let sessions = transport
        .sessions()
        .await
        .context("failed to fetch sessions")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&sessions)?);
        return Ok(());
    }
    if sessions.is_empty() {
        println!("{}", "No sessions yet.".dimmed());
        return Ok(());
    }
    for s in &sessions {
        let day = s
            .created_on()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{}  {}  {}", s.id.cyan(), day.dimmed(), s.title());
    }
    Ok(())
}

async fn cmd_history(transport: &HttpTransport, id: &str, json: bool) -> Result<()> {
    let entries = transport
        .history(id)
        .await
        .with_context(|| format!("failed to fetch history of {id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    for message in expand_history(&entries) {
        print_message(&message);
    }
    Ok(())
}

async fn cmd_send(orch: &Orchestrator, message: &str, session: Option<&str>) -> Result<()> {
    match send_and_print(orch, message, session).await {
        SendOutcome::Completed => Ok(()),
        SendOutcome::Rejected => bail!("message cannot be empty"),
        SendOutcome::Busy => bail!("a reply is already streaming"),
        SendOutcome::Failed { error } => Err(error).context(SEND_FAILED_MESSAGE),
    }
}

async fn cmd_chat(orch: &Orchestrator, session: Option<&str>) -> Result<()> {
    orch.refresh_sessions().await;
    open(orch, session).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("{} ", ">".green().bold());
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit" | "/exit", _) => break,
            ("/new", _) => open(orch, None).await,
            ("/open", id) if !id.trim().is_empty() => open(orch, Some(id.trim())).await,
            ("/open", _) => eprintln!("{}", "usage: /open SESSION_ID".yellow()),
            ("/sessions", _) => {
                orch.refresh_sessions().await;
                for s in orch.directory().sessions() {
                    println!("{}  {}", s.id.cyan(), s.title());
                }
            }
            _ => match send_and_print(orch, line, None).await {
                SendOutcome::Failed { error } => {
                    eprintln!("{} {}", SEND_FAILED_MESSAGE.red(), error.to_string().dimmed());
                }
                SendOutcome::Completed | SendOutcome::Rejected | SendOutcome::Busy => {}
            },
        }
    }
    Ok(())
}

/// Switch conversations and print whatever history was loaded.
async fn open(orch: &Orchestrator, session: Option<&str>) {
    orch.open_session(session).await;
    match session {
        Some(id) => {
            let messages = orch.conversation().messages();
            println!(
                "{} {} ({} messages)",
                "opened".dimmed(),
                id.cyan(),
                messages.len()
            );
            for message in &messages {
                print_message(message);
            }
        }
        None => println!("{}", "new conversation".dimmed()),
    }
}

/// Run one send and echo the reply to stdout as deltas land.
async fn send_and_print(orch: &Orchestrator, text: &str, session: Option<&str>) -> SendOutcome {
    let mut rx = orch.conversation().subscribe();
    rx.borrow_and_update();
    let reply_index = orch.conversation().messages().len() + 1;
    let mut printed = 0;

    let send = orch.send(text, session);
    tokio::pin!(send);
    let outcome = loop {
        tokio::select! {
            outcome = &mut send => break outcome,
            changed = rx.changed() => {
                if changed.is_err() {
                    break send.await;
                }
                let snapshot = rx.borrow_and_update().clone();
                printed = print_reply_tail(&snapshot, reply_index, printed);
            }
        }
    };

    printed = print_reply_tail(&orch.conversation().snapshot(), reply_index, printed);
    if printed > 0 {
        println!();
    }
    outcome
}

/// Print the part of the reply not yet shown. Returns the new printed length.
fn print_reply_tail(snapshot: &ConversationSnapshot, reply_index: usize, printed: usize) -> usize {
    let Some(reply) = snapshot.messages.get(reply_index) else {
        return printed;
    };
    if reply.role != Role::Assistant {
        return printed;
    }
    if let Some(tail) = reply.text.get(printed..) {
        print!("{tail}");
        let _ = std::io::stdout().flush();
    }
    reply.text.len()
}

fn print_message(message: &Message) {
    match message.role {
        Role::User => println!("{} {}", "you:".blue().bold(), message.text),
        Role::Assistant => println!("{} {}", "veda:".magenta().bold(), message.text),
    }
}
