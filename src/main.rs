#![deny(dead_code)]
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use log::{error, info, warn, LevelFilter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

mod utils;

use chatsync::config::{self, parse_viewer, Session, SyncConfig};
use chatsync::engine::{ChatEngine, EngineOptions, Outgoing};
use chatsync::remote::{HttpRemote, InMemoryRemote, RemoteApi};
use chatsync::timeline::today;
use chatsync::{ChatStatus, CompanyRef, Origin, SyncEvent, Viewer};

/// Command line arguments for chatsync
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "chatsync: keeps job-board conversations in sync from the terminal.",
    long_about = "chatsync polls the job-board backend for conversations and messages, \
    tracks unread counts and pins, and lets you chat from the command line.\n\n\
    Type 'help' once running to see the available commands."
)]
struct Args {
    /// Backend base URL, e.g. https://jobs.example.com/api
    #[arg(long, value_name = "URL")]
    api_url: Option<String>,

    /// Your user id on the backend
    #[arg(long)]
    user_id: Option<u64>,

    /// student or company
    #[arg(long)]
    role: Option<String>,

    /// API token (stored encoded in the session file); CHATSYNC_TOKEN also works
    #[arg(long)]
    token: Option<String>,

    /// Path to config.json
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Directory for config, session and pin files
    #[arg(long, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Write logs to this file instead of stderr
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Conversation to open on start
    #[arg(long, value_name = "CHAT_ID")]
    open: Option<u64>,

    /// Run against a seeded in-process backend instead of the network
    #[arg(long)]
    demo: bool,

    #[arg(short, long)]
    verbose: bool,
}

const HELP: &str = "\
Commands:
  list                      show conversations
  open <chat>               open a conversation
  close                     close the open conversation
  send <text>               send a message to the open conversation
  file <url> <name> <mime> <size>
                            send an uploaded file
  resume <resume-id> [note] share a resume
  read [chat]               mark a conversation read
  pin <chat>                pin or unpin a conversation
  status <chat> <active|closed|blocked>
  clear <chat>              delete all messages, keep the conversation
  delete <chat>             delete the conversation
  search <text>             filter conversations by name or title
  unread                    server-side unread count
  quit";

fn prompt(label: &str) -> Result<String> {
    eprintln!("{}", label);
    utils::read_line()
}

/// Resolve who we are: command line first, then the saved session, then ask
fn resolve_session(args: &Args, config: &SyncConfig) -> Result<(Session, Viewer)> {
    let saved = config::load_session()?;
    let api_url = args
        .api_url
        .clone()
        .or_else(|| saved.as_ref().map(|s| s.api_url.clone()))
        .unwrap_or_else(|| config.api_url.clone());

    let user_id = match args.user_id.or(saved.as_ref().map(|s| s.user_id)) {
        Some(id) => id,
        None => prompt("Enter your user id:")?
            .parse()
            .context("User id must be a number")?,
    };
    let role = match args.role.clone().or(saved.as_ref().map(|s| s.role.clone())) {
        Some(role) => role,
        None => prompt("Are you a student or a company?")?,
    };
    let viewer = parse_viewer(&role, user_id)?;

    let token = args
        .token
        .clone()
        .or_else(|| std::env::var("CHATSYNC_TOKEN").ok())
        .or_else(|| saved.as_ref().and_then(|s| s.get_token()));
    let session = Session::new(&api_url, viewer, token.as_deref());
    Ok((session, viewer))
}

/// A tiny backend with one conversation per role, for trying the client offline
fn seed_demo(remote: &InMemoryRemote, role: &str) -> Viewer {
    let student = remote.add_user("Ada", "Lovelace", None);
    let recruiter = remote.add_user("Rita", "Hire", None);
    let company = remote.add_company(recruiter, "Acme");
    let job = remote.add_job(CompanyRef::Id(company), "Rust Intern");
    let application = remote.add_job_application(student, job);
    let job_chat = remote.add_chat(Origin::JobApplication(application));
    remote.add_message(job_chat, student, "Hi, I just applied for the internship.", true);
    remote.add_message(job_chat, recruiter, "Thanks Ada, when can you talk?", false);

    let resume = remote.add_resume(student, Some("Data Analyst"));
    let outreach = remote.add_resume_application(resume, company, Some("We liked your resume"));
    remote.add_chat(Origin::ResumeApplication(outreach));

    if role.eq_ignore_ascii_case("company") {
        Viewer::Company(recruiter)
    } else {
        Viewer::Student(student)
    }
}

fn parse_chat(arg: Option<&str>) -> Result<u64> {
    arg.ok_or_else(|| anyhow!("Missing chat id"))?
        .parse()
        .context("Chat id must be a number")
}

fn print_conversations(list: &[chatsync::Conversation]) {
    if list.is_empty() {
        println!("No conversations");
    }
    for conversation in list {
        println!("{}", utils::format_conversation(conversation));
    }
}

fn print_messages(engine: &ChatEngine) {
    let me = engine.viewer().user_id();
    for group in engine.day_groups(today()) {
        println!("-- {} --", utils::format_day_label(&group.label));
        for entry in &group.entries {
            println!("{}", utils::format_entry(entry, me));
        }
    }
}

/// Run one command line. Returns false when the user asked to quit.
async fn handle_command(engine: &Arc<ChatEngine>, line: &str) -> Result<bool> {
    let mut parts = line.splitn(2, ' ');
    let command = parts.next().unwrap_or_default();
    let rest = parts.next().map(str::trim).unwrap_or_default();
    let mut words = rest.split_whitespace();

    match command {
        "" => {}
        "help" => println!("{}", HELP),
        "quit" | "exit" => return Ok(false),
        "list" => print_conversations(&engine.conversations()),
        "open" => {
            let chat = parse_chat(words.next())?;
            engine.select_conversation(Some(chat)).await?;
            print_messages(engine);
        }
        "close" => engine.select_conversation(None).await?,
        "send" => {
            let message = engine.send_message(Outgoing::Text(rest.to_string())).await?;
            info!("Sent message {}", message.id);
            print_messages(engine);
        }
        "file" => {
            let (url, name, mime, size) = match (words.next(), words.next(), words.next(), words.next()) {
                (Some(url), Some(name), Some(mime), Some(size)) => (url, name, mime, size),
                _ => return Err(anyhow!("Usage: file <url> <name> <mime> <size>")),
            };
            engine
                .send_message(Outgoing::Attachment {
                    file_url: url.to_string(),
                    file_name: name.to_string(),
                    mime_type: mime.to_string(),
                    size: size.parse().context("Size must be a number of bytes")?,
                })
                .await?;
            print_messages(engine);
        }
        "resume" => {
            let resume = words
                .next()
                .ok_or_else(|| anyhow!("Usage: resume <resume-id> [note]"))?
                .parse()
                .context("Resume id must be a number")?;
            let note: Vec<&str> = words.collect();
            let note = if note.is_empty() { None } else { Some(note.join(" ")) };
            engine.send_message(Outgoing::Resume { resume, note }).await?;
            print_messages(engine);
        }
        "read" => {
            let chat = match words.next() {
                Some(chat) => parse_chat(Some(chat))?,
                None => engine
                    .selected()
                    .ok_or_else(|| anyhow!("No conversation is open"))?,
            };
            engine.mark_read(chat).await?;
        }
        "pin" => {
            let chat = parse_chat(words.next())?;
            let change = engine.toggle_pin(chat).await?;
            println!("Chat {}: {:?}", chat, change);
        }
        "status" => {
            let chat = parse_chat(words.next())?;
            let status: ChatStatus = words
                .next()
                .ok_or_else(|| anyhow!("Usage: status <chat> <active|closed|blocked>"))?
                .parse()
                .map_err(|e: String| anyhow!(e))?;
            let updated = engine.update_status(chat, status).await?;
            println!("Chat {} is now {}", updated.id, updated.status);
        }
        "clear" => {
            let chat = parse_chat(words.next())?;
            engine.clear_conversation(chat).await?;
            println!("Cleared chat {}", chat);
        }
        "delete" => {
            let chat = parse_chat(words.next())?;
            engine.delete_conversation(chat).await?;
            println!("Deleted chat {}", chat);
        }
        "search" => print_conversations(&engine.search(rest)),
        "unread" => println!("Unread on server: {}", engine.remote_unread_count().await?),
        other => println!("Unknown command '{}'. Type 'help'.", other),
    }
    Ok(true)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, level)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    if let Some(dir) = &args.config_dir {
        std::fs::create_dir_all(dir)?;
        config::set_config_dir_override(dir.clone());
        info!("Config directory overridden to: {}", dir.display());
    }

    let mut sync_config = SyncConfig::load(args.config.as_deref())?;
    if let Some(url) = &args.api_url {
        sync_config.api_url = url.clone();
    }

    let (remote, viewer): (Arc<dyn RemoteApi>, Viewer) = if args.demo {
        let remote = InMemoryRemote::new();
        let viewer = seed_demo(&remote, args.role.as_deref().unwrap_or("student"));
        println!("Running against the demo backend as {} {}", viewer.role_name(), viewer.user_id());
        (Arc::new(remote), viewer)
    } else {
        let (session, viewer) = resolve_session(&args, &sync_config)?;
        sync_config.api_url = session.api_url.clone();
        sync_config.validate()?;
        if let Err(e) = config::save_session(&session) {
            warn!("Failed to save session: {}", e);
        }
        let remote = HttpRemote::new(
            &session.api_url,
            sync_config.request_timeout(),
            session.get_token(),
        )?;
        println!("Connecting to {} as {} {}...", session.api_url, viewer.role_name(), viewer.user_id());
        (Arc::new(remote), viewer)
    };

    let options = EngineOptions::from_config(&sync_config, viewer)?;
    let engine = ChatEngine::new(remote, viewer, options)?;

    if let Err(e) = engine.refresh_conversations().await {
        eprintln!("Could not load conversations: {}", e);
    }
    print_conversations(&engine.conversations());
    if let Some(chat) = args.open {
        match engine.select_conversation(Some(chat)).await {
            Ok(()) => print_messages(&engine),
            Err(e) => eprintln!("Could not open chat {}: {}", chat, e),
        }
    }
    engine.start();

    let mut events = engine.subscribe();
    let notifier = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SyncEvent::UnreadCountChanged { total }) => println!("[unread: {}]", total),
                Ok(SyncEvent::SendFailed { chat, .. }) => {
                    eprintln!("Message to chat {} could not be sent and was removed", chat)
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} sync events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    });

    println!("Type 'help' for commands.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                match handle_command(&engine, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!("Command '{}' failed: {:#}", line.trim(), e);
                        eprintln!("Error: {:#}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    engine.shutdown();
    notifier.abort();
    info!("chatsync exiting");
    Ok(())
}
