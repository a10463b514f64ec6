use anyhow::Result;
use chrono::{DateTime, Local};
use log::{LevelFilter, Record};
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Mutex;

use chatsync::{Conversation, DayLabel, DeliveryStatus, TimelineEntry};

// Logging and terminal formatting helpers for the command-line client

pub struct SimpleLogger {
    log_file: Mutex<std::fs::File>,
}

impl SimpleLogger {
    pub fn new(log_file_path: &str) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)?;
        Ok(SimpleLogger {
            log_file: Mutex::new(file),
        })
    }
}

impl log::Log for SimpleLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        let now: DateTime<Local> = Local::now();
        let log_message = format!(
            "[{}] {} [{}:{}] {}\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            record.level(),
            record.file().unwrap_or("unknown"),
            record.line().unwrap_or(0),
            record.args()
        );
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.write_all(log_message.as_bytes());
        }
    }

    fn flush(&self) {
        if let Ok(mut file) = self.log_file.lock() {
            let _ = file.flush();
        }
    }
}

/// Read a line of input from stdin, trimming whitespace
pub fn read_line() -> Result<String> {
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

/// File logger when a path is given, otherwise env_logger on stderr
pub fn setup_logging(log_file: Option<&str>, level: LevelFilter) -> Result<()> {
    match log_file {
        Some(path) => {
            let logger = SimpleLogger::new(path)?;
            log::set_boxed_logger(Box::new(logger)).map(|()| log::set_max_level(level))?;
        }
        None => {
            env_logger::Builder::new()
                .filter_level(level)
                .parse_default_env()
                .try_init()?;
        }
    }

    log::info!("Logging initialized at level: {}", level);
    log::info!(
        "{} version {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );
    Ok(())
}

pub fn format_conversation(conversation: &Conversation) -> String {
    let pin = if conversation.is_pinned { "*" } else { " " };
    let unread = if conversation.unread_count > 0 {
        format!(" ({})", conversation.unread_count)
    } else {
        String::new()
    };
    format!(
        "{}[{}] {} - {}{} [{}] {}",
        pin,
        conversation.id,
        conversation.display_name,
        conversation.title,
        unread,
        conversation.status,
        conversation.last_message
    )
}

pub fn format_day_label(label: &DayLabel) -> String {
    match label {
        DayLabel::Today => "Today".to_string(),
        DayLabel::Yesterday => "Yesterday".to_string(),
        DayLabel::Date(date) => date.format("%B %-d, %Y").to_string(),
    }
}

pub fn format_entry(entry: &TimelineEntry, me: u64) -> String {
    let time = entry.message.created_at.with_timezone(&Local).format("%H:%M");
    let who = if entry.message.sender == me { "me" } else { "them" };
    let marker = match entry.status {
        DeliveryStatus::Pending => " (sending)",
        DeliveryStatus::Failed => " (failed)",
        DeliveryStatus::Confirmed if entry.message.sender == me && entry.message.read => " (read)",
        DeliveryStatus::Confirmed => "",
    };
    format!("  {} {}: {}{}", time, who, entry.message.content, marker)
}
