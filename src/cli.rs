use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use colored::*;

use crate::api::{Ordering, RoomQuery};
use crate::model::{Message, Notification, Room};

#[derive(Parser)]
#[command(name = "room-sync")]
#[command(version = "0.3.0")]
#[command(about = "Terminal client for the chat-room directory, room sessions and notifications")]
pub struct Args {
    /// TOML config file; environment overrides still apply
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Backend base URL, overriding config and environment
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// List one page of rooms
    Rooms {
        /// Free-text search over titles and descriptions
        #[arg(long)]
        search: Option<String>,

        /// Topic title
        #[arg(long)]
        topic: Option<String>,

        /// Tag name
        #[arg(long)]
        tag: Option<String>,

        #[arg(long, value_enum)]
        order: Option<OrderArg>,

        #[arg(long, default_value = "1")]
        page: u32,
    },

    /// Print the room list every time it is invalidated
    WatchRooms,

    /// Join a room and print its events until the session closes
    Join {
        title: String,

        /// Plaintext key for a locked room
        #[arg(long)]
        key: Option<String>,

        /// Id of the signed-in user
        #[arg(long)]
        user_id: u64,

        /// Name of the signed-in user
        #[arg(long)]
        username: String,
    },

    /// Post a message to a room
    Send {
        title: String,
        text: String,

        /// Id of the message being replied to
        #[arg(long)]
        reply_to: Option<u64>,
    },

    /// Show the notification inbox
    Inbox {
        /// Only unread notifications
        #[arg(long)]
        unread: bool,
    },

    /// Mark notifications as viewed
    MarkRead {
        /// Every unread notification
        #[arg(long, conflicts_with = "ids")]
        all: bool,

        ids: Vec<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OrderArg {
    Newest,
    Oldest,
    Busiest,
    Quietest,
}

impl From<OrderArg> for Ordering {
    fn from(arg: OrderArg) -> Self {
        match arg {
            OrderArg::Newest => Ordering::CreatedDesc,
            OrderArg::Oldest => Ordering::CreatedAsc,
            OrderArg::Busiest => Ordering::ParticipantsDesc,
            OrderArg::Quietest => Ordering::ParticipantsAsc,
        }
    }
}

/// Build the directory query for `rooms` arguments.
pub fn room_query(
    search: Option<&str>,
    topic: Option<&str>,
    tag: Option<&str>,
    order: Option<OrderArg>,
    page: u32,
) -> RoomQuery {
    let mut query = RoomQuery::default().page(page);
    if let Some(text) = search {
        query = query.search(text);
    }
    if let Some(title) = topic {
        query = query.topic(title);
    }
    if let Some(name) = tag {
        query = query.tag(name);
    }
    if let Some(order) = order {
        query = query.ordering(order.into());
    }
    query
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

pub fn room_line(room: &Room) -> String {
    let lock = if room.is_open() { " " } else { "🔒" };
    let seats = format!("{}/{}", room.participants.len(), room.number_of_participants);
    let seats = if room.is_full() { seats.red() } else { seats.green() };
    let tags = room
        .tag_names()
        .iter()
        .map(|t| format!("#{t}"))
        .collect::<Vec<_>>()
        .join(" ");
    format!(
        "{lock} {} {} [{}] {} {}",
        room.title.bold(),
        seats,
        room.topic.title,
        format!("by {}", room.host.username).dimmed(),
        tags.cyan()
    )
}

pub fn message_line(message: &Message) -> String {
    let mut line = format!("{} {}", format!("{}:", message.author.username).bold(), message.text);
    if let Some(reply) = &message.reply_to {
        line = format!("{} {line}", format!("↪ {}", reply.short_message).dimmed());
    }
    if message.is_edited() {
        line.push_str(&format!(" {}", "(edited)".dimmed()));
    }
    line
}

pub fn notification_line(notification: &Notification) -> String {
    let marker = if notification.is_viewed { "  ".normal() } else { "● ".yellow() };
    format!(
        "{marker}#{} {:?} {}",
        notification.id,
        notification.notification_type,
        notification.created_at.format("%Y-%m-%d %H:%M").to_string().dimmed()
    )
}
