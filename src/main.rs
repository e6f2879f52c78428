use std::sync::Arc;

use clap::Parser;
use colored::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use room_sync::api::{MessageApi, RoomApi};
use room_sync::broadcast::{Delivery, InvalidationBus, LocalBus, Signal, Subscription, WsBus};
use room_sync::cli::{message_line, notification_line, room_line, room_query, Args, Command};
use room_sync::config::{ClientConfig, ENV_BASE_URL};
use room_sync::directory::RoomDirectory;
use room_sync::http::HttpApi;
use room_sync::lifecycle::{ConnectionLifecycle, JoinFailure};
use room_sync::model::{MessageForm, UserRef};
use room_sync::notifications::NotificationSync;
use room_sync::session::{Effect, WsConnector};

fn load_config(args: &Args) -> Result<ClientConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => ClientConfig::load(path)?,
        None => ClientConfig::from_env(),
    };
    if let Some(base) = &args.base_url {
        config.apply_env(|key| (key == ENV_BASE_URL).then(|| base.clone()));
    }
    config.validate()?;
    Ok(config)
}

fn print_rooms<A: RoomApi + room_sync::api::TagApi + 'static, B: InvalidationBus>(directory: &RoomDirectory<A, B>) {
    let rooms = directory.rooms();
    if rooms.is_empty() {
        println!("{}", RoomDirectory::<A, B>::not_found_message(None).dimmed());
        return;
    }
    for room in &rooms {
        println!("{}", room_line(room));
    }
    let page = directory.query().page.unwrap_or(1);
    println!("{}", format!("page {page} of {}", directory.page_count()).dimmed());
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "room_sync=info".into()))
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let api = Arc::new(HttpApi::new(config.clone()));

    match args.command {
        Command::Rooms { search, topic, tag, order, page } => {
            let directory = RoomDirectory::new(api, Arc::new(LocalBus::new())).with_page_size(config.page_size);
            let query = room_query(search.as_deref(), topic.as_deref(), tag.as_deref(), order, page);
            directory.list(query).await?;
            print_rooms(&directory);
        }

        Command::WatchRooms => {
            let bus = Arc::new(WsBus::connect(config.room_list_channel(), config.channel_capacity).await?);
            let directory = RoomDirectory::new(api, Arc::clone(&bus)).with_page_size(config.page_size);
            let mut sub = Subscription::new(bus.subscribe());
            directory.refresh().await?;
            print_rooms(&directory);
            while let Some(delivery) = sub.next().await {
                if matches!(delivery, Delivery::Signal(Signal::NotificationListUpdate | Signal::Ban)) {
                    continue;
                }
                match directory.on_invalidate().await {
                    Ok(outcome) if outcome.is_applied() => {
                        println!("{}", "── room list updated ──".cyan());
                        print_rooms(&directory);
                    }
                    Ok(_) => {}
                    Err(e) => eprintln!("{} {e}", "refresh failed:".red()),
                }
            }
            println!("{}", "room list channel closed".dimmed());
        }

        Command::Join { title, key, user_id, username } => {
            let me = UserRef { id: user_id, username, image: None };
            let room = match api.get_room(&title).await {
                Ok(room) => room,
                Err(e) => return report_join_failure(&title, &e),
            };
            let lifecycle = ConnectionLifecycle::new(Arc::clone(&api), WsConnector::new(config.clone()));
            let mut guard = match lifecycle.join(&room, &me, key.as_deref()).await {
                Ok(guard) => guard,
                Err(e) => return report_join_failure(&title, &e),
            };

            let mut shown = 0;
            for message in guard.session().view().messages() {
                println!("{}", message_line(message));
                shown += 1;
            }

            let closed = tokio::select! {
                reason = guard.session_mut().run_until_closed(|effect, view| {
                    for message in view.messages().iter().skip(shown) {
                        println!("{}", message_line(message));
                    }
                    shown = view.messages().len();
                    if let Effect::Close(reason) = effect {
                        println!("{}", reason.to_string().yellow());
                    }
                    if matches!(effect, Effect::ReloadAuth) {
                        println!("{}", "You have been banned. Sign in again.".red().bold());
                    }
                }) => Some(reason),
                _ = tokio::signal::ctrl_c() => None,
            };
            if closed.is_none() {
                println!("{}", "leaving…".dimmed());
            }
            guard.leave().await?;
        }

        Command::Send { title, text, reply_to } => {
            let mut form = MessageForm::new(text);
            if let Some(id) = reply_to {
                form = form.replying_to(id);
            }
            form.validate()?;
            let message = api.send_message(&title, &form).await?;
            println!("{}", message_line(&message));
        }

        Command::Inbox { unread } => {
            let inbox = NotificationSync::new(api, Arc::new(LocalBus::new()));
            inbox.list().await?;
            let shown = if unread { inbox.unread() } else { inbox.inbox() };
            for notification in &shown {
                println!("{}", notification_line(notification));
            }
            println!("{}", format!("{} unread", inbox.unread_count()).dimmed());
        }

        Command::MarkRead { all, ids } => {
            let inbox = NotificationSync::new(api, Arc::new(LocalBus::new()));
            let outcome = if all {
                inbox.list().await?;
                inbox.mark_all_unread_viewed().await?
            } else {
                inbox.mark_all_viewed(&ids).await?
            };
            if let Err(failures) = outcome {
                for (id, e) in &failures.failed {
                    eprintln!("{} #{id}: {e}", "not marked".red());
                }
            }
            println!("{}", format!("{} unread", inbox.unread_count()).dimmed());
        }
    }

    Ok(())
}

fn report_join_failure(title: &str, error: &room_sync::error::SyncError) -> Result<(), Box<dyn std::error::Error>> {
    Err(JoinFailure::from_error(title, error).message().into())
}
