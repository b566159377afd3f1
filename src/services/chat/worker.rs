//! Chat feed connection, room refresh and bounded event dispatch.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use sqlx::SqlitePool;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::ingest::{ChatIngest, ClearOutcome, MessageOutcome, RoomTable};
use super::irc::IrcMessage;
use super::message::{ChatMessage, ClearChat};
use crate::config::ChatConfig;
use crate::db::repository::BroadcasterRepository;
use crate::error::{with_timeout, AppResult};

type ChatSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECONNECT_MIN_DELAY: Duration = Duration::from_secs(1);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(60);
const CHANNELS_PER_JOIN: usize = 20;
const ANONYMOUS_NICK: &str = "justinfan12345";

#[derive(Debug, PartialEq, Eq)]
pub enum ChatEvent {
    Message(ChatMessage),
    Clear(ClearChat),
}

#[derive(Debug, PartialEq, Eq)]
enum LineAction {
    Event(ChatEvent),
    Reply(String),
    Reconnect,
    Ignore,
}

enum SessionEnd {
    Shutdown,
    Reconnect,
}

fn backoff_delay(attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(16);
    let ms = RECONNECT_MIN_DELAY
        .as_millis()
        .saturating_mul(1u128 << pow)
        .min(u64::MAX as u128) as u64;
    Duration::from_millis(ms).clamp(RECONNECT_MIN_DELAY, RECONNECT_MAX_DELAY)
}

/// A session that delivered data restarts the backoff; one that did not
/// counts as another failed attempt.
fn next_attempt(attempt: u32, received: bool) -> u32 {
    if received {
        1
    } else {
        attempt.saturating_add(1)
    }
}

fn classify_line(line: &str) -> LineAction {
    let Some(msg) = IrcMessage::parse(line) else {
        return LineAction::Ignore;
    };

    match msg.command.as_str() {
        "PING" => LineAction::Reply(format!(
            "PONG :{}",
            msg.params.last().map(String::as_str).unwrap_or("tmi.twitch.tv")
        )),
        "RECONNECT" => LineAction::Reconnect,
        "PRIVMSG" => ChatMessage::from_irc(&msg)
            .map(|m| LineAction::Event(ChatEvent::Message(m)))
            .unwrap_or(LineAction::Ignore),
        "CLEARCHAT" => ClearChat::from_irc(&msg)
            .map(|c| LineAction::Event(ChatEvent::Clear(c)))
            .unwrap_or(LineAction::Ignore),
        _ => LineAction::Ignore,
    }
}

/// `verb #a,#b,...` commands, at most [`CHANNELS_PER_JOIN`] channels each.
fn channel_commands<'a>(verb: &str, logins: impl IntoIterator<Item = &'a String>) -> Vec<String> {
    let logins: Vec<&String> = logins.into_iter().collect();
    logins
        .chunks(CHANNELS_PER_JOIN)
        .map(|chunk| {
            let channels: Vec<String> = chunk.iter().map(|l| format!("#{}", l)).collect();
            format!("{} {}", verb, channels.join(","))
        })
        .collect()
}

fn membership_commands(joined: &BTreeSet<String>, wanted: &BTreeSet<String>) -> Vec<String> {
    let mut commands = channel_commands("JOIN", wanted.difference(joined));
    commands.extend(channel_commands("PART", joined.difference(wanted)));
    commands
}

pub struct ChatWorker {
    db: SqlitePool,
    ingest: Arc<ChatIngest>,
    url: String,
    refresh_interval: Duration,
    max_in_flight: usize,
    timeout: Duration,
}

impl ChatWorker {
    pub fn new(db: SqlitePool, ingest: Arc<ChatIngest>, config: &ChatConfig, timeout: Duration) -> Self {
        Self {
            db,
            ingest,
            url: config.url.clone(),
            refresh_interval: Duration::from_secs(config.refresh_interval_seconds),
            max_in_flight: config.max_in_flight.max(1),
            timeout,
        }
    }

    async fn load_rooms(db: &SqlitePool, timeout: Duration) -> AppResult<RoomTable> {
        let broadcasters =
            with_timeout("broadcaster registry", timeout, BroadcasterRepository::list_all(db)).await?;
        Ok(RoomTable::from_broadcasters(&broadcasters))
    }

    /// Load the room table and spawn the connection, refresh and dispatch tasks.
    ///
    /// Fails only if the initial registry read fails.
    pub async fn start(self, shutdown: &broadcast::Sender<()>) -> AppResult<Vec<JoinHandle<()>>> {
        let table = Arc::new(Self::load_rooms(&self.db, self.timeout).await?);
        tracing::info!("Chat worker tracking {} room(s)", table.logins().len());

        let rooms = self.ingest.rooms().clone();
        rooms.replace(table.clone());
        let (rooms_tx, rooms_rx) = watch::channel(table);
        let (events_tx, events_rx) = mpsc::channel(self.max_in_flight * 4);

        let mut handles = Vec::new();

        // Room refresh
        {
            let mut shutdown_rx = shutdown.subscribe();
            let db = self.db.clone();
            let timeout = self.timeout;
            let interval = self.refresh_interval;
            handles.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => {
                            tracing::info!("Chat room refresh shutting down");
                            break;
                        }
                        _ = tokio::time::sleep(interval) => {}
                    }

                    match Self::load_rooms(&db, timeout).await {
                        Ok(table) => {
                            if **rooms_tx.borrow() != table {
                                let table = Arc::new(table);
                                rooms.replace(table.clone());
                                let _ = rooms_tx.send(table);
                                tracing::info!("Chat room table refreshed");
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Failed to refresh chat rooms, keeping previous: {:?}", e);
                        }
                    }
                }
            }));
        }

        // Dispatch
        {
            let shutdown_rx = shutdown.subscribe();
            let ingest = self.ingest.clone();
            let max_in_flight = self.max_in_flight;
            handles.push(tokio::spawn(dispatch(
                ingest,
                events_rx,
                max_in_flight,
                shutdown_rx,
            )));
        }

        // Connection
        {
            let shutdown_rx = shutdown.subscribe();
            let url = self.url.clone();
            handles.push(tokio::spawn(run_connection(
                url,
                rooms_rx,
                events_tx,
                shutdown_rx,
            )));
        }

        Ok(handles)
    }
}

async fn dispatch(
    ingest: Arc<ChatIngest>,
    mut events: mpsc::Receiver<ChatEvent>,
    max_in_flight: usize,
    mut shutdown: broadcast::Receiver<()>,
) {
    let permits = Arc::new(Semaphore::new(max_in_flight));

    loop {
        let event = tokio::select! {
            _ = shutdown.recv() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let ingest = ingest.clone();
        tokio::spawn(async move {
            let _permit = permit;
            handle_event(&ingest, event).await;
        });
    }

    // Let in-flight handlers finish.
    let _ = permits.acquire_many(max_in_flight as u32).await;
    tracing::info!("Chat dispatcher shutting down");
}

async fn handle_event(ingest: &ChatIngest, event: ChatEvent) {
    match event {
        ChatEvent::Message(msg) => {
            let outcome = ingest.handle_message(&msg).await;
            if outcome != MessageOutcome::Stored {
                tracing::trace!("Chat message {} not stored: {:?}", msg.id, outcome);
            }
        }
        ChatEvent::Clear(clear) => {
            let outcome = ingest.handle_clear_chat(&clear).await;
            if !matches!(outcome, ClearOutcome::Cleared(_)) {
                tracing::trace!("Clear chat in {} skipped: {:?}", clear.channel, outcome);
            }
        }
    }
}

async fn run_connection(
    url: String,
    mut rooms: watch::Receiver<Arc<RoomTable>>,
    events: mpsc::Sender<ChatEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut attempt: u32 = 0;

    loop {
        if attempt > 0 {
            let delay = backoff_delay(attempt);
            tracing::info!("Reconnecting to chat in {:?} (attempt {})", delay, attempt);
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok((ws, _resp)) => ws,
            Err(e) => {
                tracing::warn!("Failed to connect to chat: {}", e);
                attempt = next_attempt(attempt, false);
                continue;
            }
        };
        tracing::info!("Connected to chat at {}", url);

        let mut received = false;
        match run_session(ws, &mut rooms, &events, &mut shutdown, &mut received).await {
            Ok(SessionEnd::Shutdown) => break,
            Ok(SessionEnd::Reconnect) => tracing::info!("Chat server requested reconnect"),
            Err(e) => tracing::warn!("Chat connection lost: {:?}", e),
        }
        attempt = next_attempt(attempt, received);
    }

    tracing::info!("Chat connection shutting down");
}

async fn run_session(
    ws: ChatSocket,
    rooms: &mut watch::Receiver<Arc<RoomTable>>,
    events: &mpsc::Sender<ChatEvent>,
    shutdown: &mut broadcast::Receiver<()>,
    received: &mut bool,
) -> anyhow::Result<SessionEnd> {
    let (mut write, mut read) = ws.split();

    write
        .send(Message::text("CAP REQ :twitch.tv/tags twitch.tv/commands"))
        .await?;
    write.send(Message::text("PASS SCHMOOPIIE")).await?;
    write
        .send(Message::text(format!("NICK {}", ANONYMOUS_NICK)))
        .await?;

    let mut joined = BTreeSet::new();
    let wanted = rooms.borrow_and_update().logins().clone();
    for command in membership_commands(&joined, &wanted) {
        write.send(Message::text(command)).await?;
    }
    joined = wanted;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(SessionEnd::Shutdown);
            }

            changed = rooms.changed() => {
                if changed.is_err() {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Shutdown);
                }
                let wanted = rooms.borrow_and_update().logins().clone();
                for command in membership_commands(&joined, &wanted) {
                    write.send(Message::text(command)).await?;
                }
                joined = wanted;
            }

            frame = read.next() => {
                let Some(frame) = frame else {
                    anyhow::bail!("chat socket ended");
                };

                match frame? {
                    Message::Text(text) => {
                        *received = true;
                        for line in text.as_str().lines() {
                            match classify_line(line) {
                                LineAction::Event(event) => {
                                    if events.send(event).await.is_err() {
                                        return Ok(SessionEnd::Shutdown);
                                    }
                                }
                                LineAction::Reply(reply) => write.send(Message::text(reply)).await?,
                                LineAction::Reconnect => return Ok(SessionEnd::Reconnect),
                                LineAction::Ignore => {}
                            }
                        }
                    }
                    Message::Ping(payload) => write.send(Message::Pong(payload)).await?,
                    Message::Close(_) => anyhow::bail!("chat socket closed by server"),
                    _ => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{self, memory::MemoryCache, SharedCache};
    use crate::config::Config;
    use crate::db::fixtures;
    use crate::db::repository::ChatRepository;
    use crate::services::chat::ingest::RoomDirectory;
    use crate::services::emotes::EmoteResolver;
    use crate::test_support::DEAD_UPSTREAM;
    use tokio::net::TcpListener;

    fn logins(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(2), Duration::from_secs(2));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(7), Duration::from_secs(60));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(60));
    }

    #[test]
    fn backoff_resets_only_after_data() {
        assert_eq!(next_attempt(0, false), 1);
        assert_eq!(next_attempt(3, false), 4);
        assert_eq!(next_attempt(5, true), 1);

        // Sessions that connect and drop before any data keep backing off.
        let mut attempt = 0;
        for _ in 0..10 {
            attempt = next_attempt(attempt, false);
        }
        assert_eq!(backoff_delay(attempt), Duration::from_secs(60));
    }

    #[test]
    fn joins_are_chunked() {
        let many: BTreeSet<String> = (0..45).map(|i| format!("c{:02}", i)).collect();
        let commands = membership_commands(&BTreeSet::new(), &many);
        assert_eq!(commands.len(), 3);
        assert!(commands[0].starts_with("JOIN #c00,#c01,"));
        assert_eq!(commands[2], "JOIN #c40,#c41,#c42,#c43,#c44");
    }

    #[test]
    fn membership_diff_joins_new_and_parts_removed() {
        let commands = membership_commands(&logins(&["a", "b"]), &logins(&["b", "c"]));
        assert_eq!(commands, vec!["JOIN #c".to_string(), "PART #a".to_string()]);
        assert!(membership_commands(&logins(&["a"]), &logins(&["a"])).is_empty());
    }

    #[test]
    fn classifies_control_lines() {
        assert_eq!(
            classify_line("PING :tmi.twitch.tv"),
            LineAction::Reply("PONG :tmi.twitch.tv".to_string())
        );
        assert_eq!(classify_line(":tmi.twitch.tv RECONNECT"), LineAction::Reconnect);
        assert_eq!(
            classify_line(":tmi.twitch.tv 001 justinfan12345 :Welcome, GLHF!"),
            LineAction::Ignore
        );
        assert_eq!(
            classify_line(":u!u@u.tmi.twitch.tv PRIVMSG #alpha :no tags"),
            LineAction::Ignore
        );
        assert!(matches!(
            classify_line("@room-id=1;target-user-id=2 :tmi.twitch.tv CLEARCHAT #alpha :bob"),
            LineAction::Event(ChatEvent::Clear(_))
        ));
    }

    #[tokio::test]
    async fn worker_joins_answers_ping_and_stores_messages() {
        let db = fixtures::pool().await;
        let broadcaster = fixtures::broadcaster(&db, "1001", "alpha").await;
        let session_id = fixtures::session(&db, &broadcaster.id).await;
        let cache = Arc::new(MemoryCache::new());
        cache
            .set_ex(&cache::live_key(&broadcaster.id), &session_id, Duration::from_secs(60))
            .await
            .unwrap();

        let mut config = Config::default();
        config.emotes.ffz_url = DEAD_UPSTREAM.to_string();
        config.emotes.bttv_url = DEAD_UPSTREAM.to_string();
        config.emotes.seventv_url = DEAD_UPSTREAM.to_string();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        config.chat.url = format!("ws://{}", listener.local_addr().unwrap());

        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<String>();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(frame)) = ws.next().await {
                let Message::Text(text) = frame else { continue };
                let text = text.as_str().to_string();
                let _ = seen_tx.send(text.clone());
                if text == "JOIN #alpha" {
                    ws.send(Message::text(
                        "PING :tmi.twitch.tv\r\n@id=m-1;room-id=1001;user-id=77;display-name=Bob :bob!bob@bob.tmi.twitch.tv PRIVMSG #alpha :hello",
                    ))
                    .await
                    .unwrap();
                }
            }
        });

        let emotes = EmoteResolver::new(reqwest::Client::new(), cache.clone(), &config.emotes);
        let ingest = Arc::new(ChatIngest::new(
            db.clone(),
            cache.clone(),
            emotes,
            Arc::new(RoomDirectory::default()),
            Duration::from_secs(5),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);
        let handles = ChatWorker::new(db.clone(), ingest.clone(), &config.chat, Duration::from_secs(5))
            .start(&shutdown_tx)
            .await
            .unwrap();

        assert_eq!(ingest.rooms().snapshot().resolve("1001"), Some(broadcaster.id.as_str()));

        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(line) = seen_rx.recv().await {
                let done = line == "PONG :tmi.twitch.tv";
                seen.push(line);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(
            &seen[..4],
            &[
                "CAP REQ :twitch.tv/tags twitch.tv/commands".to_string(),
                "PASS SCHMOOPIIE".to_string(),
                "NICK justinfan12345".to_string(),
                "JOIN #alpha".to_string(),
            ]
        );

        let stored = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let records = ChatRepository::list_by_session(&db, &session_id).await.unwrap();
                if !records.is_empty() {
                    return records;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "hello");
        assert_eq!(stored[0].sender.display_name, "Bob");

        shutdown_tx.send(()).unwrap();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }

    #[tokio::test]
    async fn start_fails_when_registry_is_unreadable() {
        let db = fixtures::pool().await;
        db.close().await;

        let cache = Arc::new(MemoryCache::new());
        let config = Config::default();
        let emotes = EmoteResolver::new(reqwest::Client::new(), cache.clone(), &config.emotes);
        let ingest = Arc::new(ChatIngest::new(
            db.clone(),
            cache,
            emotes,
            Arc::new(RoomDirectory::default()),
            Duration::from_secs(5),
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        let res = ChatWorker::new(db, ingest, &config.chat, Duration::from_secs(5))
            .start(&shutdown_tx)
            .await;
        assert!(res.is_err());
    }
}
