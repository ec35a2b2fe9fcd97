use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::ClientError;
use crate::image;
use crate::protocol::{Command, Reply, parse_reply, sanitize_username};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Reconnection attempts ran out; only a manual reconnect leaves this.
    GivenUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Users(Vec<String>),
    Message { user: String, time: String, text: String },
    Image { user: String, time: String, data: String },
    System { time: String, text: String },
    Private { from: String, text: String },
    /// A server line that matched no known reply.
    Other(String),
    ConnectionLost,
    ReconnectFailed { attempt: u32, error: String },
    Reconnected,
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub max_attempts: u32,
    pub retry_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            max_attempts: 3,
            retry_delay: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone)]
struct Target {
    port: u16,
    username: String,
}

struct Shared {
    config: ClientConfig,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    state: watch::Sender<ConnState>,
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Opens the socket, introduces the user and installs the writer.
    async fn open(&self, target: &Target) -> Result<OwnedReadHalf, ClientError> {
        let host = self.config.host.as_str();

        let stream = TcpStream::connect((host, target.port))
            .await
            .map_err(|source| ClientError::Connect {
                target: format!("{host}:{}", target.port),
                source,
            })?;

        let (reader, mut writer) = stream.into_split();

        let hello = Command::User(target.username.clone());
        writer.write_all(format!("{hello}\n").as_bytes()).await?;

        *self.writer.lock().await = Some(writer);

        Ok(reader)
    }
}

pub struct Connector {
    shared: Arc<Shared>,
    // owns the only reader of the current connection
    supervisor: Mutex<Option<JoinHandle<()>>>,
    last: Mutex<Option<Target>>,
}

impl Connector {
    pub fn new(config: ClientConfig) -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnState::Disconnected);

        let connector = Self {
            shared: Arc::new(Shared {
                config,
                writer: tokio::sync::Mutex::new(None),
                state,
                events,
            }),
            supervisor: Mutex::new(None),
            last: Mutex::new(None),
        };

        (connector, rx)
    }

    pub fn state(&self) -> ConnState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnState> {
        self.shared.state.subscribe()
    }

    pub async fn connect(&self, port: u16, username: &str) -> Result<(), ClientError> {
        self.cancel_supervisor();
        self.close_writer().await;

        let target = Target {
            port,
            username: username.to_string(),
        };
        if let Ok(mut last) = self.last.lock() {
            *last = Some(target.clone());
        }

        self.shared.set_state(ConnState::Connecting);

        let reader = match self.shared.open(&target).await {
            Ok(reader) => reader,
            Err(e) => {
                self.shared.set_state(ConnState::Disconnected);
                return Err(e);
            }
        };

        self.shared.set_state(ConnState::Connected);
        info!(port, user = username, "connected");

        let task = tokio::spawn(supervise(self.shared.clone(), target, reader));
        if let Ok(mut supervisor) = self.supervisor.lock() {
            *supervisor = Some(task);
        }

        Ok(())
    }

    /// Connects again with the last port and username.
    pub async fn reconnect(&self) -> Result<(), ClientError> {
        let last = self.last.lock().ok().and_then(|l| l.clone());

        match last {
            Some(target) => self.connect(target.port, &target.username).await,
            None => Err(ClientError::NotConnected),
        }
    }

    pub async fn disconnect(&self) {
        self.cancel_supervisor();
        self.close_writer().await;

        self.shared.set_state(ConnState::Disconnected);
    }

    async fn close_writer(&self) {
        let writer = self.shared.writer.lock().await.take();

        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
    }

    pub async fn send(&self, cmd: &Command) -> Result<(), ClientError> {
        let mut guard = self.shared.writer.lock().await;

        let writer = guard.as_mut().ok_or(ClientError::NotConnected)?;
        writer.write_all(format!("{cmd}\n").as_bytes()).await?;

        Ok(())
    }

    pub async fn send_message(&self, text: &str) -> Result<(), ClientError> {
        self.send(&Command::Msg(text.to_string())).await
    }

    pub async fn send_private(&self, to: &str, text: &str) -> Result<(), ClientError> {
        self.send(&Command::MsgTo {
            to: to.to_string(),
            text: text.to_string(),
        })
        .await
    }

    pub async fn send_image(&self, bytes: &[u8]) -> Result<(), ClientError> {
        self.send(&Command::Img(image::encode(bytes))).await
    }

    fn cancel_supervisor(&self) {
        if let Ok(mut supervisor) = self.supervisor.lock() {
            if let Some(task) = supervisor.take() {
                task.abort();
            }
        }
    }
}

impl Drop for Connector {
    fn drop(&mut self) {
        self.cancel_supervisor();
    }
}

async fn supervise(shared: Arc<Shared>, target: Target, reader: OwnedReadHalf) {
    let mut reader = reader;

    loop {
        read_loop(&shared, &target.username, reader).await;

        *shared.writer.lock().await = None;
        shared.emit(ClientEvent::ConnectionLost);
        warn!(port = target.port, "connection lost, reconnecting");

        match reconnect(&shared, &target).await {
            Some(next) => {
                reader = next;
                shared.set_state(ConnState::Connected);
                shared.emit(ClientEvent::Reconnected);
            }
            None => {
                let attempts = shared.config.max_attempts;

                warn!(port = target.port, attempts, "giving up on reconnection");
                shared.set_state(ConnState::GivenUp);
                shared.emit(ClientEvent::GaveUp { attempts });
                return;
            }
        }
    }
}

/// Fixed spacing, no backoff growth.
async fn reconnect(shared: &Shared, target: &Target) -> Option<OwnedReadHalf> {
    for attempt in 1..=shared.config.max_attempts {
        shared.set_state(ConnState::Reconnecting { attempt });

        tokio::time::sleep(shared.config.retry_delay).await;

        match shared.open(target).await {
            Ok(reader) => return Some(reader),
            Err(e) => {
                debug!(attempt, error = %e, "reconnect attempt failed");
                shared.emit(ClientEvent::ReconnectFailed {
                    attempt,
                    error: e.to_string(),
                });
            }
        }
    }

    None
}

async fn read_loop(shared: &Shared, username: &str, reader: OwnedReadHalf) {
    let mut lines = BufReader::new(reader).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if let Some(event) = classify(username, &line) {
                    shared.emit(event);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "read failed");
                break;
            }
        }
    }
}

/// Turns a server line into an event. Broadcast echoes of our own
/// messages and blank lines yield nothing.
fn classify(username: &str, line: &str) -> Option<ClientEvent> {
    if line.trim().is_empty() {
        return None;
    }

    // the server broadcasts the sanitized form of our name
    let own = sanitize_username(username).unwrap_or_else(|| username.to_string());

    let event = match parse_reply(line) {
        Ok(Reply::Users(users)) => ClientEvent::Users(users),
        Ok(Reply::Msg { user, .. }) | Ok(Reply::Img { user, .. }) if user == own => return None,
        Ok(Reply::Msg { user, time, text }) => ClientEvent::Message { user, time, text },
        Ok(Reply::Img { user, time, data }) => ClientEvent::Image { user, time, data },
        Ok(Reply::Sys { time, text }) => ClientEvent::System { time, text },
        Ok(Reply::Private { from, text }) => ClientEvent::Private { from, text },
        Err(_) => ClientEvent::Other(line.to_string()),
    };

    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio::time::Instant;

    fn config(max_attempts: u32) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".into(),
            max_attempts,
            retry_delay: Duration::from_millis(100),
        }
    }

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    async fn read_hello(socket: TcpStream) -> (String, TcpStream) {
        let mut reader = BufReader::new(socket);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        (line, reader.into_inner())
    }

    #[test]
    fn own_echo_is_suppressed() {
        assert_eq!(classify("alice", "MSG:alice|10:00:00|hi"), None);
        assert_eq!(classify("alice", "IMG:alice|10:00:00|aGk="), None);
        assert_eq!(
            classify("alice", "MSG:bob|10:00:00|hi"),
            Some(ClientEvent::Message {
                user: "bob".into(),
                time: "10:00:00".into(),
                text: "hi".into()
            })
        );
        assert_eq!(
            classify("alice", "Welcome"),
            Some(ClientEvent::Other("Welcome".into()))
        );
    }

    #[test]
    fn own_echo_matches_the_sanitized_name() {
        assert_eq!(classify("a:b", "IMG:a_b|10:00:00|aGk="), None);
        assert_eq!(classify(" a|b ", "MSG:a_b|10:00:00|hi"), None);

        let long = "x".repeat(40);
        let echo = format!("IMG:{}|10:00:00|aGk=", "x".repeat(32));
        assert_eq!(classify(&long, &echo), None);
    }

    #[tokio::test]
    async fn failed_connect_drops_the_previous_writer() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            read_hello(socket).await
        });

        let (connector, _events) = Connector::new(config(1));
        connector.connect(port, "alice").await.unwrap();
        let (_, _socket) = server.await.unwrap();

        let dead = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        assert!(matches!(
            connector.connect(dead, "alice").await,
            Err(ClientError::Connect { .. })
        ));
        assert_eq!(connector.state(), ConnState::Disconnected);
        assert!(matches!(
            connector.send_message("still there?").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn user_line_is_sent_first_and_replies_are_dispatched() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let (hello, mut socket) = read_hello(socket).await;

            socket
                .write_all(b"USERS:alice,bob\nMSG:alice|10:00:00|echo\nMSG:bob|10:00:01|yo\n")
                .await
                .unwrap();

            (hello, socket)
        });

        let (connector, mut events) = Connector::new(config(1));
        connector.connect(port, "alice").await.unwrap();

        let (hello, _socket) = server.await.unwrap();
        assert_eq!(hello, "USER:alice\n");
        assert_eq!(connector.state(), ConnState::Connected);

        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Users(vec!["alice".into(), "bob".into()])
        );
        assert_eq!(
            next_event(&mut events).await,
            ClientEvent::Message {
                user: "bob".into(),
                time: "10:00:01".into(),
                text: "yo".into()
            }
        );

        connector.disconnect().await;
        assert_eq!(connector.state(), ConnState::Disconnected);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts_with_fixed_spacing() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let _ = read_hello(socket).await;
            // socket and listener dropped: the port is closed for good
        });

        let (connector, mut events) = Connector::new(config(3));
        connector.connect(port, "alice").await.unwrap();
        server.await.unwrap();

        assert_eq!(next_event(&mut events).await, ClientEvent::ConnectionLost);

        let mut failures = Vec::new();
        loop {
            match next_event(&mut events).await {
                ClientEvent::ReconnectFailed { attempt, .. } => failures.push((attempt, Instant::now())),
                ClientEvent::GaveUp { attempts } => {
                    assert_eq!(attempts, 3);
                    break;
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        let attempts: Vec<u32> = failures.iter().map(|(a, _)| *a).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        for pair in failures.windows(2) {
            assert!(pair[1].1 - pair[0].1 >= Duration::from_millis(90));
        }
        assert_eq!(connector.state(), ConnState::GivenUp);
        assert!(matches!(
            connector.send_message("anyone?").await,
            Err(ClientError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn reconnect_resends_user_line() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = tokio::spawn(async move {
            let (first, _) = listener.accept().await.unwrap();
            let (hello, first) = read_hello(first).await;
            assert_eq!(hello, "USER:carol\n");
            drop(first);

            let (second, _) = listener.accept().await.unwrap();
            read_hello(second).await
        });

        let (connector, mut events) = Connector::new(config(3));
        connector.connect(port, "carol").await.unwrap();

        assert_eq!(next_event(&mut events).await, ClientEvent::ConnectionLost);
        assert_eq!(next_event(&mut events).await, ClientEvent::Reconnected);
        assert_eq!(connector.state(), ConnState::Connected);

        let (hello, _second) = server.await.unwrap();
        assert_eq!(hello, "USER:carol\n");
    }

    #[tokio::test]
    async fn initial_connect_failure_is_returned() {
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();

        let (connector, _events) = Connector::new(config(3));

        assert!(matches!(
            connector.connect(port, "dave").await,
            Err(ClientError::Connect { .. })
        ));
        assert_eq!(connector.state(), ConnState::Disconnected);
    }
}
