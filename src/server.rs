use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ControlError;
use crate::journal::PortLog;
use crate::room::Room;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);

/// One listening socket and the sessions connected through it.
pub struct PortListener {
    port: u16,
    room: Arc<Room>,
    active: AtomicBool,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl PortListener {
    /// Binds synchronously, so a port in use is reported to the caller
    /// before anything is spawned.
    pub fn bind(host: IpAddr, port: u16, log: PortLog) -> Result<Self, ControlError> {
        let listener =
            bind_socket(SocketAddr::new(host, port)).map_err(|source| ControlError::Bind { port, source })?;

        let room = Arc::new(Room::new(log));
        let (shutdown, signal) = watch::channel(false);

        let task = tokio::spawn(accept_loop(listener, room.clone(), signal));

        Ok(Self {
            port,
            room,
            active: AtomicBool::new(true),
            shutdown,
            task: Some(task),
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn users(&self) -> Vec<String> {
        self.room.usernames()
    }

    /// False once shut down or if the accept loop has ended on its own.
    pub fn is_alive(&self) -> bool {
        self.active.load(Ordering::SeqCst) && self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stops accepting, waits for the listening socket to close, then
    /// force-closes every session. Safe to call more than once.
    pub async fn shutdown(&mut self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown.send(true);

        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(port = self.port, error = %e, "accept loop ended abnormally");
            }
        }

        self.room.clear();
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown.send(true);
            self.room.clear();
        }
    }
}

fn bind_socket(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };

    // lets a restarted port rebind while old sessions sit in TIME_WAIT
    #[cfg(unix)]
    socket.set_reuseaddr(true)?;

    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(listener: TcpListener, room: Arc<Room>, mut signal: watch::Receiver<bool>) {
    let port = room.log().port();

    room.log().event(format!("Server listening on port {port}"));

    loop {
        tokio::select! {
            _ = signal.changed() => break,

            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer)) => {
                        debug!(port, %peer, "client connected");

                        let (id, outbound) = room.register(peer);
                        let room = room.clone();

                        tokio::spawn(async move {
                            if let Err(err) = crate::conn::handle(room, socket, id, outbound).await {
                                debug!(port, %peer, error = %err, "session ended with error");
                            }
                        });
                    }

                    Err(e) => {
                        room.log().event(format!("Error on port {port}: {e}"));
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    drop(listener);

    room.log().event(format!("Server on port {port} stopped"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::broadcast;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn free_port() -> u16 {
        std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    fn log(port: u16, dir: &std::path::Path) -> PortLog {
        let (feed, _) = broadcast::channel(64);

        PortLog::new(port, dir, feed)
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let port = free_port();

        let mut first = PortListener::bind(LOCALHOST, port, log(port, tmp.path())).unwrap();
        let second = PortListener::bind(LOCALHOST, port, log(port, tmp.path()));

        assert!(matches!(second, Err(ControlError::Bind { port: p, .. }) if p == port));

        first.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_frees_the_port_and_closes_sessions() {
        let tmp = tempfile::tempdir().unwrap();
        let port = free_port();

        let mut listener = PortListener::bind(LOCALHOST, port, log(port, tmp.path())).unwrap();
        assert!(listener.is_alive());

        let mut client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        client.write_all(b"USER:alice\n").await.unwrap();

        let (reader, _writer) = client.into_split();
        let mut lines = BufReader::new(reader).lines();
        assert!(lines.next_line().await.unwrap().unwrap().starts_with("SYS:"));
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "USERS:alice");

        listener.shutdown().await;
        listener.shutdown().await;

        assert!(!listener.is_alive());
        assert!(listener.room().is_empty());
        assert!(matches!(lines.next_line().await, Ok(None) | Err(_)));

        let mut again = PortListener::bind(LOCALHOST, port, log(port, tmp.path())).unwrap();
        again.shutdown().await;
    }
}
