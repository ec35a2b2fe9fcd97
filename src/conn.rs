use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::debug;

use crate::image;
use crate::protocol::{Command, Reply, clock, parse_command, sanitize_username};
use crate::room::{Room, SessionId};

pub async fn handle(
    room: Arc<Room>,
    socket: TcpStream,
    id: SessionId,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> Result<()> {
    let (reader, mut writer) = socket.into_split();

    let mut lines = BufReader::new(reader).lines();

    // None until the first line arrives
    let mut user: Option<String> = None;

    let outcome: std::io::Result<()> = loop {
        tokio::select! {
            // Branch A: something to deliver, or the port is closing us
            out = outbound.recv() => {
                match out {
                    Some(line) => {
                        if let Err(e) = write_line(&mut writer, &line).await {
                            break Err(e);
                        }
                    }

                    None => break Ok(()),
                }
            }

            // Branch B: client sent a line
            line_result = lines.next_line() => {
                match line_result {
                    Ok(Some(line)) => {
                        let name = match user.clone() {
                            Some(name) => name,
                            None => {
                                // cleared by a shutdown before the first line
                                let Some((name, consumed)) = handshake(&room, id, &line).await else {
                                    break Ok(());
                                };
                                user = Some(name.clone());

                                if consumed {
                                    continue;
                                }

                                name
                            }
                        };

                        dispatch(&room, id, &name, &line).await;
                    }

                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            }
        }
    };

    match user {
        Some(name) => leave(&room, id, &name).await,
        // closed before saying anything, e.g. a liveness probe
        None => {
            room.remove(id);
        }
    }

    let _ = writer.shutdown().await;

    Ok(outcome?)
}

async fn write_line(writer: &mut OwnedWriteHalf, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await
}

/// Processes the first line. Returns the session's name and whether the
/// line was the `USER` introduction, or `None` if the session is gone.
async fn handshake(room: &Room, id: SessionId, line: &str) -> Option<(String, bool)> {
    let requested = match parse_command(line) {
        Ok(Command::User(name)) => Some(name),
        _ => None,
    };

    let consumed = requested.is_some();
    let name = room.join(id, requested.as_deref().and_then(sanitize_username))?;

    let time = clock();
    room.log().record(format!("** {name} connected at {time} **")).await;

    room.send(Reply::Sys {
        time,
        text: format!("{name} connected"),
    });
    room.send(room.users_reply());

    Some((name, consumed))
}

async fn dispatch(room: &Room, id: SessionId, user: &str, line: &str) {
    let cmd = match parse_command(line) {
        Ok(c) => c,
        Err(e) => {
            debug!(port = room.log().port(), user, error = %e, "dropped line");
            return;
        }
    };

    match cmd {
        Command::Msg(text) => {
            let time = clock();

            room.log().record(format!("{user} [{time}]: {text}")).await;

            room.send_except(
                id,
                Reply::Msg {
                    user: user.to_string(),
                    time,
                    text,
                },
            );
        }

        Command::MsgTo { to, text } => {
            let delivered = room.send_to_user(
                &to,
                Reply::Private {
                    from: user.to_string(),
                    text,
                },
            );

            if !delivered {
                debug!(port = room.log().port(), user, to = %to, "private message target not found");
            }
        }

        Command::Img(data) => {
            let time = clock();

            let bytes = match image::decode(&data) {
                Ok(bytes) => bytes,
                Err(e) => {
                    room.log().record(format!("Error decoding image from {user}: {e}")).await;
                    return;
                }
            };

            match room.log().save_image(user, &bytes).await {
                Ok(path) => {
                    let file = path
                        .file_name()
                        .map(|f| f.to_string_lossy().into_owned())
                        .unwrap_or_default();

                    room.log().record(format!("{user} [{time}] sent image: {file}")).await;
                }
                Err(e) => {
                    room.log().record(format!("Error saving image: {e}")).await;
                }
            }

            room.send(Reply::Img {
                user: user.to_string(),
                time,
                data,
            });
        }

        Command::User(_) => {
            debug!(port = room.log().port(), user, "ignoring repeated USER line");
        }
    }
}

async fn leave(room: &Room, id: SessionId, user: &str) {
    room.remove(id);

    let time = clock();
    room.log().record(format!("** {user} disconnected at {time} **")).await;

    room.send(Reply::Sys {
        time,
        text: format!("{user} disconnected"),
    });
    room.send(room.users_reply());
}
