//! An in-process PostgreSQL server that speaks just enough of the protocol
//! to authenticate with GSS and answer the identity query.

use super::protocol::{SSL_REQUEST_CODE, backend};
use crate::broker::testing::token_owner;
use bytes::BytesMut;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    task::JoinHandle,
};

const TIMESTAMPTZ: u32 = 1184;
const NAME: u32 = 19;
pub(crate) const NOW: &str = "2024-05-01 12:30:45.123456+00";

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    /// Accept tokens whose authenticator names the startup user.
    Accept,
    /// Refuse every token.
    RejectAuth,
    /// Ask for a cleartext password instead of GSS.
    AskPassword,
    /// Ask for a GSS token again after receiving one.
    AskTwice,
}

/// What the server observed on one connection.
#[derive(Debug, Clone, Default)]
pub(crate) struct Seen {
    pub(crate) user: String,
    pub(crate) database: Option<String>,
    pub(crate) token_owner: Option<String>,
    pub(crate) tokens: usize,
}

pub(crate) struct MockPostgres {
    port: u16,
    seen: Arc<Mutex<Vec<Seen>>>,
    task: JoinHandle<()>,
}

impl MockPostgres {
    pub(crate) async fn start(behavior: Behavior) -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let task = {
            let seen = Arc::clone(&seen);
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let seen = Arc::clone(&seen);
                    tokio::spawn(async move {
                        let _ = serve(socket, behavior, seen).await;
                    });
                }
            })
        };
        Ok(Self { port, seen, task })
    }

    pub(crate) fn port(&self) -> u16 {
        self.port
    }

    pub(crate) fn connections(&self) -> Vec<Seen> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Drop for MockPostgres {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn cstrings(body: &[u8]) -> Vec<String> {
    body.split(|b| *b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned())
        .collect()
}

async fn read_startup(socket: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    loop {
        let len = usize::try_from(socket.read_i32().await?)?;
        let mut body = vec![0; len - 4];
        socket.read_exact(&mut body).await?;
        if body[..4] == SSL_REQUEST_CODE.to_be_bytes() {
            socket.write_all(b"N").await?;
            continue;
        }
        return Ok(body[4..].to_vec());
    }
}

async fn read_message(socket: &mut TcpStream) -> anyhow::Result<(u8, Vec<u8>)> {
    let tag = socket.read_u8().await?;
    let len = usize::try_from(socket.read_i32().await?)?;
    let mut body = vec![0; len - 4];
    socket.read_exact(&mut body).await?;
    Ok((tag, body))
}

fn record(seen: &Mutex<Vec<Seen>>, entry: Seen) {
    seen.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
}

async fn serve(
    mut socket: TcpStream,
    behavior: Behavior,
    seen: Arc<Mutex<Vec<Seen>>>,
) -> anyhow::Result<()> {
    let params = cstrings(&read_startup(&mut socket).await?);
    let mut entry = Seen::default();
    for pair in params.chunks(2) {
        match (pair.first().map(String::as_str), pair.get(1)) {
            (Some("user"), Some(value)) => entry.user.clone_from(value),
            (Some("database"), Some(value)) => entry.database = Some(value.clone()),
            _ => {}
        }
    }

    let mut out = BytesMut::new();
    if let Behavior::AskPassword = behavior {
        record(&seen, entry);
        backend::auth(&mut out, 3, &[]);
        socket.write_all(&out).await?;
        return Ok(());
    }

    backend::auth(&mut out, 7, &[]);
    socket.write_all(&out).await?;
    let (tag, token) = read_message(&mut socket).await?;
    anyhow::ensure!(tag == b'p', "expected a GSS response");
    entry.tokens += 1;
    entry.token_owner = token_owner(&token);

    out.clear();
    let accepted = match behavior {
        Behavior::AskTwice => {
            record(&seen, entry);
            backend::auth(&mut out, 7, &[]);
            socket.write_all(&out).await?;
            // a well-behaved client hangs up here instead of answering
            if let Ok((b'p', _)) = read_message(&mut socket).await {
                let mut entries = seen.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(last) = entries.last_mut() {
                    last.tokens += 1;
                }
            }
            return Ok(());
        }
        Behavior::RejectAuth => false,
        _ => entry.token_owner.as_deref() == Some(entry.user.as_str()),
    };
    let user = entry.user.clone();
    record(&seen, entry);
    if !accepted {
        backend::error(&mut out, "28000", &format!("GSSAPI authentication failed for user \"{user}\""));
        socket.write_all(&out).await?;
        return Ok(());
    }

    backend::auth(&mut out, 8, &[]);
    backend::auth(&mut out, 0, &[]);
    backend::parameter_status(&mut out, "server_version", "16.2");
    backend::parameter_status(&mut out, "session_authorization", &user);
    backend::ready(&mut out);
    socket.write_all(&out).await?;

    let mut query = String::new();
    loop {
        let (tag, body) = read_message(&mut socket).await?;
        match tag {
            b'P' => query = cstrings(&body).get(1).cloned().unwrap_or_default(),
            b'S' => {
                out.clear();
                if query.contains("missing_table") {
                    backend::error(&mut out, "42P01", "relation \"missing_table\" does not exist");
                } else {
                    backend::simple(&mut out, b'1');
                    backend::simple(&mut out, b'2');
                    backend::row_description(
                        &mut out,
                        &[("current_user", NAME), ("session_user", NAME), ("now", TIMESTAMPTZ)],
                    );
                    backend::data_row(&mut out, &[Some(user.as_str()), Some(user.as_str()), Some(NOW)]);
                    backend::command_complete(&mut out, "SELECT 1");
                }
                backend::ready(&mut out);
                socket.write_all(&out).await?;
            }
            b'X' => return Ok(()),
            _ => {}
        }
    }
}
