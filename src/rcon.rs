use crate::{
    config::RconConfig,
    error::{MonitorError, Result},
    monitor::PlayerQuery,
};
use async_trait::async_trait;
use std::{future::Future, time::Duration};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
};
use tracing::{debug, info};

const RESPONSE_VALUE: i32 = 0;
const EXEC_COMMAND: i32 = 2;
const AUTH_RESPONSE: i32 = 2;
const AUTH: i32 = 3;
/// Longest command body a Minecraft server accepts
const MAX_COMMAND_LEN: usize = 1446;
const MAX_PACKET_LEN: i32 = 1 << 16;

/// Players reported by the server's `list` command
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlayerList {
    pub names: Vec<String>,
    pub max: Option<usize>,
}

impl PlayerList {
    /// Parses `There are 2 of a max of 20 players online: Alex, Steve`
    /// as well as the older `There are 2/20 players online:Alex, Steve`.
    pub fn parse(reply: &str) -> Result<Self> {
        let (header, names) = reply
            .split_once("players online:")
            .ok_or_else(|| MonitorError::Protocol(format!("unexpected list reply {reply:?}")))?;
        let numbers = header
            .split(|c: char| !c.is_ascii_digit())
            .filter_map(|n| n.parse::<usize>().ok())
            .collect::<Vec<_>>();
        let Some(&online) = numbers.first() else {
            return Err(MonitorError::Protocol(format!(
                "no player count in {reply:?}"
            )));
        };
        let names = names
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(String::from)
            .collect::<Vec<_>>();
        if online != names.len() {
            debug!("server reports {online} players but lists {}", names.len());
        }
        Ok(Self {
            names,
            max: numbers.get(1).copied(),
        })
    }

    pub fn count(&self) -> usize {
        self.names.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Packet {
    id: i32,
    kind: i32,
    body: String,
}

impl Packet {
    fn encode(&self) -> Vec<u8> {
        let len = (4 + 4 + self.body.len() + 2) as i32;
        let mut buf = Vec::with_capacity(len as usize + 4);
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&self.id.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(self.body.as_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf
    }

    async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let len = reader.read_i32_le().await?;
        if !(10..=MAX_PACKET_LEN).contains(&len) {
            return Err(MonitorError::Protocol(format!("bad packet length {len}")));
        }
        let id = reader.read_i32_le().await?;
        let kind = reader.read_i32_le().await?;
        let mut body = vec![0; len as usize - 8];
        reader.read_exact(&mut body).await?;
        if body.ends_with(&[0, 0]) {
            body.truncate(body.len() - 2);
        } else {
            return Err(MonitorError::Protocol("packet is not NUL terminated".into()));
        }
        Ok(Self {
            id,
            kind,
            body: String::from_utf8_lossy(&body).into_owned(),
        })
    }

    async fn write_to<W>(&self, writer: &mut W) -> Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.encode()).await?;
        writer.flush().await?;
        Ok(())
    }
}

async fn within<T, F>(limit: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| MonitorError::Timeout(format!("rcon {what} after {limit:?}")))?
}

/// Opens a fresh session for every query and closes it afterwards
#[derive(Debug, Clone)]
pub struct RconClient {
    config: RconConfig,
}

impl RconClient {
    pub fn new(config: RconConfig) -> Self {
        Self { config }
    }

    pub async fn run_command(&self, command: &str) -> Result<String> {
        if command.len() > MAX_COMMAND_LEN {
            return Err(MonitorError::Protocol(format!(
                "command is {} bytes, limit is {MAX_COMMAND_LEN}",
                command.len()
            )));
        }
        let limit = self.config.timeout;
        let addr = (self.config.host.as_str(), self.config.port);
        let stream = within(limit, "connect", async {
            TcpStream::connect(addr).await.map_err(MonitorError::from)
        })
        .await?;
        let mut session = Session {
            stream,
            next_id: 0,
            limit,
        };
        session.login(&self.config.password).await?;
        let reply = session.exec(command).await;
        session.close().await;
        reply
    }

    pub async fn list_players(&self) -> Result<PlayerList> {
        info!(
            "Querying players over rcon at {}:{}",
            self.config.host, self.config.port
        );
        let reply = self.run_command("list").await?;
        debug!("rcon response: {reply:?}");
        let list = PlayerList::parse(&reply)?;
        info!("{} players online", list.count());
        Ok(list)
    }
}

#[async_trait]
impl PlayerQuery for RconClient {
    async fn query_players(&self) -> Result<PlayerList> {
        self.list_players().await
    }
}

struct Session<S> {
    stream: S,
    next_id: i32,
    limit: Duration,
}

impl<S> Session<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn next_id(&mut self) -> i32 {
        self.next_id += 1;
        self.next_id
    }

    async fn send(&mut self, kind: i32, body: &str) -> Result<i32> {
        let packet = Packet {
            id: self.next_id(),
            kind,
            body: body.to_string(),
        };
        within(self.limit, "write", packet.write_to(&mut self.stream)).await?;
        Ok(packet.id)
    }

    async fn receive(&mut self) -> Result<Packet> {
        within(self.limit, "read", Packet::read_from(&mut self.stream)).await
    }

    async fn login(&mut self, password: &str) -> Result<()> {
        let id = self.send(AUTH, password).await?;
        loop {
            let packet = self.receive().await?;
            match packet {
                Packet { id: -1, .. } => {
                    return Err(MonitorError::Auth("rcon password rejected".into()))
                }
                Packet {
                    id: got,
                    kind: AUTH_RESPONSE,
                    ..
                } if got == id => return Ok(()),
                // some servers send an empty value packet ahead of the auth reply
                Packet {
                    kind: RESPONSE_VALUE,
                    ..
                } => continue,
                other => {
                    return Err(MonitorError::Protocol(format!(
                        "unexpected packet during login: {other:?}"
                    )))
                }
            }
        }
    }

    async fn exec(&mut self, command: &str) -> Result<String> {
        let id = self.send(EXEC_COMMAND, command).await?;
        loop {
            let packet = self.receive().await?;
            if packet.id == -1 {
                return Err(MonitorError::Auth("rcon session is not authenticated".into()));
            }
            if packet.id == id && packet.kind == RESPONSE_VALUE {
                return Ok(packet.body);
            }
            debug!("skipping rcon packet {} of kind {}", packet.id, packet.kind);
        }
    }

    async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
