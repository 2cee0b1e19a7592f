//! Client - operator-facing side of the socket protocol

mod terminal;

pub use terminal::DETACH_KEY;

use crate::protocol::{self, ClientMessage, ControllerInfo, ServerMessage, PROTOCOL_VERSION};
use anyhow::{anyhow, bail, Context, Result};
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;

/// An authenticated connection to `procraft-server`
pub struct Client {
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
}

impl Client {
    /// Connect and say Hello as `operator`
    pub async fn connect(socket_path: &Path, operator: &str) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Is procraft-server running at {}?", socket_path.display()))?;
        let (reader, writer) = stream.into_split();
        let mut client = Self { reader, writer };

        match client.recv().await? {
            ServerMessage::Welcome {
                protocol_version, ..
            } => protocol::check_version_compatibility(PROTOCOL_VERSION, protocol_version)?,
            other => bail!("Expected Welcome, got {:?}", other),
        }

        client
            .request(ClientMessage::Hello {
                protocol_version: PROTOCOL_VERSION,
                operator: operator.to_string(),
            })
            .await?;
        Ok(client)
    }

    async fn send(&mut self, msg: &ClientMessage) -> Result<()> {
        protocol::send(&mut self.writer, msg).await
    }

    async fn recv(&mut self) -> Result<ServerMessage> {
        protocol::recv(&mut self.reader)
            .await?
            .ok_or_else(|| anyhow!("Server closed the connection"))
    }

    /// Send a request and wait for its reply, skipping relayed output
    async fn request(&mut self, msg: ClientMessage) -> Result<ServerMessage> {
        self.send(&msg).await?;
        loop {
            match self.recv().await? {
                ServerMessage::Output { .. } => continue,
                ServerMessage::Error { message } => bail!(message),
                reply => return Ok(reply),
            }
        }
    }

    pub async fn list(&mut self) -> Result<Vec<ControllerInfo>> {
        match self.request(ClientMessage::ListControllers).await? {
            ServerMessage::ControllerList { controllers } => Ok(controllers),
            other => bail!("Unexpected reply: {:?}", other),
        }
    }

    pub async fn run(&mut self, controller: &str, command: &str) -> Result<()> {
        self.request(ClientMessage::Run {
            controller: controller.to_string(),
            command: command.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn reconnect(&mut self, controller: &str) -> Result<()> {
        self.request(ClientMessage::Reconnect {
            controller: controller.to_string(),
        })
        .await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.request(ClientMessage::Shutdown).await?;
        Ok(())
    }

    /// Hook this connection to a controller
    pub async fn attach(&mut self, controller: &str) -> Result<()> {
        match self
            .request(ClientMessage::Attach {
                controller: controller.to_string(),
            })
            .await?
        {
            ServerMessage::Attached { .. } => Ok(()),
            other => bail!("Unexpected reply: {:?}", other),
        }
    }

    /// Attach and mirror the controller on this terminal until the detach
    /// key is pressed or the server goes away
    pub async fn attach_interactive(mut self, controller: &str) -> Result<()> {
        self.attach(controller).await?;
        eprintln!("Attached to '{}'. Press Ctrl-] to detach.\r", controller);

        let Client { reader, mut writer } = self;
        let _raw = terminal::RawMode::enable()?;

        let (keys_tx, mut keys_rx) = mpsc::channel::<Vec<u8>>(64);
        let (server_tx, mut server_rx) = mpsc::channel::<Result<Option<ServerMessage>>>(64);
        let stdin_task = tokio::spawn(terminal::read_keys(keys_tx));
        // Frames are read on their own task; a partial read must never be
        // cancelled by keyboard input.
        let server_task = tokio::spawn(read_server(reader, server_tx));
        let mut stdout = tokio::io::stdout();

        loop {
            tokio::select! {
                keys = keys_rx.recv() => {
                    let Some(keys) = keys else { break };
                    match keys.iter().position(|&b| b == DETACH_KEY) {
                        Some(at) => {
                            if at > 0 {
                                let data = keys[..at].to_vec();
                                protocol::send(&mut writer, &ClientMessage::Input { data }).await?;
                            }
                            protocol::send(&mut writer, &ClientMessage::Detach).await?;
                        }
                        None => {
                            protocol::send(&mut writer, &ClientMessage::Input { data: keys }).await?;
                        }
                    }
                }
                msg = server_rx.recv() => {
                    match msg.transpose()?.flatten() {
                        Some(ServerMessage::Output { data, .. }) => {
                            stdout.write_all(&data).await?;
                            stdout.flush().await?;
                        }
                        Some(ServerMessage::Error { message }) => {
                            eprintln!("\r\nprocraft: {}\r", message);
                        }
                        Some(ServerMessage::Detached) | None => break,
                        Some(_) => {}
                    }
                }
            }
        }

        stdin_task.abort();
        server_task.abort();
        eprintln!("\r\nDetached from '{}'.\r", controller);
        Ok(())
    }
}

/// Forward server messages until the connection ends
async fn read_server(
    mut reader: OwnedReadHalf,
    messages: mpsc::Sender<Result<Option<ServerMessage>>>,
) {
    loop {
        let msg = protocol::recv::<ServerMessage, _>(&mut reader).await;
        let done = !matches!(msg, Ok(Some(_)));
        if messages.send(msg).await.is_err() || done {
            break;
        }
    }
}
