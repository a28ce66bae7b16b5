//! Terminal client for the relay.
//!
//! The chat loop multiplexes frames from the relay with lines typed on
//! stdin; ctrl-c ends it. Every stdin line becomes one chat message tagged
//! with the configured group, and incoming messages print as `sender: text`.

use std::net::SocketAddr;

use anyhow::{Context, Result, bail};
use tokio::{
    io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    select,
};
use tracing::warn;

use crate::cli::{ClientArgs, CreateGroupArgs};
use crate::message::{
    ChatMessage, ClientToServer, ServerToClient, read_frame, unix_millis, write_frame,
};

pub async fn run(args: ClientArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(args.server).await?;
    write_stdout(&format!("*** connected as {} to {}", args.name, args.server)).await?;

    let mut stdin = BufReader::new(io::stdin());
    let mut input = String::new();

    chat_loop(&args, &mut reader, &mut writer, &mut stdin, &mut input).await?;
    shutdown_connection(&mut writer).await;
    Ok(())
}

/// One-shot administrative mode: ask the relay to create a group, wait for
/// the acknowledgment, and exit.
pub async fn create_group(args: CreateGroupArgs) -> Result<()> {
    let (mut reader, mut writer) = establish_connection(args.server).await?;

    write_frame(
        &mut writer,
        &ClientToServer::CreateGroup {
            group_name: args.group.clone(),
        },
    )
    .await?;

    match read_frame::<_, ServerToClient>(&mut reader).await? {
        Some(ServerToClient::GroupCreated { group_name }) => {
            write_stdout(&format!("*** group '{group_name}' is ready")).await?;
        }
        Some(frame) => bail!("unexpected acknowledgment: {frame:?}"),
        None => bail!("relay closed the connection before acknowledging"),
    }

    shutdown_connection(&mut writer).await;
    Ok(())
}

async fn establish_connection(
    addr: SocketAddr,
) -> Result<(BufReader<OwnedReadHalf>, OwnedWriteHalf)> {
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("failed to connect to relay at {addr}"))?;
    let (reader, writer) = stream.into_split();
    Ok((BufReader::new(reader), writer))
}

async fn chat_loop(
    args: &ClientArgs,
    reader: &mut BufReader<OwnedReadHalf>,
    writer: &mut OwnedWriteHalf,
    stdin: &mut BufReader<io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            frame = read_frame::<_, ServerToClient>(reader) => {
                if !handle_server_frame(frame).await? {
                    break;
                }
            }
            bytes_read = stdin.read_line(input) => {
                if !handle_input_line(bytes_read, input, args, writer).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "failed to listen for ctrl-c");
                }
                break;
            }
        }
    }
    Ok(())
}

/// Renders one frame from the relay. Returns false once the relay closes the
/// connection.
async fn handle_server_frame(frame: io::Result<Option<ServerToClient>>) -> Result<bool> {
    match frame? {
        Some(ServerToClient::Message(message)) => {
            write_stdout(&format!("{}: {}", message.sender, message.text)).await?;
            Ok(true)
        }
        Some(ServerToClient::GroupCreated { group_name }) => {
            write_stdout(&format!("*** group '{group_name}' is ready")).await?;
            Ok(true)
        }
        None => {
            write_stdout("*** relay closed the connection").await?;
            Ok(false)
        }
    }
}

/// Turns one stdin line into a chat message. Empty lines are skipped,
/// `/quit` (or stdin closing) ends the loop.
async fn handle_input_line(
    bytes_read: io::Result<usize>,
    input: &str,
    args: &ClientArgs,
    writer: &mut OwnedWriteHalf,
) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        write_stdout("*** leaving chat").await?;
        return Ok(false);
    }

    write_frame(
        writer,
        &ClientToServer::Message(ChatMessage {
            sender: args.name.clone(),
            group_name: args.group.clone(),
            text: text.to_string(),
            timestamp_ms: unix_millis(),
        }),
    )
    .await?;
    Ok(true)
}

async fn shutdown_connection(writer: &mut OwnedWriteHalf) {
    if let Err(error) = writer.shutdown().await {
        warn!(?error, "failed to shut down connection cleanly");
    }
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}
