//! Command-line interface for the relay binary.

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about = "Group chat relay over TCP", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay server.
    Server(ServerArgs),
    /// Connect to a relay and chat in one group.
    Client(ClientArgs),
    /// Ask a relay to create a group ahead of time.
    CreateGroup(CreateGroupArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Socket address to bind. Port 0 picks an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub listen: SocketAddr,

    /// Do not deliver a sender's own messages back to it.
    #[arg(long)]
    pub no_echo: bool,

    /// Disconnect a session once this many outbound frames are waiting
    /// behind its in-flight write. Unbounded when unset.
    #[arg(long)]
    pub max_queue: Option<usize>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub server: SocketAddr,

    /// Name other group members see as the message sender.
    #[arg(long, default_value = "anonymous")]
    pub name: String,

    /// Group to chat in; the first message sent binds the connection to it.
    #[arg(long, default_value = "general")]
    pub group: String,
}

#[derive(Args, Debug, Clone)]
pub struct CreateGroupArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:50051")]
    pub server: SocketAddr,

    /// Name of the group to create.
    pub group: String,
}
