//! Interactive line commands.

use crate::app::App;
use console::style;
use kadlink_core::auth::REJECT_REASON_KEY;
use kadlink_core::{ConnectionId, Metadata, PeerId};

/// One shell command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Connect(String),
    Find(PeerId),
    Stream { peer: PeerId, message: String },
    Listen { port: u16, host: Option<String> },
    BootstrapKad,
    Peers,
    KadPeers,
    Addrs(PeerId),
    Messages,
    Accept(ConnectionId),
    Reject { connection: ConnectionId, reason: Option<String> },
    Help,
    Quit,
}

impl Command {
    /// Parse a line. `Ok(None)` for blank input.
    pub fn parse(line: &str) -> anyhow::Result<Option<Self>> {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        let mut args = rest.split_whitespace();

        let command = match name {
            "" => return Ok(None),
            "connect" => Command::Connect(required(args.next(), "connect <address>")?.to_string()),
            "find" => Command::Find(peer_arg(args.next(), "find <peer_id>")?),
            "stream" => {
                let usage = "stream <peer_id> <message>";
                let peer = peer_arg(args.next(), usage)?;
                let message = rest
                    .split_once(char::is_whitespace)
                    .map(|(_, m)| m.trim())
                    .filter(|m| !m.is_empty())
                    .ok_or_else(|| anyhow::anyhow!("usage: {usage}"))?;
                Command::Stream {
                    peer,
                    message: message.to_string(),
                }
            }
            "listen" => {
                let port = match args.next() {
                    Some(port) => port
                        .parse()
                        .map_err(|_| anyhow::anyhow!("invalid port '{port}'"))?,
                    None => 0,
                };
                Command::Listen {
                    port,
                    host: args.next().map(str::to_string),
                }
            }
            "bootstrap_kad" => Command::BootstrapKad,
            "peers" => Command::Peers,
            "kad_peers" => Command::KadPeers,
            "addrs" => Command::Addrs(peer_arg(args.next(), "addrs <peer_id>")?),
            "messages" => Command::Messages,
            "accept" => Command::Accept(connection_arg(args.next(), "accept <connection>")?),
            "reject" => {
                let connection = connection_arg(args.next(), "reject <connection> [reason]")?;
                let reason = rest
                    .split_once(char::is_whitespace)
                    .map(|(_, r)| r.trim().to_string())
                    .filter(|r| !r.is_empty());
                Command::Reject { connection, reason }
            }
            "help" | "?" => Command::Help,
            "quit" | "exit" => Command::Quit,
            other => anyhow::bail!("unknown command '{other}', try 'help'"),
        };
        Ok(Some(command))
    }
}

fn required<'a>(arg: Option<&'a str>, usage: &str) -> anyhow::Result<&'a str> {
    arg.ok_or_else(|| anyhow::anyhow!("usage: {usage}"))
}

fn peer_arg(arg: Option<&str>, usage: &str) -> anyhow::Result<PeerId> {
    let arg = required(arg, usage)?;
    arg.parse()
        .map_err(|e| anyhow::anyhow!("invalid peer id '{arg}': {e}"))
}

fn connection_arg(arg: Option<&str>, usage: &str) -> anyhow::Result<ConnectionId> {
    let arg = required(arg, usage)?;
    let raw = arg.strip_prefix("conn-").unwrap_or(arg);
    raw.parse()
        .map(ConnectionId::new)
        .map_err(|_| anyhow::anyhow!("invalid connection id '{arg}'"))
}

/// Listen address for a host and port
pub fn listen_address(host: &str, port: u16) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(std::net::IpAddr::V6(ip)) => format!("/ip6/{ip}/tcp/{port}"),
        Ok(std::net::IpAddr::V4(ip)) => format!("/ip4/{ip}/tcp/{port}"),
        Err(_) => format!("/dns/{host}/tcp/{port}"),
    }
}

/// Run one command. Returns false when the shell should exit.
pub async fn execute(app: &App, command: Command, default_host: &str) -> anyhow::Result<bool> {
    let node = &app.node;
    match command {
        Command::Connect(address) => {
            if node.connect(&address).await {
                println!("Connected to {address}");
            } else {
                println!("{} {address}", style("Could not connect to").red());
            }
        }
        Command::Find(peer) => {
            if node.find(&peer).await {
                println!("Found {peer}");
                for address in node.search_peer_addresses(&peer) {
                    println!("  {address}");
                }
            } else {
                println!("{} {peer}", style("Could not find").red());
            }
        }
        Command::Stream { peer, message } => {
            let reply = app.send_message(&peer, &message).await?;
            println!("Reply from {}: {reply}", peer.short());
        }
        Command::Listen { port, host } => {
            let host = host.as_deref().unwrap_or(default_host);
            let address = node.listen(&listen_address(host, port)).await?;
            println!("Listening on {address}");
        }
        Command::BootstrapKad => {
            if node.bootstrap().await {
                println!("Bootstrap complete, {} routable peers", node.kad_known_peers().len());
            } else {
                println!("{}", style("Bootstrap found no peers").red());
            }
        }
        Command::Peers => {
            let connected = node.connected_peers();
            println!("Connected peers ({}):", connected.len());
            for peer in connected {
                let marker = if node.is_peer_authenticated(&peer) {
                    style("authenticated").green()
                } else {
                    style("pending").yellow()
                };
                println!("  {peer} [{marker}]");
            }
        }
        Command::KadPeers => {
            let known = node.kad_known_peers();
            println!("Routing table ({} peers):", known.len());
            for (peer, addresses) in known {
                println!("  {peer}");
                for address in addresses {
                    println!("    {address}");
                }
            }
        }
        Command::Addrs(peer) => {
            let addresses = node.search_peer_addresses(&peer);
            if addresses.is_empty() {
                println!("No known addresses for {peer}");
            }
            for address in addresses {
                println!("  {address}");
            }
        }
        Command::Messages => {
            let messages = app.received_messages();
            println!("Received messages ({}):", messages.len());
            for message in messages {
                println!("  {}: {}", message.peer_id, message.text);
            }
        }
        Command::Accept(connection) => {
            app.decide(connection, true, Metadata::new()).await?;
            println!("Accepted {connection}");
        }
        Command::Reject { connection, reason } => {
            let mut metadata = Metadata::new();
            if let Some(reason) = reason {
                metadata.insert(REJECT_REASON_KEY.to_string(), reason);
            }
            app.decide(connection, false, metadata).await?;
            println!("Rejected {connection}");
        }
        Command::Help => print_help(),
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_help() {
    println!("Commands:");
    println!("  connect <address>           dial a peer, e.g. /ip4/127.0.0.1/tcp/4001");
    println!("  find <peer_id>              locate a peer through the DHT");
    println!("  stream <peer_id> <message>  send a message and print the reply");
    println!("  listen [port] [host]        open another listener");
    println!("  bootstrap_kad               join through the configured bootstrap peers");
    println!("  peers                       list connected peers");
    println!("  kad_peers                   list the routing table");
    println!("  addrs <peer_id>             list known addresses of a peer");
    println!("  messages                    list received messages");
    println!("  accept <connection>         accept a pending PoR request");
    println!("  reject <connection> [why]   reject a pending PoR request");
    println!("  help                        show this help");
    println!("  quit                        stop the node and exit");
}
