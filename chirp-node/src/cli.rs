//! Interactive peer shell: reads commands from stdin, prints peer events.

use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::runtime::{JoinOutcome, PeerRuntime};
use crate::transport::PeerEvent;

const HELP: &str = "\
--- COMMANDS ---
list                        : show online peers and channels
join <channel>              : join or create a channel on the tracker
connect <user> <ip> <port>  : open a direct connection to a peer
connect-all                 : connect to every peer the tracker lists
send <user> <msg>           : send a direct message
broadcast <msg>             : send to all connected peers
post <peer|channel> <msg>   : queue a message on the tracker
inbox                       : fetch messages queued on the tracker
help                        : show this menu
exit                        : quit
----------------";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Join(String),
    Connect { user: String, ip: String, port: u16 },
    ConnectAll,
    Send { user: String, body: String },
    Broadcast(String),
    Post { target: String, body: String },
    Inbox,
    Help,
    Exit,
}

/// Why a line did not parse into a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Empty,
    Usage(&'static str),
    /// `connect` without enough arguments; the shell also prints the peer list.
    ConnectUsage,
    InvalidPort(String),
    Unknown(String),
}

/// Parse one input line. Message bodies keep everything after the target, single-spaced.
pub fn parse_command(line: &str) -> Result<Command, ParseError> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(first) = parts.first() else {
        return Err(ParseError::Empty);
    };
    match first.to_ascii_lowercase().as_str() {
        "list" => Ok(Command::List),
        "join" => match parts.get(1) {
            Some(name) => Ok(Command::Join(name.to_string())),
            None => Err(ParseError::Usage("Usage: join <channel_name>")),
        },
        "connect" => {
            if parts.len() < 4 {
                return Err(ParseError::ConnectUsage);
            }
            let port = parts[3]
                .parse::<u16>()
                .map_err(|_| ParseError::InvalidPort(parts[3].to_string()))?;
            Ok(Command::Connect {
                user: parts[1].to_string(),
                ip: parts[2].to_string(),
                port,
            })
        }
        "connect-all" => Ok(Command::ConnectAll),
        "send" => {
            if parts.len() < 3 {
                return Err(ParseError::Usage("Usage: send <username> <message>"));
            }
            Ok(Command::Send {
                user: parts[1].to_string(),
                body: parts[2..].join(" "),
            })
        }
        "broadcast" => {
            if parts.len() < 2 {
                return Err(ParseError::Usage("Usage: broadcast <message>"));
            }
            Ok(Command::Broadcast(parts[1..].join(" ")))
        }
        "post" => {
            if parts.len() < 3 {
                return Err(ParseError::Usage("Usage: post <peer|channel> <message>"));
            }
            Ok(Command::Post {
                target: parts[1].to_string(),
                body: parts[2..].join(" "),
            })
        }
        "inbox" => Ok(Command::Inbox),
        "help" => Ok(Command::Help),
        "exit" | "quit" => Ok(Command::Exit),
        other => Err(ParseError::Unknown(other.to_string())),
    }
}

/// Register, print help, then run until `exit`, EOF or Ctrl+C.
pub async fn run(
    runtime: PeerRuntime,
    mut events: mpsc::UnboundedReceiver<PeerEvent>,
) -> anyhow::Result<()> {
    println!(
        "[SYSTEM] started as '{}' at {}:{}",
        runtime.username(),
        runtime.advertise_ip(),
        runtime.local_addr().port()
    );
    match runtime.register().await {
        Ok(()) => println!("[TRACKER] Registered successfully."),
        Err(e) => println!("[TRACKER] Registration failed: {}", e),
    }
    println!("{}", HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Command::Exit) => break,
                    Ok(cmd) => execute(&runtime, cmd).await,
                    Err(e) => report_parse_error(&runtime, e).await,
                }
                prompt();
            }
            Some(event) = events.recv() => {
                print_event(&event);
                prompt();
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    runtime.stop();
    println!("Bye!");
    Ok(())
}

async fn execute(runtime: &PeerRuntime, cmd: Command) {
    match cmd {
        Command::List => print_list(runtime).await,
        Command::Join(name) => match runtime.join_channel(&name).await {
            Ok(JoinOutcome::Created) => println!("[CHANNEL] Created and joined channel '{}'", name),
            Ok(JoinOutcome::Joined) => println!("[CHANNEL] Joined channel '{}'", name),
            Err(e) => println!("[CHANNEL] Failed to join: {}", e),
        },
        Command::Connect { user, ip, port } => {
            if let Err(e) = runtime.connect(&user, &ip, port).await {
                println!("[P2P] {}", e);
            }
        }
        Command::ConnectAll => match runtime.connect_all().await {
            Ok(n) => println!("[P2P] Opened {} new connection(s)", n),
            Err(e) => println!("[P2P] {}", e),
        },
        Command::Send { user, body } => match runtime.send_direct(&user, &body).await {
            Ok(()) => println!("[Me -> {}]: {}", user, body),
            Err(e) => println!("[ERROR] {}", e),
        },
        Command::Broadcast(body) => {
            let peers = runtime.connected_peers().await;
            if peers.is_empty() {
                println!("[INFO] No peers connected.");
                return;
            }
            let sent = runtime.broadcast(&body).await;
            println!("[Broadcast -> {}/{} peers]: {}", sent, peers.len(), body);
        }
        Command::Post { target, body } => match runtime.post(&target, &body).await {
            Ok(()) => println!("[TRACKER] Queued for {}", target),
            Err(e) => println!("[TRACKER] {}", e),
        },
        Command::Inbox => match runtime.inbox().await {
            Ok(messages) if messages.is_empty() => println!("[TRACKER] No new messages."),
            Ok(messages) => {
                for m in messages {
                    match m.channel {
                        Some(ch) => println!("[{}] {}: {}", ch, m.sender, m.body),
                        None => println!("[{}]: {}", m.sender, m.body),
                    }
                }
            }
            Err(e) => println!("[TRACKER] {}", e),
        },
        Command::Help => println!("{}", HELP),
        Command::Exit => {}
    }
}

async fn report_parse_error(runtime: &PeerRuntime, err: ParseError) {
    match err {
        ParseError::Empty => {}
        ParseError::Usage(usage) => println!("{}", usage),
        ParseError::ConnectUsage => {
            println!("Usage: connect <username> <ip> <port>");
            print_list(runtime).await;
        }
        ParseError::InvalidPort(p) => println!("Invalid port: {}", p),
        ParseError::Unknown(_) => println!("Unknown command. Type 'help'."),
    }
}

async fn print_list(runtime: &PeerRuntime) {
    match runtime.peer_list().await {
        Ok(dir) => {
            println!("\n--- AVAILABLE PEERS & CHANNELS ---");
            for (id, addr) in &dir.peers {
                println!("peer    {:<16} {}", id, addr);
            }
            for (name, count) in &dir.lists {
                println!("channel {:<16} {} member(s)", name, count);
            }
            println!("----------------------------------");
        }
        Err(e) => println!("[TRACKER] {}", e),
    }
}

fn print_event(event: &PeerEvent) {
    match event {
        PeerEvent::Connected {
            username,
            addr,
            inbound,
        } => {
            let dir = if *inbound { "from" } else { "to" };
            println!("\n[P2P] Connected with peer: {} ({} {})", username, dir, addr);
        }
        PeerEvent::Message { from, body } => println!("\n[Message from {}]: {}", from, body),
        PeerEvent::Disconnected { username } => println!("\n[P2P] Peer {} disconnected.", username),
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
