//! Veilnet - peer-to-peer secret network node.
//!
//! This binary module is intentionally small: it parses CLI arguments,
//! loads (or generates) the node's RSA identity and drives the engine from
//! a plain stdin console. Events coming back from the engine are printed by
//! a separate thread so incoming traffic never waits on the prompt.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use veilnet::auth::{derive_session_user, MemoryTrustStore, NodeIdentity, Operator, TrustedUser};
use veilnet::error::Result;
use veilnet::server::{ServerConfig, ServerContext};
use veilnet::types::{ProgressFn, ServerEvent};
use veilnet::{client, utils};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node and drive it from the console.
    Run {
        /// Port to listen on (0 picks a free one)
        #[arg(value_parser)]
        port: u16,
        /// Display name announced to peers (defaults to the OS user name)
        #[arg(long)]
        name: Option<String>,
        /// Encrypted identity key file; generated when missing
        #[arg(long)]
        key_file: Option<String>,
        /// Directory received files are written to
        #[arg(long, default_value = ".")]
        downloads: PathBuf,
    },
    /// Generate an encrypted identity key file without starting a node.
    Keygen {
        /// Where to write the key file
        #[arg(value_parser)]
        path: String,
    },
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    };
    env_logger::Builder::from_default_env().filter_level(level).init();

    match cli.command {
        Commands::Run {
            port,
            name,
            key_file,
            downloads,
        } => {
            if let Err(e) = run_node(port, name, key_file, downloads) {
                eprintln!("{}", e);
                std::process::exit(1);
            }
        }
        Commands::Keygen { path } => cmd_keygen(&path),
    }
}

fn cmd_keygen(path: &str) {
    let password = match rpassword::prompt_password("key file password: ") {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };
    let outcome = NodeIdentity::generate().and_then(|identity| {
        identity.store_encrypted(path, &password)?;
        Ok(identity)
    });
    match outcome {
        Ok(identity) => println!(
            "wrote {} (key {})",
            path,
            utils::key_fingerprint(&identity.public_der)
        ),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    }
}

fn load_identity(key_file: Option<&str>) -> Result<NodeIdentity> {
    match key_file {
        None => NodeIdentity::generate(),
        Some(path) if Path::new(path).exists() => {
            let password = rpassword::prompt_password("key file password: ")?;
            NodeIdentity::load_encrypted(path, &password)
        }
        Some(path) => {
            let password = rpassword::prompt_password("new key file password: ")?;
            let identity = NodeIdentity::generate()?;
            identity.store_encrypted(path, &password)?;
            println!("wrote new identity to {}", path);
            Ok(identity)
        }
    }
}

fn run_node(
    port: u16,
    name: Option<String>,
    key_file: Option<String>,
    downloads: PathBuf,
) -> Result<()> {
    let identity = load_identity(key_file.as_deref())?;
    println!("node key {}", utils::key_fingerprint(&identity.public_der));

    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        for event in rx {
            print_event(&event);
        }
    });

    let operator = Arc::new(ConsoleOperator::default());
    let config = ServerConfig {
        name: name.unwrap_or_else(whoami::username),
        port,
        download_dir: downloads,
    };
    let ctx = ServerContext::start(
        config,
        identity,
        Arc::new(MemoryTrustStore::new()),
        Arc::clone(&operator) as Arc<dyn Operator>,
        tx,
    )?;
    ctx.set_progress(progress_bars());

    console_loop(&ctx, &operator);

    ctx.stop();
    ctx.close_all(true);
    println!("veilnet closed.");
    Ok(())
}

fn print_event(event: &ServerEvent) {
    let stamp = chrono::Local::now().format("%H:%M:%S");
    match event {
        ServerEvent::Started { port } => println!("[{}] listening on port {}", stamp, port),
        ServerEvent::Stopped => println!("[{}] listener stopped", stamp),
        ServerEvent::PeerConnected { id, name, addr } => {
            println!("[{}] peer {} '{}' connected from {}", stamp, id, name, addr)
        }
        ServerEvent::PeerClosed { id, name } => {
            println!("[{}] peer {} '{}' disconnected", stamp, id, name)
        }
        ServerEvent::Message { from, text } => println!("[{}] {} > {}", stamp, from, text),
        ServerEvent::FileReceived { from, path, len } => println!(
            "[{}] received {} ({} bytes) from {}",
            stamp,
            path.display(),
            len,
            from
        ),
        ServerEvent::TrustEstablished { peer, user } => {
            println!("[{}] trusting user '{}' via {}", stamp, user, peer)
        }
        ServerEvent::TrustRevoked { peer } => {
            println!("[{}] trust session with {} ended", stamp, peer)
        }
    }
}

/// One progress bar per receiving transfer, keyed by file name.
fn progress_bars() -> ProgressFn {
    let bars: Mutex<HashMap<String, ProgressBar>> = Mutex::new(HashMap::new());
    Arc::new(move |name, done, total| {
        let mut bars = bars.lock().unwrap();
        let bar = bars.entry(name.to_string()).or_insert_with(|| {
            let bar = ProgressBar::new(total);
            bar.set_style(
                ProgressStyle::default_bar()
                    .template("{msg} [{bar:40}] {bytes}/{total_bytes}")
                    .unwrap(),
            );
            bar.set_message(name.to_string());
            bar
        });
        bar.set_position(done);
        if done >= total {
            bar.finish_and_clear();
            bars.remove(name);
        }
    })
}

/// A trust request parked until the console answers it.
struct TrustPrompt {
    peer: String,
    user: String,
    decision: Mutex<Option<bool>>,
}

/// Operator backed by the console: requests queue up, `accept`/`deny`
/// resolve the oldest one.
#[derive(Default)]
struct ConsoleOperator {
    pending: Mutex<VecDeque<Arc<TrustPrompt>>>,
}

impl ConsoleOperator {
    fn resolve(&self, accepted: bool) -> Option<Arc<TrustPrompt>> {
        let prompt = self.pending.lock().unwrap().pop_front()?;
        *prompt.decision.lock().unwrap() = Some(accepted);
        Some(prompt)
    }
}

impl Operator for ConsoleOperator {
    fn approve_user(&self, peer: &str, user: &TrustedUser, cancelled: &dyn Fn() -> bool) -> bool {
        let prompt = Arc::new(TrustPrompt {
            peer: peer.to_string(),
            user: user.name.clone(),
            decision: Mutex::new(None),
        });
        println!(
            "peer '{}' asks to exchange user traffic as '{}'. type accept or deny.",
            peer, user.name
        );
        self.pending.lock().unwrap().push_back(Arc::clone(&prompt));
        loop {
            if let Some(decision) = *prompt.decision.lock().unwrap() {
                return decision;
            }
            if cancelled() {
                self.pending
                    .lock()
                    .unwrap()
                    .retain(|p| !Arc::ptr_eq(p, &prompt));
                return false;
            }
            thread::sleep(Duration::from_millis(100));
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  open <host> <port>      Connect to a peer");
    println!("  close <peer>            Close a connection (with farewell)");
    println!("  msg <peer> <text>       Send a message to one peer");
    println!("  say <text>              Send a message to every peer");
    println!("  send <peer> <path>      Send a file");
    println!("  name <new>              Rename this node and tell every peer");
    println!("  login <user>            Open a local user session (asks for a password)");
    println!("  logout                  Drop the local user session");
    println!("  trust <peer>            Ask a peer to accept our logged-in user");
    println!("  untrust <peer>          End the user-trust session with a peer");
    println!("  accept / deny           Answer the oldest pending trust request");
    println!("  encrypt <on|off>        Switch the outbound send policy");
    println!("  list                    Show live connections");
    println!("  help                    Show this help");
    println!("  quit                    Close everything and exit");
    println!();
}

fn console_loop(ctx: &Arc<ServerContext>, operator: &ConsoleOperator) {
    print_help();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        let _ = stdout.flush();
        let mut input = String::new();
        match stdin.read_line(&mut input) {
            Ok(0) => break,
            Ok(_) => {}
            Err(_) => break,
        }
        let input = input.trim();
        if input.is_empty() {
            continue;
        }
        let (cmd, arg) = match input.split_once(' ') {
            Some((c, a)) => (c, a.trim()),
            None => (input, ""),
        };
        let outcome = match cmd {
            "open" => cmd_open(ctx, arg),
            "close" => cmd_close(ctx, arg),
            "msg" => cmd_msg(ctx, arg),
            "say" if !arg.is_empty() => {
                ctx.broadcast(arg);
                Ok(())
            }
            "send" => cmd_send(ctx, arg),
            "name" if !arg.is_empty() => ctx.announce_name(arg),
            "login" if !arg.is_empty() => cmd_login(ctx, arg),
            "logout" => {
                ctx.logout();
                Ok(())
            }
            "trust" if !arg.is_empty() => ctx.request_user_trust(arg),
            "untrust" if !arg.is_empty() => ctx.end_user_trust(arg),
            "accept" | "deny" => {
                match operator.resolve(cmd == "accept") {
                    Some(prompt) => {
                        println!("{} user '{}' from peer '{}'", cmd, prompt.user, prompt.peer)
                    }
                    None => println!("no pending trust request"),
                }
                Ok(())
            }
            "encrypt" => {
                match arg {
                    "on" => ctx.set_encrypted(true),
                    "off" => ctx.set_encrypted(false),
                    _ => println!("usage: encrypt <on|off>"),
                }
                Ok(())
            }
            "list" => {
                cmd_list(ctx);
                Ok(())
            }
            "help" => {
                print_help();
                Ok(())
            }
            "quit" | "exit" => break,
            _ => {
                println!("unknown command, type 'help'");
                Ok(())
            }
        };
        if let Err(e) = outcome {
            println!("error: {}", e);
        }
    }
}

fn cmd_open(ctx: &Arc<ServerContext>, arg: &str) -> Result<()> {
    let (host, port) = match arg.split_once(' ') {
        Some((h, p)) => (h, p.trim()),
        None => {
            println!("usage: open <host> <port>");
            return Ok(());
        }
    };
    match port.parse::<u16>() {
        Ok(port) => client::open(ctx, host, port).map(|_| ()),
        Err(_) => {
            println!("usage: open <host> <port>");
            Ok(())
        }
    }
}

fn cmd_close(ctx: &Arc<ServerContext>, arg: &str) -> Result<()> {
    match ctx.find_by_name(arg) {
        Some(conn) => {
            ctx.close_connection(conn.id(), true);
        }
        None => println!("no peer named '{}'", arg),
    }
    Ok(())
}

fn cmd_msg(ctx: &Arc<ServerContext>, arg: &str) -> Result<()> {
    match arg.split_once(' ') {
        Some((peer, text)) if !text.trim().is_empty() => ctx.send_message(peer, text.trim()),
        _ => {
            println!("usage: msg <peer> <text>");
            Ok(())
        }
    }
}

fn cmd_send(ctx: &Arc<ServerContext>, arg: &str) -> Result<()> {
    match arg.split_once(' ') {
        Some((peer, path)) if !path.trim().is_empty() => {
            ctx.send_file_to(peer, Path::new(path.trim()))
        }
        _ => {
            println!("usage: send <peer> <path>");
            Ok(())
        }
    }
}

fn cmd_login(ctx: &Arc<ServerContext>, name: &str) -> Result<()> {
    let password = rpassword::prompt_password(format!("password for '{}': ", name))?;
    ctx.login(derive_session_user(name, &password));
    Ok(())
}

fn cmd_list(ctx: &Arc<ServerContext>) {
    let connections = ctx.connections();
    if connections.is_empty() {
        println!("no connections");
        return;
    }
    for conn in connections {
        let (ip, port) = conn.peer_addr();
        let user = conn
            .logged_user()
            .map(|u| format!(" user '{}'", u.name))
            .unwrap_or_default();
        println!(
            "  {:>3}  {:<16} {}:{}  {:?}  key {}{}",
            conn.id(),
            conn.peer_name(),
            ip,
            port,
            conn.state(),
            conn.key_fingerprint(),
            user
        );
    }
}
