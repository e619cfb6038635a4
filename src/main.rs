use std::fs;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::{sleep, Instant};
use tracing_subscriber::{self, filter::LevelFilter, EnvFilter};

use kvlink::cluster::MigrationPlan;
use kvlink::protocol::command;
use kvlink::stream::{TcpByteStream, TcpConnector};
use kvlink::{ClusterClient, NodeClient, RespValue};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LOGO: &str = r#"
  _             _ _       _
 | | ____   __ | (_)_ __ | | __
 | |/ /\ \ / / | | | '_ \| |/ /
 |   <  \ V /  | | | | | |   <
 |_|\_\  \_/   |_|_|_| |_|_|\_\
"#;

/// How long the REPL waits for the reply of one command or for the
/// initial slot map before giving the prompt back.
const STARTUP_WAIT: Duration = Duration::from_secs(5);
const TICK_INTERVAL: Duration = Duration::from_millis(1);

/// Client section of the configuration file
#[derive(Deserialize, Default)]
struct ClientConfig {
    /// Addresses tried for the first connection
    #[serde(default = "default_seeds")]
    seeds: Vec<String>,
    /// Route commands by hash slot across a cluster
    #[serde(default)]
    cluster: bool,
}

fn default_seeds() -> Vec<String> {
    vec!["127.0.0.1:6379".to_string()]
}

/// Timeout section of the configuration file
#[derive(Deserialize, Default)]
struct TimeoutsConfig {
    /// Connect timeout in milliseconds
    #[serde(default = "default_connect_ms")]
    connect_ms: u64,
}

fn default_connect_ms() -> u64 {
    5000
}

/// Logging section of the configuration file
#[derive(Deserialize, Default)]
struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    level: String,
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Root configuration structure
#[derive(Deserialize, Default)]
struct Config {
    #[serde(default)]
    client: ClientConfig,
    #[serde(default)]
    timeouts: TimeoutsConfig,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Command line arguments structure
struct CliArgs {
    config_path: Option<String>,
    addr: Option<String>,
    cluster: bool,
    show_help: bool,
    show_version: bool,
}

fn print_help() {
    println!("{}", LOGO);
    println!("kvlink v{} - RESP client with cluster routing", VERSION);
    println!();
    println!("USAGE:");
    println!("    kvlink [OPTIONS] [ADDRESS]");
    println!();
    println!("OPTIONS:");
    println!("    -c, --config <FILE>    Path to configuration file (TOML format)");
    println!("        --cluster          Route commands by hash slot across a cluster");
    println!("    -h, --help             Print help information");
    println!("    -v, --version          Print version information");
    println!();
    println!("EXAMPLES:");
    println!("    # Connect to a single node (default: 127.0.0.1:6379)");
    println!("    kvlink");
    println!("    kvlink 127.0.0.1:6380");
    println!();
    println!("    # Connect to a cluster through a seed node");
    println!("    kvlink --cluster 127.0.0.1:7001");
    println!();
    println!("    # Start with configuration file");
    println!("    kvlink --config config/kvlink.toml");
    println!();
    println!("REPL COMMANDS:");
    println!("    help                      This list");
    println!("    topology                  Print the current slot map (cluster mode)");
    println!("    migrate <slot> <addr>     Move one slot to another node (cluster mode)");
    println!("    migrate random            Move a random slot to a random node");
    println!("    exit, quit                Leave");
    println!();
    println!("    Anything else is sent to the server as a command.");
    println!();
    println!("CONFIGURATION FILE:");
    println!("    See config/kvlink.toml for a complete configuration template.");
    println!();
    println!("    [client]");
    println!("    seeds = [\"127.0.0.1:6379\"]");
    println!("    cluster = false");
    println!();
    println!("    [timeouts]");
    println!("    connect_ms = 5000");
    println!();
    println!("    [logging]");
    println!("    level = \"warn\"        # trace, debug, info, warn, error");
}

fn print_version() {
    println!("kvlink {}", VERSION);
}

/// Parse command line arguments
fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        config_path: None,
        addr: None,
        cluster: false,
        show_help: false,
        show_version: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                cli.show_help = true;
                return cli;
            }
            "-v" | "--version" => {
                cli.show_version = true;
                return cli;
            }
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    cli.config_path = Some(args[i + 1].clone());
                    i += 1;
                } else {
                    eprintln!("Error: {} requires a file path argument", args[i]);
                    std::process::exit(1);
                }
            }
            "--cluster" => {
                cli.cluster = true;
            }
            arg => {
                if cli.addr.is_none() && arg.contains(':') {
                    cli.addr = Some(arg.to_string());
                } else {
                    eprintln!("Error: Unknown option '{}'. Use --help for usage.", arg);
                    std::process::exit(1);
                }
            }
        }
        i += 1;
    }

    cli
}

/// Load configuration from file and merge with CLI arguments
fn load_config(cli: &CliArgs) -> (Vec<String>, bool, Duration, LoggingConfig) {
    let mut config = Config::default();

    if let Some(ref path) = cli.config_path {
        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<Config>(&content) {
                Ok(cfg) => config = cfg,
                Err(e) => {
                    eprintln!("Failed to parse config file '{}': {}", path, e);
                    std::process::exit(1);
                }
            },
            Err(e) => {
                eprintln!("Failed to read config file '{}': {}", path, e);
                std::process::exit(1);
            }
        }
    }

    // CLI arguments override the config file
    let seeds = match &cli.addr {
        Some(addr) => vec![addr.clone()],
        None => {
            if config.client.seeds.is_empty() {
                default_seeds()
            } else {
                config.client.seeds
            }
        }
    };
    let cluster = cli.cluster || config.client.cluster;
    let connect_timeout = Duration::from_millis(config.timeouts.connect_ms);

    (seeds, cluster, connect_timeout, config.logging)
}

/// The two ways the REPL talks to servers.
enum Session {
    Single {
        addr: String,
        client: NodeClient<TcpByteStream>,
        connect_timeout: Duration,
    },
    Cluster {
        seeds: Vec<String>,
        client: ClusterClient<TcpConnector>,
    },
}

impl Session {
    async fn dispatch(&mut self, request: RespValue) -> kvlink::Result<RespValue> {
        match self {
            Session::Single {
                addr,
                client,
                connect_timeout,
            } => {
                // redis-cli style: quietly reconnect after a dropped
                // connection.
                if !client.is_connected() {
                    let stream = TcpByteStream::connect_with(addr, *connect_timeout).await?;
                    client.attach(stream);
                }
                client.call(&request).await
            }
            Session::Cluster { seeds, client } => {
                if command::request_key(&request).is_some() {
                    client.call(request).await
                } else {
                    // Keyless commands go to any node we know about.
                    let addr = client
                        .topology()
                        .addrs()
                        .next()
                        .map(String::from)
                        .or_else(|| seeds.first().cloned())
                        .ok_or(kvlink::error::ClientError::NotConnected)?;
                    client.call_to(&addr, request).await
                }
            }
        }
    }
}

async fn connect_session(
    seeds: Vec<String>,
    cluster: bool,
    connect_timeout: Duration,
) -> anyhow::Result<Session> {
    if cluster {
        let connector = TcpConnector::with_connect_timeout(connect_timeout);
        let mut client = ClusterClient::new(connector, seeds.clone());
        client.set_push_handler(|value| println!("{}", render(&value)));

        // Tick until the slot map settles; commands queue either way.
        let deadline = Instant::now() + STARTUP_WAIT;
        while !client.is_stable() && Instant::now() < deadline {
            client.update().await;
            sleep(TICK_INTERVAL).await;
        }
        if client.is_stable() {
            println!(
                "Connected to a {}-node cluster.",
                client.topology().len()
            );
        } else {
            println!("Slot map not settled yet; commands will wait for it.");
        }
        Ok(Session::Cluster { seeds, client })
    } else {
        let addr = seeds
            .first()
            .cloned()
            .context("no address to connect to")?;
        let stream = TcpByteStream::connect_with(&addr, connect_timeout)
            .await
            .with_context(|| format!("cannot connect to {addr}"))?;
        let mut client = NodeClient::new();
        client.attach(stream);
        client.set_push_handler(|value| println!("{}", render(&value)));
        println!("Connected to {addr}.");
        Ok(Session::Single {
            addr,
            client,
            connect_timeout,
        })
    }
}

async fn run_repl(mut session: Session) -> anyhow::Result<()> {
    let prompt = match &session {
        Session::Single { addr, .. } => addr.clone(),
        Session::Cluster { .. } => "cluster".to_string(),
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("{prompt}> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line {
            "" => continue,
            "exit" | "quit" => break,
            "help" => {
                print_help();
                continue;
            }
            "topology" => {
                print_topology(&session);
                continue;
            }
            _ if line.starts_with("migrate") => {
                run_migration(&mut session, line).await;
                continue;
            }
            _ => {}
        }

        let request = match command::parse_command_line(line) {
            Ok(request) => request,
            Err(e) => {
                println!("(error) {e}");
                continue;
            }
        };
        match session.dispatch(request).await {
            Ok(reply) => print!("{}", render(&reply)),
            Err(e) => println!("(error) {e}"),
        }
    }
    Ok(())
}

fn print_topology(session: &Session) {
    let Session::Cluster { client, .. } = session else {
        println!("(error) topology is only available in cluster mode");
        return;
    };
    let topology = client.topology();
    if topology.is_empty() {
        println!("(empty)");
        return;
    }
    for (addr, entry) in topology.nodes() {
        let ranges: Vec<String> = entry.ranges.iter().map(ToString::to_string).collect();
        match &entry.id {
            Some(id) => println!("{addr}  {}  {id}", ranges.join(",")),
            None => println!("{addr}  {}", ranges.join(",")),
        }
    }
}

async fn run_migration(session: &mut Session, line: &str) {
    let Session::Cluster { client, .. } = session else {
        println!("(error) migrate is only available in cluster mode");
        return;
    };
    let parts: Vec<&str> = line.split_whitespace().collect();
    let plan = match parts.as_slice() {
        ["migrate", "random"] => match MigrationPlan::random(client.topology()) {
            Some(plan) => plan,
            None => {
                println!("(error) need a stable map with at least two nodes");
                return;
            }
        },
        ["migrate", slot, target] => match slot.parse::<u16>() {
            Ok(slot) => MigrationPlan::new(slot, *target),
            Err(_) => {
                println!("(error) bad slot number '{slot}'");
                return;
            }
        },
        _ => {
            println!("usage: migrate <slot> <addr> | migrate random");
            return;
        }
    };

    println!("migrating slot {} to {} ...", plan.slot, plan.target);
    let done = Arc::new(Mutex::new(None));
    let tx = done.clone();
    client.begin_migration(
        plan,
        Box::new(move |result| {
            *tx.lock().unwrap() = Some(result);
        }),
    );
    loop {
        client.update().await;
        if let Some(result) = done.lock().unwrap().take() {
            match result {
                Ok(()) => println!("OK"),
                Err(e) => println!("(error) {e}"),
            }
            return;
        }
        sleep(TICK_INTERVAL).await;
    }
}

/// Single-line rendering for scalar replies; `None` for aggregates.
fn scalar_repr(value: &RespValue) -> Option<String> {
    match value {
        RespValue::Null => Some("(nil)".to_string()),
        RespValue::SimpleString(s) => Some(s.clone()),
        RespValue::Error(s) => Some(format!("(error) {s}")),
        RespValue::BulkError(s) => Some(format!("(error) {s}")),
        RespValue::Integer(i) => Some(format!("(integer) {i}")),
        RespValue::Double(d) => Some(format!("(double) {d}")),
        RespValue::Boolean(true) => Some("(true)".to_string()),
        RespValue::Boolean(false) => Some("(false)".to_string()),
        RespValue::BigNumber(s) => Some(format!("(big number) {s}")),
        RespValue::BulkString(None) => Some("(nil)".to_string()),
        RespValue::BulkString(Some(data)) => Some(format!("\"{}\"", escape_bulk(data))),
        RespValue::VerbatimString { data, .. } => {
            Some(String::from_utf8_lossy(data).into_owned())
        }
        RespValue::Array(None) => Some("(nil)".to_string()),
        _ => None,
    }
}

fn escape_bulk(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    for &b in data {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            other => out.push_str(&format!("\\x{other:02x}")),
        }
    }
    out
}

/// redis-cli flavored rendering of a full reply tree.
fn render(value: &RespValue) -> String {
    let mut out = String::new();
    format_value(value, 0, &mut out);
    out
}

fn format_value(value: &RespValue, indent: usize, out: &mut String) {
    let pad = "  ".repeat(indent);
    if let Some(line) = scalar_repr(value) {
        out.push_str(&pad);
        out.push_str(&line);
        out.push('\n');
        return;
    }
    match value {
        RespValue::Array(Some(items)) | RespValue::Set(items) => {
            if items.is_empty() {
                out.push_str(&pad);
                out.push_str("(empty)\n");
                return;
            }
            for (i, item) in items.iter().enumerate() {
                match scalar_repr(item) {
                    Some(line) => out.push_str(&format!("{pad}{}) {line}\n", i + 1)),
                    None => {
                        out.push_str(&format!("{pad}{})\n", i + 1));
                        format_value(item, indent + 1, out);
                    }
                }
            }
        }
        RespValue::Push(items) => {
            out.push_str(&pad);
            out.push_str("(push)\n");
            for item in items {
                format_value(item, indent + 1, out);
            }
        }
        RespValue::Map(pairs) => {
            if pairs.is_empty() {
                out.push_str(&pad);
                out.push_str("(empty)\n");
                return;
            }
            for (i, (key, val)) in pairs.iter().enumerate() {
                let key_repr =
                    scalar_repr(key).unwrap_or_else(|| "(aggregate key)".to_string());
                match scalar_repr(val) {
                    Some(line) => {
                        out.push_str(&format!("{pad}{}) {key_repr} => {line}\n", i + 1))
                    }
                    None => {
                        out.push_str(&format!("{pad}{}) {key_repr} =>\n", i + 1));
                        format_value(val, indent + 1, out);
                    }
                }
            }
        }
        RespValue::Attribute { data, .. } => format_value(data, indent, out),
        // Scalars were all handled above.
        _ => {}
    }
}

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let cli = parse_args();

    // Handle help and version
    if cli.show_help {
        print_help();
        return;
    }
    if cli.show_version {
        print_version();
        return;
    }

    // Load configuration
    let (seeds, cluster, connect_timeout, logging_config) = load_config(&cli);

    // Initialize logging with configured level
    let log_level = logging_config.level.to_lowercase();
    let level_filter = log_level.parse::<LevelFilter>().unwrap_or_else(|_| {
        eprintln!(
            "Warning: Invalid log level '{}', using 'warn'",
            logging_config.level
        );
        LevelFilter::WARN
    });
    let filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .init();

    // Print startup banner
    println!("{}", LOGO);
    println!("kvlink v{} - RESP client with cluster routing", VERSION);
    println!();

    let result = match connect_session(seeds, cluster, connect_timeout).await {
        Ok(session) => run_repl(session).await,
        Err(e) => {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
