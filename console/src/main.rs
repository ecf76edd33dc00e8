use anyhow::Context;
use cdh_shared::command::split_keyword;
use clap::Parser;
use std::io::{self, BufRead, Write};
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const MAX_REPLY_LEN: usize = 8192;

#[derive(Parser, Debug)]
#[command(name = "cdhctl")]
#[command(about = "Send commands to the CDH daemon and print its replies")]
#[command(author, version, long_about = None)]
struct Cli {
    /// Daemon client socket
    #[arg(long, env = "CDH_CLIENT_SOCKET", default_value = "/tmp/CDH.sock")]
    socket: PathBuf,

    /// How long to wait for each reply
    #[arg(long, default_value_t = 2000)]
    timeout_ms: u64,

    /// Command to send, e.g. `setOpmode 2`. Without one, commands are read
    /// from stdin, one per line.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

/// A bound client endpoint talking to one daemon socket.
struct Console {
    socket: UnixDatagram,
    own_path: PathBuf,
    daemon: PathBuf,
}

impl Console {
    fn connect(daemon: &Path, own_path: PathBuf, timeout: Duration) -> anyhow::Result<Self> {
        let _ = std::fs::remove_file(&own_path);
        let socket = UnixDatagram::bind(&own_path)
            .with_context(|| format!("failed to bind reply socket {own_path:?}"))?;
        socket.set_read_timeout(Some(timeout))?;
        debug!(?own_path, "reply socket bound");
        Ok(Self {
            socket,
            own_path,
            daemon: daemon.to_path_buf(),
        })
    }

    fn send(&self, command: &str) -> anyhow::Result<String> {
        self.socket
            .send_to(command.as_bytes(), &self.daemon)
            .with_context(|| format!("CDH daemon not reachable at {:?}", self.daemon))?;
        let mut buf = vec![0u8; MAX_REPLY_LEN];
        let n = match self.socket.recv(&mut buf) {
            Ok(n) => n,
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                anyhow::bail!("no reply from the CDH daemon");
            }
            Err(e) => return Err(e).context("failed to read reply"),
        };
        Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.own_path);
    }
}

fn default_reply_path() -> PathBuf {
    std::env::temp_dir().join(format!("cdhctl-{}.sock", std::process::id()))
}

fn interactive(console: &Console) -> anyhow::Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    for line in stdin.lock().lines() {
        let line = line?;
        match split_keyword(&line) {
            None => {}
            Some(("quit" | "exit", _)) => break,
            Some(_) => match console.send(line.trim()) {
                Ok(reply) => write!(stdout, "{reply}")?,
                Err(e) => writeln!(stdout, "{e:#}")?,
            },
        }
        write!(stdout, "> ")?;
        stdout.flush()?;
    }
    Ok(())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let console = Console::connect(
        &cli.socket,
        default_reply_path(),
        Duration::from_millis(cli.timeout_ms),
    )?;

    if cli.command.is_empty() {
        return interactive(&console);
    }
    let reply = console.send(&cli.command.join(" "))?;
    print!("{reply}");
    if reply.starts_with("ERROR:") {
        // Drop does not run across process::exit.
        drop(console);
        std::process::exit(2);
    }
    Ok(())
}
