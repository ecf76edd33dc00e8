use crate::shutdown::ShutdownListener;
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const MAX_COMMAND_LEN: usize = 4096;
/// Consecutive faults after which they are reported as errors.
const REPEATED_FAULTS: u32 = 3;

pub trait ClientEndpoint: Send {
    /// Non-blocking receive; `WouldBlock` when nothing is waiting.
    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<PathBuf>)>;
    fn try_send_to(&mut self, buf: &[u8], target: &Path) -> io::Result<usize>;
}

pub struct UnixEndpoint {
    socket: UnixDatagram,
}

impl UnixEndpoint {
    /// Bind at `path`, replacing a stale socket file left by a previous run.
    pub fn bind(path: &Path) -> io::Result<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(?path, "removed stale client socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }
}

impl ClientEndpoint for UnixEndpoint {
    fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<PathBuf>)> {
        let (n, addr) = self.socket.recv_from(buf)?;
        Ok((n, addr.as_pathname().map(Path::to_path_buf)))
    }

    fn try_send_to(&mut self, buf: &[u8], target: &Path) -> io::Result<usize> {
        self.socket.send_to(buf, target)
    }
}

type Binder<E> = Box<dyn FnMut(&Path) -> io::Result<E> + Send>;

pub struct ClientGateway<E: ClientEndpoint> {
    path: PathBuf,
    binder: Binder<E>,
    endpoint: Option<E>,
    // Set once a bind succeeds; the socket file may outlive a faulted endpoint.
    owns_path: bool,
    reply_to: Option<PathBuf>,
    faults: u32,
    buf: Vec<u8>,
}

impl ClientGateway<UnixEndpoint> {
    pub fn bind(path: &Path) -> Self {
        Self::with_binder(path, Box::new(|p: &Path| UnixEndpoint::bind(p)))
    }
}

/// The client went away or cannot take more; the reply is simply lost.
fn client_gone(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::PermissionDenied
    )
}

impl<E: ClientEndpoint> ClientGateway<E> {
    pub fn with_binder(path: &Path, binder: Binder<E>) -> Self {
        let mut gateway = Self {
            path: path.to_path_buf(),
            binder,
            endpoint: None,
            owns_path: false,
            reply_to: None,
            faults: 0,
            buf: vec![0; MAX_COMMAND_LEN],
        };
        gateway.recreate();
        gateway
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.endpoint.is_some()
    }

    pub fn consecutive_faults(&self) -> u32 {
        self.faults
    }

    fn report_fault(&mut self, what: &str, err: &io::Error) {
        self.faults += 1;
        if self.faults >= REPEATED_FAULTS {
            error!(path = ?self.path, faults = self.faults, "{what}: {err}");
        } else {
            warn!(path = ?self.path, "{what}: {err}");
        }
    }

    fn recreate(&mut self) {
        self.endpoint = None;
        match (self.binder)(&self.path) {
            Ok(endpoint) => {
                info!(path = ?self.path, "client socket ready");
                self.endpoint = Some(endpoint);
                self.owns_path = true;
            }
            Err(e) => self.report_fault("failed to create client socket", &e),
        }
    }

    /// Next pending command, if any. Never blocks.
    pub fn poll(&mut self) -> Option<String> {
        if self.endpoint.is_none() {
            self.recreate();
        }
        let endpoint = self.endpoint.as_mut()?;
        match endpoint.try_recv_from(&mut self.buf) {
            Ok((n, from)) => {
                self.faults = 0;
                if from.is_none() {
                    debug!("command from an unbound client, its reply will be dropped");
                }
                self.reply_to = from;
                Some(String::from_utf8_lossy(&self.buf[..n]).into_owned())
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                self.report_fault("client socket receive failed", &e);
                self.endpoint = None;
                None
            }
        }
    }

    /// Best-effort reply to the sender of the last command.
    pub fn reply(&mut self, text: &str) {
        let Some(target) = self.reply_to.as_deref() else {
            debug!("no client to reply to, reply dropped");
            return;
        };
        let Some(endpoint) = self.endpoint.as_mut() else {
            debug!("client socket down, reply dropped");
            return;
        };
        match endpoint.try_send_to(text.as_bytes(), target) {
            Ok(_) => {}
            Err(e) if client_gone(&e) => debug!(?target, "client unreachable, reply dropped: {e}"),
            Err(e) => {
                self.report_fault("client socket send failed", &e);
                self.endpoint = None;
            }
        }
    }

    /// Release the endpoint and its filesystem name.
    pub fn close(&mut self) {
        self.endpoint = None;
        if std::mem::take(&mut self.owns_path) {
            match std::fs::remove_file(&self.path) {
                Ok(()) => info!(path = ?self.path, "client socket closed"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(path = ?self.path, "failed to remove client socket: {e}"),
            }
        }
    }
}

impl<E: ClientEndpoint> Drop for ClientGateway<E> {
    fn drop(&mut self) {
        self.close();
    }
}

/// Gateway role: forward commands to the dispatcher and replies back to clients.
pub async fn client_task<E: ClientEndpoint>(
    mut gateway: ClientGateway<E>,
    commands: mpsc::Sender<String>,
    mut replies: mpsc::Receiver<String>,
    reply_wait: Duration,
    mut shutdown: ShutdownListener,
) -> anyhow::Result<()> {
    info!(path = ?gateway.path(), "client gateway started");
    while !shutdown.is_triggered() {
        if let Some(command) = gateway.poll() {
            debug!(command = command.trim_end(), "command received");
            if commands.send(command).await.is_err() {
                if shutdown.is_triggered() {
                    break;
                }
                anyhow::bail!("dispatcher stopped taking commands");
            }
        }

        let reply = tokio::select! {
            _ = shutdown.triggered() => break,
            reply = tokio::time::timeout(reply_wait, replies.recv()) => reply,
        };
        match reply {
            Ok(Some(text)) => gateway.reply(&text),
            Ok(None) => {
                if shutdown.is_triggered() {
                    break;
                }
                anyhow::bail!("dispatcher reply channel closed");
            }
            Err(_elapsed) => {}
        }
    }
    gateway.close();
    info!(
        faults = gateway.consecutive_faults(),
        "client gateway stopped"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownSignal;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("cdh-gw-{}-{name}", std::process::id()))
    }

    #[derive(Default)]
    struct FakeNet {
        inbound: VecDeque<(String, PathBuf)>,
        sent: Vec<(String, PathBuf)>,
        fail_next_send: Option<io::ErrorKind>,
        fail_binds: u32,
        binds: u32,
    }

    struct FakeEndpoint(Arc<Mutex<FakeNet>>);

    impl ClientEndpoint for FakeEndpoint {
        fn try_recv_from(&mut self, buf: &mut [u8]) -> io::Result<(usize, Option<PathBuf>)> {
            let mut net = self.0.lock().unwrap();
            match net.inbound.pop_front() {
                Some((text, from)) => {
                    buf[..text.len()].copy_from_slice(text.as_bytes());
                    Ok((text.len(), Some(from)))
                }
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }

        fn try_send_to(&mut self, buf: &[u8], target: &Path) -> io::Result<usize> {
            let mut net = self.0.lock().unwrap();
            if let Some(kind) = net.fail_next_send.take() {
                return Err(kind.into());
            }
            net.sent
                .push((String::from_utf8_lossy(buf).into_owned(), target.to_path_buf()));
            Ok(buf.len())
        }
    }

    fn fake_gateway() -> (ClientGateway<FakeEndpoint>, Arc<Mutex<FakeNet>>) {
        let net = Arc::new(Mutex::new(FakeNet::default()));
        let shared = Arc::clone(&net);
        let gateway = ClientGateway::with_binder(
            &temp_path("fake.sock"),
            Box::new(move |_: &Path| {
                let mut state = shared.lock().unwrap();
                if state.fail_binds > 0 {
                    state.fail_binds -= 1;
                    return Err(io::ErrorKind::AddrInUse.into());
                }
                state.binds += 1;
                Ok(FakeEndpoint(Arc::clone(&shared)))
            }),
        );
        (gateway, net)
    }

    #[test]
    fn replies_go_to_the_latest_sender() {
        let (mut gw, net) = fake_gateway();
        net.lock().unwrap().inbound.push_back(("help".into(), "/tmp/a".into()));
        net.lock().unwrap().inbound.push_back(("setOpmode 1".into(), "/tmp/b".into()));

        assert_eq!(gw.poll().as_deref(), Some("help"));
        gw.reply("first");
        assert_eq!(gw.poll().as_deref(), Some("setOpmode 1"));
        gw.reply("second");
        assert_eq!(gw.poll(), None);

        let sent = net.lock().unwrap().sent.clone();
        assert_eq!(
            sent,
            vec![
                ("first".to_string(), PathBuf::from("/tmp/a")),
                ("second".to_string(), PathBuf::from("/tmp/b")),
            ]
        );
    }

    #[test]
    fn send_fault_recreates_endpoint_before_next_poll() {
        let (mut gw, net) = fake_gateway();
        net.lock().unwrap().inbound.push_back(("help".into(), "/tmp/a".into()));
        assert_eq!(gw.poll().as_deref(), Some("help"));

        net.lock().unwrap().fail_next_send = Some(io::ErrorKind::Other);
        gw.reply("lost");
        assert!(!gw.is_open());
        assert_eq!(gw.consecutive_faults(), 1);

        net.lock().unwrap().inbound.push_back(("setOpmode 2".into(), "/tmp/a".into()));
        assert_eq!(gw.poll().as_deref(), Some("setOpmode 2"));
        assert!(gw.is_open());
        assert_eq!(net.lock().unwrap().binds, 2);
        assert_eq!(gw.consecutive_faults(), 0);
    }

    #[test]
    fn vanished_client_is_not_a_fault() {
        let (mut gw, net) = fake_gateway();
        net.lock().unwrap().inbound.push_back(("help".into(), "/tmp/gone".into()));
        gw.poll();
        net.lock().unwrap().fail_next_send = Some(io::ErrorKind::ConnectionRefused);
        gw.reply("nobody home");
        assert!(gw.is_open());
        assert_eq!(gw.consecutive_faults(), 0);
    }

    #[test]
    fn failed_bind_is_retried_on_poll() {
        let net = Arc::new(Mutex::new(FakeNet {
            fail_binds: 2,
            ..FakeNet::default()
        }));
        let shared = Arc::clone(&net);
        let mut gw = ClientGateway::with_binder(
            &temp_path("retry.sock"),
            Box::new(move |_: &Path| {
                let mut state = shared.lock().unwrap();
                if state.fail_binds > 0 {
                    state.fail_binds -= 1;
                    return Err(io::ErrorKind::AddrInUse.into());
                }
                state.binds += 1;
                Ok(FakeEndpoint(Arc::clone(&shared)))
            }),
        );
        assert!(!gw.is_open());
        assert_eq!(gw.poll(), None);
        assert!(!gw.is_open());
        assert_eq!(gw.consecutive_faults(), 2);
        assert_eq!(gw.poll(), None);
        assert!(gw.is_open());
    }

    #[test]
    fn reply_without_a_sender_is_dropped() {
        let (mut gw, net) = fake_gateway();
        gw.reply("orphan");
        assert!(net.lock().unwrap().sent.is_empty());
    }

    #[test]
    fn unix_endpoint_round_trip_and_cleanup() {
        let server_path = temp_path("server.sock");
        let client_path = temp_path("client.sock");
        std::fs::write(&server_path, b"stale").unwrap();
        let _ = std::fs::remove_file(&client_path);

        let mut gw = ClientGateway::bind(&server_path);
        assert!(gw.is_open());

        let client = UnixDatagram::bind(&client_path).unwrap();
        client.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        client.send_to(b"help", &server_path).unwrap();

        assert_eq!(gw.poll().as_deref(), Some("help"));
        gw.reply("Available commands\n");
        let mut buf = [0u8; 64];
        let n = client.recv(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"Available commands\n");

        drop(gw);
        assert!(!server_path.exists());
        let _ = std::fs::remove_file(&client_path);
    }

    #[test]
    fn close_after_fault_still_removes_socket_file() {
        let path = temp_path("faulted.sock");
        let mut gw = ClientGateway::bind(&path);
        assert!(path.exists());

        // endpoint state after a failed send or receive
        gw.endpoint = None;
        gw.close();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn client_task_forwards_commands_and_replies() {
        let (gw, net) = fake_gateway();
        net.lock().unwrap().inbound.push_back(("help".into(), "/tmp/op".into()));

        let (cmd_tx, mut cmd_rx) = mpsc::channel(4);
        let (reply_tx, reply_rx) = mpsc::channel(4);
        let signal = ShutdownSignal::new();
        let task = tokio::spawn(client_task(
            gw,
            cmd_tx,
            reply_rx,
            Duration::from_millis(10),
            signal.listener(),
        ));

        let cmd = tokio::time::timeout(Duration::from_secs(1), cmd_rx.recv())
            .await
            .unwrap();
        assert_eq!(cmd.as_deref(), Some("help"));
        reply_tx.send("listing\n".into()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), async {
            while net.lock().unwrap().sent.is_empty() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(net.lock().unwrap().sent[0].0, "listing\n");

        signal.trigger();
        task.await.unwrap().unwrap();
    }
}
