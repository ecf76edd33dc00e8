// ======================================================================
//  Telemetry sink
// ======================================================================
//
// publish() never waits; one delivery task drains to the monitor and the local log.

use crate::ring_buffer::RingBuffer;
use crate::shutdown::ShutdownListener;
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

const DROP_REPORT_INTERVAL: Duration = Duration::from_secs(1);
const LOCAL_LOG_RETRIES: usize = 2;
const LOCAL_LOG_RETRY_DELAY_MS: u64 = 50;

struct Pending {
    lines: RingBuffer<String>,
    last_drop_report: Option<Instant>,
}

struct SinkQueue {
    pending: Mutex<Pending>,
    ready: Notify,
    dropped: AtomicU64,
}

impl SinkQueue {
    fn pending(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Producer handle; cheap to clone into every role that emits telemetry.
#[derive(Clone)]
pub struct TelemetrySink {
    queue: Arc<SinkQueue>,
}

/// Consumer side, owned by the delivery task.
pub struct TelemetryQueue {
    queue: Arc<SinkQueue>,
}

pub fn telemetry_channel(capacity: usize) -> (TelemetrySink, TelemetryQueue) {
    let queue = Arc::new(SinkQueue {
        pending: Mutex::new(Pending {
            lines: RingBuffer::new(capacity),
            last_drop_report: None,
        }),
        ready: Notify::new(),
        dropped: AtomicU64::new(0),
    });
    (
        TelemetrySink {
            queue: Arc::clone(&queue),
        },
        TelemetryQueue { queue },
    )
}

impl TelemetrySink {
    /// Enqueue one line, evicting the oldest queued line when full.
    pub fn publish(&self, line: String) {
        {
            let mut pending = self.queue.pending();
            if pending.lines.push(line).is_some() {
                let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let due = pending
                    .last_drop_report
                    .is_none_or(|at| at.elapsed() >= DROP_REPORT_INTERVAL);
                if due {
                    pending.last_drop_report = Some(Instant::now());
                    warn!(dropped, "telemetry queue full, dropping oldest lines");
                }
            }
        }
        self.queue.ready.notify_one();
    }
}

impl TelemetryQueue {
    /// Oldest queued line, waiting at most `wait` for one to arrive.
    pub async fn pop(&self, wait: Duration) -> Option<String> {
        if let Some(line) = self.queue.pending().lines.pop_oldest() {
            return Some(line);
        }
        let _ = tokio::time::timeout(wait, self.queue.ready.notified()).await;
        self.queue.pending().lines.pop_oldest()
    }

    pub fn len(&self) -> usize {
        self.queue.pending().lines.len()
    }

    /// Lines evicted unsent since startup.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

// ======================================================================
//  Monitoring socket
// ======================================================================

struct MonitorLink {
    path: PathBuf,
    retry: Duration,
    socket: Option<UnixDatagram>,
    last_attempt: Option<Instant>,
}

impl MonitorLink {
    fn new(path: PathBuf, retry: Duration) -> Self {
        Self {
            path,
            retry,
            socket: None,
            last_attempt: None,
        }
    }

    fn connect(path: &Path) -> io::Result<UnixDatagram> {
        let socket = UnixDatagram::unbound()?;
        socket.connect(path)?;
        socket.set_nonblocking(true)?;
        Ok(socket)
    }

    /// At most one connect attempt per retry interval.
    fn ensure_connected(&mut self) {
        if self.socket.is_some() || self.last_attempt.is_some_and(|at| at.elapsed() < self.retry) {
            return;
        }
        self.last_attempt = Some(Instant::now());
        match Self::connect(&self.path) {
            Ok(socket) => {
                info!(path = ?self.path, "connected to monitoring socket");
                self.socket = Some(socket);
            }
            Err(e) => warn!(
                path = ?self.path,
                "monitoring socket unavailable ({e}), retrying in {}s",
                self.retry.as_secs()
            ),
        }
    }

    fn deliver(&mut self, line: &str) {
        let Some(socket) = &self.socket else {
            debug!("monitoring socket down, line not delivered");
            return;
        };
        match socket.send(line.as_bytes()) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                warn!("monitoring socket busy, line dropped");
            }
            Err(e) => {
                warn!(path = ?self.path, "lost monitoring socket: {e}");
                self.socket = None;
                self.last_attempt = Some(Instant::now());
            }
        }
    }
}

// ======================================================================
//  Local SQLite log
// ======================================================================

/// Record name and timestamp of a line, for the indexed columns.
fn split_line(line: &str) -> (&str, i64) {
    let line = line.trim_end();
    let record = line.split([',', ' ']).next().unwrap_or(line);
    let ts = line
        .rsplit_once(' ')
        .and_then(|(_, ts)| ts.parse::<i64>().ok())
        .unwrap_or_default();
    (record, ts)
}

async fn insert_with_retry<F, Fut>(mut f: F) -> Result<(), sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>>,
{
    let mut delay = LOCAL_LOG_RETRY_DELAY_MS;
    let mut attempt = 0;
    loop {
        match f().await {
            Ok(_) => return Ok(()),
            Err(e) if attempt >= LOCAL_LOG_RETRIES => return Err(e),
            Err(_) => {
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(delay)).await;
                delay = (delay * 2).min(1000);
            }
        }
    }
}

async fn open_local_log(path: &Path) -> anyhow::Result<SqlitePool> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)?;
    }
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS telemetry_log (
            id           INTEGER PRIMARY KEY AUTOINCREMENT,
            timestamp_ns INTEGER NOT NULL,
            record_name  TEXT    NOT NULL,
            line         TEXT    NOT NULL
        );
        "#,
    )
    .execute(&pool)
    .await?;

    Ok(pool)
}

struct LocalLog {
    path: PathBuf,
    retry: Duration,
    pool: Option<SqlitePool>,
    last_attempt: Option<Instant>,
}

impl LocalLog {
    fn new(path: PathBuf, retry: Duration) -> Self {
        Self {
            path,
            retry,
            pool: None,
            last_attempt: None,
        }
    }

    async fn ensure_open(&mut self) {
        if self.pool.is_some() || self.last_attempt.is_some_and(|at| at.elapsed() < self.retry) {
            return;
        }
        self.last_attempt = Some(Instant::now());
        match open_local_log(&self.path).await {
            Ok(pool) => {
                info!(path = ?self.path, "local telemetry log open");
                self.pool = Some(pool);
            }
            Err(e) => warn!(
                path = ?self.path,
                "failed to open local telemetry log ({e:#}), retrying in {}s",
                self.retry.as_secs()
            ),
        }
    }

    async fn append(&mut self, line: &str) {
        let Some(pool) = &self.pool else {
            return;
        };
        let (record, ts) = split_line(line);
        let result = insert_with_retry(|| {
            sqlx::query("INSERT INTO telemetry_log (timestamp_ns, record_name, line) VALUES (?, ?, ?)")
                .bind(ts)
                .bind(record)
                .bind(line)
                .execute(pool)
        })
        .await;
        if let Err(e) = result {
            warn!("local telemetry log write failed, closing it: {e}");
            self.close().await;
            self.last_attempt = Some(Instant::now());
        }
    }

    async fn close(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.close().await;
        }
    }
}

// ======================================================================
//  Delivery task
// ======================================================================

#[derive(Debug, Clone)]
pub struct SinkSettings {
    pub monitor_socket_path: PathBuf,
    pub monitor_retry: Duration,
    pub pop_wait: Duration,
    pub local_log_path: Option<PathBuf>,
    pub local_log_retry: Duration,
}

impl From<&crate::config::DaemonConfig> for SinkSettings {
    fn from(cfg: &crate::config::DaemonConfig) -> Self {
        Self {
            monitor_socket_path: cfg.monitor_socket_path.clone(),
            monitor_retry: cfg.monitor_retry(),
            pop_wait: cfg.sink_pop_wait(),
            local_log_path: cfg.local_log_enabled.then(|| cfg.local_log_path.clone()),
            local_log_retry: cfg.local_log_retry(),
        }
    }
}

pub async fn delivery_task(
    settings: SinkSettings,
    queue: TelemetryQueue,
    mut shutdown: ShutdownListener,
) -> anyhow::Result<()> {
    let mut monitor = MonitorLink::new(settings.monitor_socket_path, settings.monitor_retry);
    let mut local = settings
        .local_log_path
        .map(|path| LocalLog::new(path, settings.local_log_retry));
    info!("telemetry sink started");

    while !shutdown.is_triggered() {
        monitor.ensure_connected();
        if let Some(local) = local.as_mut() {
            local.ensure_open().await;
        }

        let line = tokio::select! {
            _ = shutdown.triggered() => break,
            line = queue.pop(settings.pop_wait) => line,
        };
        let Some(line) = line else {
            continue;
        };

        monitor.deliver(&line);
        if let Some(local) = local.as_mut() {
            local.append(&line).await;
        }
    }

    if let Some(mut local) = local {
        local.close().await;
    }
    info!(
        pending = queue.len(),
        dropped = queue.dropped(),
        "telemetry sink stopped"
    );
    Ok(())
}
