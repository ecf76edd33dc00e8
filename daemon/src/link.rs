use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("failed to load link driver {path:?}: {source}")]
    Load {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    #[error("link driver is missing symbol `{name}`: {source}")]
    MissingSymbol {
        name: &'static str,
        #[source]
        source: libloading::Error,
    },
    #[error("link initialization failed: {0}")]
    Init(String),
}

// ======================================================================
//  Transport Trait
// ======================================================================
pub trait LinkTransport: Send {
    /// Prepare the link. Returns the largest frame the transport can carry.
    fn initialize(&mut self, timeout: Duration, retries: u8) -> Result<usize, LinkError>;

    /// One transmission. With `ack` set, waits up to the configured timeout
    /// for the peer's acknowledgment and reports whether it arrived.
    fn send(&mut self, frame: &[u8], ack: bool) -> bool;

    /// Copy one pending inbound frame into `buf` without blocking; 0 when idle.
    fn receive(&mut self, buf: &mut [u8]) -> usize;

    fn deinitialize(&mut self);
}

impl<T: LinkTransport + ?Sized> LinkTransport for Box<T> {
    fn initialize(&mut self, timeout: Duration, retries: u8) -> Result<usize, LinkError> {
        (**self).initialize(timeout, retries)
    }

    fn send(&mut self, frame: &[u8], ack: bool) -> bool {
        (**self).send(frame, ack)
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        (**self).receive(buf)
    }

    fn deinitialize(&mut self) {
        (**self).deinitialize()
    }
}

// ======================================================================
//  Link Client
// ======================================================================
pub struct LinkClient<T: LinkTransport> {
    transport: T,
    max_retries: u8,
    rx_buf: Vec<u8>,
}

impl<T: LinkTransport> LinkClient<T> {
    /// Initialize `transport` for single attempts; retries happen here, not in the driver.
    pub fn init(mut transport: T, timeout: Duration, max_retries: u8) -> Result<Self, LinkError> {
        let max_frame_len = transport.initialize(timeout, 0)?;
        if max_frame_len == 0 {
            transport.deinitialize();
            return Err(LinkError::Init("transport reports a zero frame length".into()));
        }
        info!(
            max_frame_len,
            timeout_ms = timeout.as_millis() as u64,
            max_retries,
            "link initialized"
        );
        Ok(Self {
            transport,
            max_retries,
            rx_buf: vec![0; max_frame_len],
        })
    }

    #[cfg(test)]
    fn max_frame_len(&self) -> usize {
        self.rx_buf.len()
    }

    /// Send `frame`, retrying up to `max_retries` times until acknowledged.
    ///
    /// Without `ack_requested` this is a single fire-and-forget attempt.
    pub fn send_with_ack(&mut self, frame: &[u8], ack_requested: bool) -> bool {
        if frame.len() > self.rx_buf.len() {
            warn!(len = frame.len(), max = self.rx_buf.len(), "frame exceeds link maximum, not sent");
            return false;
        }
        if !ack_requested {
            return self.transport.send(frame, false);
        }
        let attempts = 1 + u32::from(self.max_retries);
        for attempt in 1..=attempts {
            if self.transport.send(frame, true) {
                debug!(code = frame.first().copied(), attempt, "frame acknowledged");
                return true;
            }
            debug!(code = frame.first().copied(), attempt, attempts, "no acknowledgment");
        }
        warn!(code = frame.first().copied(), attempts, "frame not acknowledged");
        false
    }

    /// The next inbound frame, or an empty slice when nothing is waiting.
    pub fn receive_nonblocking(&mut self) -> &[u8] {
        let n = self.transport.receive(&mut self.rx_buf).min(self.rx_buf.len());
        &self.rx_buf[..n]
    }

    pub fn shutdown(self) {
        drop(self);
    }
}

impl<T: LinkTransport> Drop for LinkClient<T> {
    fn drop(&mut self) {
        self.transport.deinitialize();
        info!("link closed");
    }
}
