// ======================================================================
//  Simulated link (tests and the `testing` fallback)
// ======================================================================

use crate::link::{LinkError, LinkTransport};
use cdh_shared::catalog::{ATTITUDE_ADCS, HOUSEKEEPING_ADCS, OPMODE_ADCS};
use cdh_shared::{CodecResult, FieldValue, Message, Value};
use rand::RngExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const DUMMY_MAX_FRAME_LEN: usize = 255;
const DUMMY_TELEMETRY_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckBehavior {
    Always,
    Never,
    /// Acknowledge every n-th attempt.
    AfterAttempts(u32),
}

#[derive(Debug)]
struct SimState {
    ack: AckBehavior,
    timeout: Duration,
    attempts_since_ack: u32,
    sent: Vec<Vec<u8>>,
    inbound: VecDeque<Vec<u8>>,
    initialized: bool,
    init_retries: Option<u8>,
    deinit_count: u32,
}

fn lock(state: &Mutex<SimState>) -> MutexGuard<'_, SimState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Test-side view of a [`SimulatedTransport`].
#[derive(Clone)]
pub struct SimHandle(Arc<Mutex<SimState>>);

#[cfg_attr(not(test), allow(dead_code))]
impl SimHandle {
    pub fn set_ack(&self, ack: AckBehavior) {
        lock(&self.0).ack = ack;
    }

    pub fn push_inbound(&self, frame: Vec<u8>) {
        lock(&self.0).inbound.push_back(frame);
    }

    /// Every attempt, in order, retries included.
    pub fn sent_frames(&self) -> Vec<Vec<u8>> {
        lock(&self.0).sent.clone()
    }

    pub fn send_attempts(&self) -> usize {
        lock(&self.0).sent.len()
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.0).initialized
    }

    pub fn init_retries(&self) -> Option<u8> {
        lock(&self.0).init_retries
    }

    pub fn deinit_count(&self) -> u32 {
        lock(&self.0).deinit_count
    }
}

pub struct SimulatedTransport {
    state: Arc<Mutex<SimState>>,
    max_frame_len: usize,
    telemetry_period: Option<Duration>,
    last_telemetry: Instant,
}

impl SimulatedTransport {
    /// A quiet transport that acknowledges everything until told otherwise.
    pub fn new(max_frame_len: usize) -> (Self, SimHandle) {
        let state = Arc::new(Mutex::new(SimState {
            ack: AckBehavior::Always,
            timeout: Duration::ZERO,
            attempts_since_ack: 0,
            sent: Vec::new(),
            inbound: VecDeque::new(),
            initialized: false,
            init_retries: None,
            deinit_count: 0,
        }));
        let transport = Self {
            state: Arc::clone(&state),
            max_frame_len,
            telemetry_period: None,
            last_telemetry: Instant::now(),
        };
        (transport, SimHandle(state))
    }

    /// Stand-in for a missing driver: acks every frame and emits random telemetry.
    pub fn dummy() -> Self {
        let (mut transport, _handle) = Self::new(DUMMY_MAX_FRAME_LEN);
        transport.telemetry_period = Some(DUMMY_TELEMETRY_PERIOD);
        transport
    }
}

impl LinkTransport for SimulatedTransport {
    fn initialize(&mut self, timeout: Duration, retries: u8) -> Result<usize, LinkError> {
        if self.max_frame_len == 0 {
            return Err(LinkError::Init("simulated link has no frame capacity".into()));
        }
        let mut state = lock(&self.state);
        state.timeout = timeout;
        state.init_retries = Some(retries);
        state.initialized = true;
        Ok(self.max_frame_len)
    }

    fn send(&mut self, frame: &[u8], ack: bool) -> bool {
        let (acked, wait) = {
            let mut state = lock(&self.state);
            state.sent.push(frame.to_vec());
            if !ack {
                return true;
            }
            let acked = match state.ack {
                AckBehavior::Always => true,
                AckBehavior::Never => false,
                AckBehavior::AfterAttempts(n) => {
                    state.attempts_since_ack += 1;
                    if state.attempts_since_ack >= n {
                        state.attempts_since_ack = 0;
                        true
                    } else {
                        false
                    }
                }
            };
            (acked, state.timeout)
        };
        if !acked {
            std::thread::sleep(wait);
        }
        acked
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        let frame = lock(&self.state).inbound.pop_front();
        let frame = match frame {
            Some(frame) => frame,
            None => match self.telemetry_period {
                Some(period) if self.last_telemetry.elapsed() >= period => {
                    self.last_telemetry = Instant::now();
                    match random_telemetry_frame() {
                        Ok(frame) => frame,
                        Err(e) => {
                            tracing::warn!("simulated link: failed to build telemetry frame: {e}");
                            return 0;
                        }
                    }
                }
                _ => return 0,
            },
        };
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        n
    }

    fn deinitialize(&mut self) {
        let mut state = lock(&self.state);
        if state.initialized {
            state.initialized = false;
            state.deinit_count += 1;
        }
    }
}

fn f32_array(values: impl IntoIterator<Item = f32>) -> FieldValue {
    FieldValue::Array(values.into_iter().map(Value::F32).collect())
}

/// One plausible ADCS telemetry frame, chosen at random.
pub fn random_telemetry_frame() -> CodecResult<Vec<u8>> {
    let mut rng = rand::rng();
    let msg = match rng.random_range(0..3) {
        0 => {
            // Unit quaternion, small body rates [rad/s], LEO field [T]
            let q: [f32; 4] = std::array::from_fn(|_| rng.random_range(-1.0..1.0));
            let norm = q.iter().map(|v| v * v).sum::<f32>().sqrt().max(f32::EPSILON);
            Message::new(
                &ATTITUDE_ADCS,
                vec![
                    f32_array(q.map(|v| v / norm)),
                    f32_array((0..3).map(|_| rng.random_range(-0.05..0.05))),
                    f32_array((0..3).map(|_| rng.random_range(-5.0e-5..5.0e-5))),
                ],
            )?
        }
        1 => Message::new(
            &HOUSEKEEPING_ADCS,
            vec![
                FieldValue::Scalar(Value::F32(rng.random_range(15.0..35.0))),
                FieldValue::Scalar(Value::F32(rng.random_range(7.0..8.4))),
                FieldValue::Scalar(Value::F32(rng.random_range(0.1..0.6))),
                FieldValue::Array(
                    (0..3)
                        .map(|_| Value::I16(rng.random_range(-3000..3000)))
                        .collect(),
                ),
                FieldValue::Scalar(Value::U32(rng.random_range(0..86_400))),
            ],
        )?,
        _ => Message::new(
            &OPMODE_ADCS,
            vec![
                FieldValue::Scalar(Value::U8(rng.random_range(0..4))),
                FieldValue::Scalar(Value::U16(0)),
            ],
        )?,
    };
    Ok(msg.encode())
}
