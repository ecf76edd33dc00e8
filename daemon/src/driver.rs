// ======================================================================
//  Compiled UART driver, bound at runtime
// ======================================================================
//
// C ABI expected from the shared object:
//
//   void     initUART(float timeout_s, uint8_t retries);
//   int      sendUART(const uint8_t *buf, uint32_t len, uint8_t ack);
//   uint32_t receiveUART(uint8_t *buf, uint32_t max_len);
//   void     deinitUART(void);
//   uint32_t getMaxLen(void);

use crate::link::{LinkError, LinkTransport};
use libloading::Library;
use std::path::Path;
use std::time::Duration;

type InitFn = unsafe extern "C" fn(f32, u8);
type SendFn = unsafe extern "C" fn(*const u8, u32, u8) -> i32;
type ReceiveFn = unsafe extern "C" fn(*mut u8, u32) -> u32;
type DeinitFn = unsafe extern "C" fn();
type MaxLenFn = unsafe extern "C" fn() -> u32;

pub struct DriverTransport {
    init: InitFn,
    send: SendFn,
    receive: ReceiveFn,
    deinit: DeinitFn,
    max_len: MaxLenFn,
    initialized: bool,
    // Keeps the function pointers above valid.
    _lib: Library,
}

/// # Safety
/// `T` must match the C signature of `name` in the loaded driver.
unsafe fn symbol<T: Copy>(lib: &Library, name: &'static str) -> Result<T, LinkError> {
    let mut c_name = Vec::with_capacity(name.len() + 1);
    c_name.extend_from_slice(name.as_bytes());
    c_name.push(0);
    unsafe { lib.get::<T>(&c_name) }
        .map(|sym| *sym)
        .map_err(|source| LinkError::MissingSymbol { name, source })
}

impl DriverTransport {
    pub fn load(path: &Path) -> Result<Self, LinkError> {
        let lib = unsafe { Library::new(path) }.map_err(|source| LinkError::Load {
            path: path.to_path_buf(),
            source,
        })?;
        unsafe {
            Ok(Self {
                init: symbol::<InitFn>(&lib, "initUART")?,
                send: symbol::<SendFn>(&lib, "sendUART")?,
                receive: symbol::<ReceiveFn>(&lib, "receiveUART")?,
                deinit: symbol::<DeinitFn>(&lib, "deinitUART")?,
                max_len: symbol::<MaxLenFn>(&lib, "getMaxLen")?,
                initialized: false,
                _lib: lib,
            })
        }
    }
}

impl LinkTransport for DriverTransport {
    fn initialize(&mut self, timeout: Duration, retries: u8) -> Result<usize, LinkError> {
        unsafe { (self.init)(timeout.as_secs_f32(), retries) };
        self.initialized = true;
        Ok(unsafe { (self.max_len)() } as usize)
    }

    fn send(&mut self, frame: &[u8], ack: bool) -> bool {
        if !self.initialized {
            return false;
        }
        let Ok(len) = u32::try_from(frame.len()) else {
            return false;
        };
        unsafe { (self.send)(frame.as_ptr(), len, u8::from(ack)) != 0 }
    }

    fn receive(&mut self, buf: &mut [u8]) -> usize {
        if !self.initialized || buf.is_empty() {
            return 0;
        }
        let max = u32::try_from(buf.len()).unwrap_or(u32::MAX);
        let n = unsafe { (self.receive)(buf.as_mut_ptr(), max) } as usize;
        n.min(buf.len())
    }

    fn deinitialize(&mut self) {
        if self.initialized {
            unsafe { (self.deinit)() };
            self.initialized = false;
        }
    }
}
