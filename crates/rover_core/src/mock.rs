//!An in-memory I2C bus for exercising drivers without hardware.
//!
//! `MockBus` emulates two kinds of targets:
//! - byte devices (PCA9685 style): 256 one-byte registers, the pointer auto-increments on multi-byte access.
//! - word devices (INA219/ADS1115 style): 16-bit registers selected by a pointer byte, big-endian on the wire.
//!
//! Clones share state, so a test can keep one clone and hand another to the driver under test.
use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use embedded_hal::{
    delay::DelayNs,
    i2c::{self, ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation, SevenBitAddress},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockError {
    pub kind: ErrorKind,
}

impl i2c::Error for MockError {
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transfer {
    Write { address: u8, bytes: Vec<u8> },
    Read { address: u8, len: usize },
}

enum Device {
    Byte {
        pointer: u8,
        memory: [u8; 256],
    },
    Word {
        pointer: u8,
        registers: HashMap<u8, u16>,
        scripted: HashMap<u8, VecDeque<u16>>,
    },
}

impl Device {
    fn write(&mut self, bytes: &[u8]) {
        match self {
            Device::Byte { pointer, memory } => {
                if let Some((reg, data)) = bytes.split_first() {
                    *pointer = *reg;
                    for value in data {
                        memory[*pointer as usize] = *value;
                        *pointer = pointer.wrapping_add(1);
                    }
                }
            }
            Device::Word {
                pointer, registers, ..
            } => {
                if let Some((reg, data)) = bytes.split_first() {
                    *pointer = *reg;
                    if let [hi, lo, ..] = data {
                        registers.insert(*reg, u16::from_be_bytes([*hi, *lo]));
                    }
                }
            }
        }
    }

    fn read(&mut self, buffer: &mut [u8]) {
        match self {
            Device::Byte { pointer, memory } => {
                for slot in buffer.iter_mut() {
                    *slot = memory[*pointer as usize];
                    *pointer = pointer.wrapping_add(1);
                }
            }
            Device::Word {
                pointer,
                registers,
                scripted,
            } => {
                let value = scripted
                    .get_mut(pointer)
                    .and_then(|queue| queue.pop_front())
                    .unwrap_or_else(|| registers.get(pointer).copied().unwrap_or(0));
                let bytes = value.to_be_bytes();
                for (slot, byte) in buffer.iter_mut().zip(bytes.iter().cycle()) {
                    *slot = *byte;
                }
            }
        }
    }
}

#[derive(Default)]
struct State {
    devices: HashMap<u8, Device>,
    log: Vec<Transfer>,
    //remaining transfers before every transfer fails
    fail_after: Option<usize>,
}

#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<State>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn attach_byte_device(&self, address: u8) {
        self.state().devices.insert(
            address,
            Device::Byte {
                pointer: 0,
                memory: [0u8; 256],
            },
        );
    }

    pub fn attach_word_device(&self, address: u8) {
        self.state().devices.insert(
            address,
            Device::Word {
                pointer: 0,
                registers: HashMap::new(),
                scripted: HashMap::new(),
            },
        );
    }

    ///Presets a byte register.
    pub fn set_byte(&self, address: u8, reg: u8, value: u8) {
        if let Some(Device::Byte { memory, .. }) = self.state().devices.get_mut(&address) {
            memory[reg as usize] = value;
        }
    }

    pub fn byte(&self, address: u8, reg: u8) -> u8 {
        match self.state().devices.get(&address) {
            Some(Device::Byte { memory, .. }) => memory[reg as usize],
            _ => 0,
        }
    }

    ///Presets a word register. Reads return it until overwritten.
    pub fn set_word(&self, address: u8, reg: u8, value: u16) {
        if let Some(Device::Word { registers, .. }) = self.state().devices.get_mut(&address) {
            registers.insert(reg, value);
        }
    }

    pub fn word(&self, address: u8, reg: u8) -> u16 {
        match self.state().devices.get(&address) {
            Some(Device::Word { registers, .. }) => registers.get(&reg).copied().unwrap_or(0),
            _ => 0,
        }
    }

    ///Queues a one-shot value for the next read of `reg`, ahead of the stored register value.
    pub fn queue_word(&self, address: u8, reg: u8, value: u16) {
        if let Some(Device::Word { scripted, .. }) = self.state().devices.get_mut(&address) {
            scripted.entry(reg).or_default().push_back(value);
        }
    }

    ///Lets `transfers` more transfers through, then fails every transfer after that.
    pub fn fail_after(&self, transfers: usize) {
        self.state().fail_after = Some(transfers);
    }

    pub fn heal(&self) {
        self.state().fail_after = None;
    }

    pub fn log(&self) -> Vec<Transfer> {
        self.state().log.clone()
    }

    pub fn clear_log(&self) {
        self.state().log.clear();
    }

    ///Payloads of every write to `address`, oldest first.
    pub fn writes(&self, address: u8) -> Vec<Vec<u8>> {
        self.state()
            .log
            .iter()
            .filter_map(|t| match t {
                Transfer::Write { address: a, bytes } if *a == address => Some(bytes.clone()),
                _ => None,
            })
            .collect()
    }

    ///Lengths of every read from `address`, oldest first.
    pub fn reads(&self, address: u8) -> Vec<usize> {
        self.state()
            .log
            .iter()
            .filter_map(|t| match t {
                Transfer::Read { address: a, len } if *a == address => Some(*len),
                _ => None,
            })
            .collect()
    }
}

impl ErrorType for MockBus {
    type Error = MockError;
}

impl I2c for MockBus {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.state();
        if !state.devices.contains_key(&address) {
            return Err(MockError {
                kind: ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address),
            });
        }

        for operation in operations.iter_mut() {
            match state.fail_after {
                Some(0) => {
                    return Err(MockError {
                        kind: ErrorKind::Other,
                    })
                }
                Some(n) => state.fail_after = Some(n - 1),
                None => {}
            }

            let State { devices, log, .. } = &mut *state;
            let Some(device) = devices.get_mut(&address) else {
                continue;
            };
            match operation {
                Operation::Write(bytes) => {
                    device.write(bytes);
                    log.push(Transfer::Write {
                        address,
                        bytes: bytes.to_vec(),
                    });
                }
                Operation::Read(buffer) => {
                    device.read(buffer);
                    log.push(Transfer::Read {
                        address,
                        len: buffer.len(),
                    });
                }
            }
        }
        Ok(())
    }
}

///A `DelayNs` that records instead of sleeping.
#[derive(Clone, Default)]
pub struct MockDelay {
    total_ns: Arc<AtomicU64>,
}

impl MockDelay {
    pub fn new() -> Self {
        Self::default()
    }

    ///Total time requested so far across all clones.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.total_ns.load(Ordering::SeqCst))
    }

    pub fn reset(&self) {
        self.total_ns.store(0, Ordering::SeqCst);
    }
}

impl DelayNs for MockDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.fetch_add(u64::from(ns), Ordering::SeqCst);
    }
}
