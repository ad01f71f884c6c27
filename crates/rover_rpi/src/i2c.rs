use std::fmt::{Debug, Formatter};

use embedded_hal::i2c::{self, ErrorKind, ErrorType, NoAcknowledgeSource, Operation, SevenBitAddress};
use tracing::trace;

//errno values the i2c-dev driver reports when nothing acknowledges
const ENXIO: i32 = 6;
const EREMOTEIO: i32 = 121;

pub enum RpiI2cError {
    Rppal(rppal::i2c::Error),
    ShortWrite { expected: usize, actual: usize },
    ShortRead { expected: usize, actual: usize },
}

impl Debug for RpiI2cError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        match self {
            Self::Rppal(err) => fmt.write_fmt(format_args!("rppal: {}", err)),
            Self::ShortWrite { expected, actual } => {
                fmt.write_fmt(format_args!("short write: {actual} of {expected} bytes"))
            }
            Self::ShortRead { expected, actual } => {
                fmt.write_fmt(format_args!("short read: {actual} of {expected} bytes"))
            }
        }
    }
}

impl From<rppal::i2c::Error> for RpiI2cError {
    fn from(err: rppal::i2c::Error) -> Self {
        Self::Rppal(err)
    }
}

impl i2c::Error for RpiI2cError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Rppal(rppal::i2c::Error::Io(io)) => match io.raw_os_error() {
                Some(ENXIO) | Some(EREMOTEIO) => {
                    ErrorKind::NoAcknowledge(NoAcknowledgeSource::Unknown)
                }
                _ => ErrorKind::Other,
            },
            _ => ErrorKind::Other,
        }
    }
}

///The rppal bus exposed through `embedded_hal::i2c::I2c`.
///
/// Every phase of a transaction is a separate `read(2)`/`write(2)` on the device node, which is what the register
/// protocols here expect (pointer write, stop, data read). A phase that moves fewer bytes than requested is an
/// error; it is never padded with zeros.
pub struct RpiI2c {
    i2c: rppal::i2c::I2c,
    selected: Option<u8>,
}

impl RpiI2c {
    pub fn new(i2c: rppal::i2c::I2c) -> Self {
        Self { i2c, selected: None }
    }

    fn select(&mut self, address: u8) -> Result<(), RpiI2cError> {
        if self.selected != Some(address) {
            self.i2c.set_slave_address(u16::from(address))?;
            self.selected = Some(address);
        }
        Ok(())
    }
}

impl ErrorType for RpiI2c {
    type Error = RpiI2cError;
}

impl i2c::I2c for RpiI2c {
    fn transaction(
        &mut self,
        address: SevenBitAddress,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        self.select(address)?;
        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    let actual = self.i2c.write(bytes)?;
                    if actual != bytes.len() {
                        return Err(RpiI2cError::ShortWrite {
                            expected: bytes.len(),
                            actual,
                        });
                    }
                    trace!("wrote {:02x?} to {:#04x}", bytes, address);
                }
                Operation::Read(buffer) => {
                    let actual = self.i2c.read(buffer)?;
                    if actual != buffer.len() {
                        return Err(RpiI2cError::ShortRead {
                            expected: buffer.len(),
                            actual,
                        });
                    }
                }
            }
        }
        Ok(())
    }
}
