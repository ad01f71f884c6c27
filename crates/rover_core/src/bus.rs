use embedded_hal::i2c::{ErrorKind, I2c, Operation};
use tracing::debug;

use crate::error::DriverError;

const MAX_7BIT_ADDRESS: u8 = 0x7F;

///An open connection to one target address on an I2C bus segment.
///
/// The path and address are fixed for the lifetime of the handle. The handle owns the transport; to share one
/// physical bus between several handles, give each an `embedded_hal_bus::i2c::MutexDevice` over the same
/// `Mutex`. That device locks for a whole transaction, so a register read is never interleaved with other traffic.
///
/// All 16-bit register values are big-endian on the wire.
pub struct BusHandle<I2C> {
    i2c: I2C,
    path: String,
    address: u8,
}

impl<I2C: I2c> BusHandle<I2C> {
    ///Claims `address` on an already opened transport.
    ///
    /// This performs a one-byte probe read so that a missing device fails here instead of on the first register
    /// access.
    pub fn attach(mut i2c: I2C, path: &str, address: u8) -> Result<Self, DriverError> {
        if address > MAX_7BIT_ADDRESS {
            return Err(DriverError::AddressRejected {
                path: path.to_string(),
                address,
            });
        }

        let mut probe = [0u8; 1];
        if let Err(err) = i2c.read(address, &mut probe) {
            let kind = embedded_hal::i2c::Error::kind(&err);
            debug!("probe of {:#04x} on {} failed: {:?}", address, path, err);
            return Err(match kind {
                ErrorKind::NoAcknowledge(_) => DriverError::AddressRejected {
                    path: path.to_string(),
                    address,
                },
                _ => DriverError::io(address, err),
            });
        }

        debug!("claimed {:#04x} on {}", address, path);
        Ok(Self {
            i2c,
            path: path.to_string(),
            address,
        })
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    ///Selects `reg` then reads two bytes, as one exclusive transaction.
    pub fn read_register16(&mut self, reg: u8) -> Result<u16, DriverError> {
        let mut buffer = [0u8; 2];
        self.read_into(reg, &mut buffer)?;
        Ok(u16::from_be_bytes(buffer))
    }

    pub fn read_byte(&mut self, reg: u8) -> Result<u8, DriverError> {
        let mut buffer = [0u8; 1];
        self.read_into(reg, &mut buffer)?;
        Ok(buffer[0])
    }

    pub fn write_register16(&mut self, reg: u8, value: u16) -> Result<(), DriverError> {
        let [hi, lo] = value.to_be_bytes();
        self.write_raw(&[reg, hi, lo])
    }

    pub fn write_byte(&mut self, reg: u8, value: u8) -> Result<(), DriverError> {
        self.write_raw(&[reg, value])
    }

    ///Gives the transport back. Dropping it closes the underlying connection.
    pub fn release(self) -> I2C {
        debug!("released {:#04x} on {}", self.address, self.path);
        self.i2c
    }

    //two phases: register pointer write, then the reply read
    fn read_into(&mut self, reg: u8, buffer: &mut [u8]) -> Result<(), DriverError> {
        let address = self.address;
        self.i2c
            .transaction(
                address,
                &mut [Operation::Write(&[reg]), Operation::Read(buffer)],
            )
            .map_err(|err| DriverError::io(address, err))
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        let address = self.address;
        self.i2c
            .write(address, bytes)
            .map_err(|err| DriverError::io(address, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockBus;
    use embedded_hal_bus::i2c::MutexDevice;
    use std::sync::Mutex;

    #[test]
    fn attach_rejects_missing_device() {
        let bus = MockBus::new();
        let res = BusHandle::attach(bus, "/dev/i2c-1", 0x40);
        assert!(matches!(
            res,
            Err(DriverError::AddressRejected { address: 0x40, .. })
        ));
    }

    #[test]
    fn attach_rejects_ten_bit_address() {
        let bus = MockBus::new();
        bus.attach_byte_device(0x40);
        let res = BusHandle::attach(bus, "/dev/i2c-1", 0x80);
        assert!(matches!(
            res,
            Err(DriverError::AddressRejected { address: 0x80, .. })
        ));
    }

    #[test]
    fn word_registers_are_big_endian() {
        let bus = MockBus::new();
        bus.attach_word_device(0x41);
        bus.set_word(0x41, 0x02, 0x1234);
        let mut handle = BusHandle::attach(bus.clone(), "/dev/i2c-1", 0x41).unwrap();

        assert_eq!(handle.read_register16(0x02).unwrap(), 0x1234);

        handle.write_register16(0x05, 0xABCD).unwrap();
        assert_eq!(bus.writes(0x41).last().unwrap(), &vec![0x05, 0xAB, 0xCD]);
        assert_eq!(bus.word(0x41, 0x05), 0xABCD);
    }

    #[test]
    fn read_is_pointer_write_then_read() {
        let bus = MockBus::new();
        bus.attach_word_device(0x41);
        let mut handle = BusHandle::attach(bus.clone(), "/dev/i2c-1", 0x41).unwrap();
        bus.clear_log();

        handle.read_register16(0x01).unwrap();
        assert_eq!(bus.writes(0x41), vec![vec![0x01]]);
        assert_eq!(bus.reads(0x41), vec![2]);
    }

    #[test]
    fn failed_transfer_is_io_error() {
        let bus = MockBus::new();
        bus.attach_byte_device(0x40);
        let mut handle = BusHandle::attach(bus.clone(), "/dev/i2c-1", 0x40).unwrap();
        bus.fail_after(0);

        let res = handle.write_byte(0x00, 0x10);
        assert!(matches!(res, Err(DriverError::IoFailed { address: 0x40, .. })));
    }

    #[test]
    fn release_returns_transport() {
        let bus = MockBus::new();
        bus.attach_byte_device(0x40);
        let handle = BusHandle::attach(bus, "/dev/i2c-3", 0x40).unwrap();
        assert_eq!(handle.path(), "/dev/i2c-3");
        assert_eq!(handle.address(), 0x40);
        let _bus: MockBus = handle.release();
    }

    #[test]
    fn handles_on_one_bus_see_each_others_writes() {
        let mock = MockBus::new();
        mock.attach_byte_device(0x40);
        mock.attach_word_device(0x41);
        let bus = Mutex::new(mock.clone());

        let mut pwm = BusHandle::attach(MutexDevice::new(&bus), "/dev/i2c-1", 0x40).unwrap();
        let mut power = BusHandle::attach(MutexDevice::new(&bus), "/dev/i2c-1", 0x41).unwrap();

        pwm.write_byte(0x06, 0x01).unwrap();
        power.write_register16(0x05, 2239).unwrap();

        assert_eq!(mock.byte(0x40, 0x06), 0x01);
        assert_eq!(mock.word(0x41, 0x05), 2239);
    }

    #[test]
    fn transactions_from_threads_do_not_interleave() {
        let mock = MockBus::new();
        mock.attach_word_device(0x41);
        mock.set_word(0x41, 0x01, 0x1111);
        mock.set_word(0x41, 0x02, 0x2222);
        let bus = Mutex::new(mock);

        std::thread::scope(|scope| {
            let workers: Vec<_> = [(0x01u8, 0x1111u16), (0x02, 0x2222)]
                .into_iter()
                .map(|(reg, expected)| {
                    let device = MutexDevice::new(&bus);
                    scope.spawn(move || {
                        let mut handle = BusHandle::attach(device, "/dev/i2c-1", 0x41).unwrap();
                        (0..200).all(|_| handle.read_register16(reg).unwrap() == expected)
                    })
                })
                .collect();

            for worker in workers {
                assert!(worker.join().unwrap());
            }
        });
    }
}
