//! I2C bus abstractions
//!
//! Provides the I2C master operations the sensor drivers need, plus the
//! big-endian 16-bit register convention used by INA2xx-class devices.

use embedded_hal_async::i2c::I2c;

/// First address probed by [`I2cBus::scan`] (0x00-0x07 are reserved)
pub const SCAN_FIRST_ADDRESS: u8 = 0x08;

/// Last address probed by [`I2cBus::scan`] (0x78-0x7F are reserved)
pub const SCAN_LAST_ADDRESS: u8 = 0x77;

/// I2C bus master
///
/// Provides basic I2C read/write operations for communicating with
/// peripheral devices. Every `embedded-hal-async` I2C master implements
/// this trait through the blanket impl below.
#[allow(async_fn_in_trait)]
pub trait I2cBus {
    /// Error type for I2C operations
    type Error;

    /// Write data to a device at the given address
    ///
    /// # Arguments
    /// * `address` - 7-bit I2C address
    /// * `data` - Bytes to write
    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), Self::Error>;

    /// Read data from a device at the given address
    ///
    /// # Arguments
    /// * `address` - 7-bit I2C address
    /// * `buf` - Buffer to read into
    async fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<(), Self::Error>;

    /// Write then read in a single transaction (repeated start)
    ///
    /// This is commonly used to write a register address then read data.
    ///
    /// # Arguments
    /// * `address` - 7-bit I2C address
    /// * `write_data` - Bytes to write (typically register address)
    /// * `read_buf` - Buffer to read into
    async fn write_read(
        &mut self,
        address: u8,
        write_data: &[u8],
        read_buf: &mut [u8],
    ) -> Result<(), Self::Error>;

    /// Read a 16-bit big-endian register
    async fn read_register(&mut self, address: u8, register: u8) -> Result<u16, Self::Error> {
        let mut buf = [0u8; 2];
        self.write_read(address, &[register], &mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    /// Write a 16-bit big-endian register
    async fn write_register(
        &mut self,
        address: u8,
        register: u8,
        value: u16,
    ) -> Result<(), Self::Error> {
        let [hi, lo] = value.to_be_bytes();
        self.write(address, &[register, hi, lo]).await
    }

    /// Probe every non-reserved 7-bit address
    ///
    /// A device is considered present when a one-byte read is acknowledged.
    async fn scan(&mut self) -> ScanResult {
        let mut result = ScanResult::default();
        let mut probe = [0u8; 1];
        for address in SCAN_FIRST_ADDRESS..=SCAN_LAST_ADDRESS {
            if self.read(address, &mut probe).await.is_ok() {
                result.insert(address);
            }
        }
        result
    }
}

impl<T: I2c> I2cBus for T {
    type Error = T::Error;

    async fn write(&mut self, address: u8, data: &[u8]) -> Result<(), Self::Error> {
        I2c::write(self, address, data).await
    }

    async fn read(&mut self, address: u8, buf: &mut [u8]) -> Result<(), Self::Error> {
        I2c::read(self, address, buf).await
    }

    async fn write_read(
        &mut self,
        address: u8,
        write_data: &[u8],
        read_buf: &mut [u8],
    ) -> Result<(), Self::Error> {
        I2c::write_read(self, address, write_data, read_buf).await
    }
}

/// Set of 7-bit addresses that answered a bus scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ScanResult {
    present: u128,
}

impl ScanResult {
    /// Mark an address as present
    pub fn insert(&mut self, address: u8) {
        if address < 128 {
            self.present |= 1u128 << address;
        }
    }

    /// Check whether an address answered
    pub fn contains(&self, address: u8) -> bool {
        address < 128 && self.present & (1u128 << address) != 0
    }

    /// Number of devices found
    pub fn len(&self) -> usize {
        self.present.count_ones() as usize
    }

    /// True if nothing answered
    pub fn is_empty(&self) -> bool {
        self.present == 0
    }

    /// Iterate over the addresses found, lowest first
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        (0u8..128).filter(move |a| self.contains(*a))
    }
}
