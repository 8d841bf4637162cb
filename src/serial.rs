//! Blocking serial streams for the MDB bus and the RFID reader.
//!
//! Both peripherals speak plain 8N1 byte streams. Reads block up to the
//! configured timeout and report "no byte" instead of an error on expiry so
//! the worker loops can service their shutdown flags between bytes.

use std::io::{self, Read, Write};
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::SerialPort;

/// Byte-level I/O as the link and RFID workers consume it.
///
/// `SerialStream` is the production implementation; tests substitute
/// in-memory doubles.
pub trait ByteIo {
    /// Read a single byte, or `None` if the read timeout expired.
    fn read_byte(&mut self) -> io::Result<Option<u8>>;

    /// Fill `buf` from the stream until it is full or the timeout expires.
    /// Returns the number of bytes actually read.
    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf`.
    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self) -> io::Result<()>;
}

/// A serial port opened 8N1 with a read timeout.
pub struct SerialStream {
    port: Box<dyn SerialPort>,
    path: String,
}

impl std::fmt::Debug for SerialStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialStream")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SerialStream {
    /// Open `path` at `baud`, 8 data bits, no parity, one stop bit.
    pub fn open(path: &str, baud: u32, read_timeout: Duration) -> Result<Self> {
        let port = serialport::new(path, baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(read_timeout)
            .open()
            .with_context(|| format!("failed to open serial port {path}"))?;
        log::info!("opened serial port {path} @ {baud} baud");
        Ok(Self {
            port,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        // serialport keeps the fd for the lifetime of the handle; probing the
        // line state is the cheapest liveness check it offers.
        self.port.bytes_to_read().is_ok()
    }
}

/// True for the error kinds a read timeout surfaces as.
fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

impl ByteIo for SerialStream {
    fn read_byte(&mut self) -> io::Result<Option<u8>> {
        let mut buf = [0u8; 1];
        match self.port.read(&mut buf) {
            Ok(0) => Ok(None),
            Ok(_) => {
                log::trace!("read {:02x}", buf[0]);
                Ok(Some(buf[0]))
            }
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn read_frame(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if is_timeout(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}
