//! Output tee sinks: session logger and hex dumper.
//!
//! Both sinks observe traffic without participating in flow control; a sink
//! write failure is logged once and the sink disabled rather than killing
//! the session.

use crate::config::{Config, HexDump};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use tracing::warn;

/// Direction tag for the hex dumper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// Appends raw session bytes to a file (`-o`, `--append`).
pub struct OutputLogger {
    file: Option<File>,
}

impl OutputLogger {
    pub fn open(path: &Path, append: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)?;
        Ok(Self { file: Some(file) })
    }

    pub fn disabled() -> Self {
        Self { file: None }
    }

    pub fn write(&mut self, data: &[u8]) {
        if let Some(f) = self.file.as_mut() {
            if let Err(e) = f.write_all(data) {
                warn!("output log write failed, disabling sink: {}", e);
                self.file = None;
            }
        }
    }
}

/// xxd-style dumper: offset, 16 hex bytes, printable ASCII column.
pub struct HexDumper {
    out: Option<Box<dyn Write + Send>>,
    offset: u64,
}

impl HexDumper {
    pub fn from_config(cfg: &HexDump) -> io::Result<Self> {
        let out: Option<Box<dyn Write + Send>> = match cfg {
            HexDump::Off => None,
            HexDump::Stderr => Some(Box::new(io::stderr())),
            HexDump::File(path) => Some(Box::new(
                OpenOptions::new().create(true).append(true).open(path)?,
            )),
        };
        Ok(Self { out, offset: 0 })
    }

    pub fn disabled() -> Self {
        Self { out: None, offset: 0 }
    }

    pub fn dump(&mut self, dir: Direction, data: &[u8]) {
        let Some(out) = self.out.as_mut() else {
            return;
        };
        let arrow = match dir {
            Direction::In => "<",
            Direction::Out => ">",
        };
        let mut buf = String::with_capacity(data.len() * 4);
        for row in data.chunks(16) {
            let hexpart = hex::encode(row);
            // Two hex chars per byte, space every two, pad to 16 bytes wide.
            let mut spaced = String::with_capacity(48);
            for pair in hexpart.as_bytes().chunks(2) {
                spaced.push_str(std::str::from_utf8(pair).unwrap_or(".."));
                spaced.push(' ');
            }
            let ascii: String = row
                .iter()
                .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
                .collect();
            buf.push_str(&format!(
                "{} {:08x}  {:<48} {}\n",
                arrow, self.offset, spaced, ascii
            ));
            self.offset += row.len() as u64;
        }
        if let Err(e) = out.write_all(buf.as_bytes()) {
            warn!("hex dump write failed, disabling sink: {}", e);
            self.out = None;
        }
    }
}

/// The pair of sinks a transfer path tees into.
pub struct Sinks {
    pub log: OutputLogger,
    pub hex: HexDumper,
}

impl Sinks {
    /// Build sinks from the configuration. I/O errors opening sink files
    /// are startup errors, not per-session ones.
    pub fn from_config(cfg: &Config) -> io::Result<Self> {
        let log = match &cfg.output_file {
            Some(path) => OutputLogger::open(path, cfg.append_output)?,
            None => OutputLogger::disabled(),
        };
        let hex = HexDumper::from_config(&cfg.hex_dump)?;
        Ok(Self { log, hex })
    }

    pub fn disabled() -> Self {
        Self {
            log: OutputLogger::disabled(),
            hex: HexDumper::disabled(),
        }
    }

    /// Tee bytes received from the remote.
    pub fn on_recv(&mut self, data: &[u8]) {
        self.log.write(data);
        self.hex.dump(Direction::In, data);
    }

    /// Tee bytes sent to the remote.
    pub fn on_send(&mut self, data: &[u8]) {
        self.hex.dump(Direction::Out, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_logger_roundtrip() {
        let path = std::env::temp_dir().join(format!("rcat_log_{}.bin", std::process::id()));
        let mut logger = OutputLogger::open(&path, false).unwrap();
        logger.write(b"hello ");
        logger.write(b"world");
        drop(logger);
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_append_mode() {
        let path = std::env::temp_dir().join(format!("rcat_app_{}.bin", std::process::id()));
        std::fs::write(&path, b"first|").unwrap();
        let mut logger = OutputLogger::open(&path, true).unwrap();
        logger.write(b"second");
        drop(logger);
        assert_eq!(std::fs::read(&path).unwrap(), b"first|second");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_hexdump_format() {
        let path = std::env::temp_dir().join(format!("rcat_hex_{}.txt", std::process::id()));
        let mut dumper = HexDumper::from_config(&HexDump::File(path.clone())).unwrap();
        dumper.dump(Direction::In, b"AB\x00\xff");
        drop(dumper);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("< 00000000"));
        assert!(text.contains("41 42 00 ff"));
        assert!(text.contains("AB.."));
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_hexdump_offset_advances() {
        let path = std::env::temp_dir().join(format!("rcat_hex2_{}.txt", std::process::id()));
        let mut dumper = HexDumper::from_config(&HexDump::File(path.clone())).unwrap();
        dumper.dump(Direction::Out, &[0u8; 16]);
        dumper.dump(Direction::Out, &[1u8; 4]);
        drop(dumper);
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("00000010"));
        std::fs::remove_file(&path).ok();
    }
}
