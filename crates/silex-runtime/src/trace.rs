//! Debug-channel logging
//!
//! The runtime routes the `log` facade to the byte-oriented debug port
//! from the boot record. There is no structured protocol; records are
//! plain `LEVEL target: message` lines.

use crate::platform::Platform;
use log::{LevelFilter, Log, Metadata, Record};
use std::sync::Arc;

/// `log::Log` implementation over the platform debug channel.
pub struct SerialLogger {
    platform: Arc<dyn Platform>,
    max_level: LevelFilter,
}

impl SerialLogger {
    pub fn new(platform: Arc<dyn Platform>, max_level: LevelFilter) -> SerialLogger {
        SerialLogger {
            platform,
            max_level,
        }
    }

    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            self.platform.debug_out(byte);
        }
    }
}

impl Log for SerialLogger {
    fn enabled(&self, metadata: &Metadata<'_>) -> bool {
        metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record<'_>) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.write_str(&format!(
            "{} {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

/// Install the serial logger. Later calls are ignored; the first logger
/// installed for the process wins.
pub fn init(platform: Arc<dyn Platform>, max_level: LevelFilter) {
    let logger = Box::leak(Box::new(SerialLogger::new(platform, max_level)));
    if log::set_logger(logger).is_ok() {
        log::set_max_level(max_level);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::{FrozenThread, PageProt};
    use std::sync::Mutex;

    struct CapturePlatform {
        bytes: Mutex<Vec<u8>>,
    }

    impl Platform for CapturePlatform {
        fn alloc_pages(&self, _count: usize) -> Option<usize> {
            None
        }
        fn free_pages(&self, _base: usize, _count: usize) {}
        fn protect(&self, _base: usize, _count: usize, _prot: PageProt) -> bool {
            true
        }
        fn icache_flush(&self, _base: usize, _len: usize) {}
        fn freeze_all_threads_except_self(&self) -> Vec<FrozenThread> {
            Vec::new()
        }
        fn thaw_all(&self) {}
        fn send_ipi_all(&self) {}
        fn debug_out(&self, byte: u8) {
            self.bytes.lock().unwrap().push(byte);
        }
        fn halt(&self) -> ! {
            unreachable!("halt in test")
        }
    }

    #[test]
    fn test_serial_logger_writes_line() {
        let platform = Arc::new(CapturePlatform {
            bytes: Mutex::new(Vec::new()),
        });
        let logger = SerialLogger::new(platform.clone(), LevelFilter::Debug);
        logger.log(
            &Record::builder()
                .args(format_args!("collected {} bytes", 128))
                .level(log::Level::Debug)
                .target("gc")
                .build(),
        );
        let text = String::from_utf8(platform.bytes.lock().unwrap().clone()).unwrap();
        assert_eq!(text, "DEBUG gc: collected 128 bytes\n");
    }

    #[test]
    fn test_level_filter() {
        let platform = Arc::new(CapturePlatform {
            bytes: Mutex::new(Vec::new()),
        });
        let logger = SerialLogger::new(platform.clone(), LevelFilter::Warn);
        logger.log(
            &Record::builder()
                .args(format_args!("noise"))
                .level(log::Level::Trace)
                .target("jit")
                .build(),
        );
        assert!(platform.bytes.lock().unwrap().is_empty());
    }
}
