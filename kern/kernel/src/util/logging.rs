//! Log plumbing for freestanding embedders.
//!
//! The core itself only calls the `log` facade. An embedder that has no
//! logger of its own can register any `fmt::Write` sink (a UART, a ring
//! buffer) here and install [`KernelLogger`] as the global logger.

use alloc::{boxed::Box, vec::Vec};
use core::fmt::Write;

use log::{LevelFilter, Log};
use spin::Mutex;

pub struct KernelWriter {
    outputs: Mutex<Vec<Box<dyn Write + Send>>>,
}

impl KernelWriter {
    pub const fn empty() -> Self {
        Self {
            outputs: Mutex::new(Vec::new()),
        }
    }

    pub fn add_output(&self, output: Box<dyn Write + Send>) {
        self.outputs.lock().push(output);
    }

    pub fn write_fmt(&self, args: core::fmt::Arguments<'_>) -> core::fmt::Result {
        let mut outputs = self.outputs.lock();
        for sink in outputs.iter_mut() {
            sink.write_fmt(args)?;
        }
        Ok(())
    }
}

pub static WRITER: KernelWriter = KernelWriter::empty();

pub struct KernelLogger;

impl Log for KernelLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let _ = WRITER.write_fmt(format_args!(
            "{}: {}: {}\n",
            record.level(),
            record.target(),
            record.args()
        ));
    }

    fn flush(&self) {}
}

pub static LOGGER: KernelLogger = KernelLogger;

/// Installs [`LOGGER`] as the global logger. Fails quietly if the
/// embedder already installed one.
pub fn init(level: LevelFilter) {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(level);
    }
}
