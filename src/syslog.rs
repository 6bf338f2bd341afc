//! Kernel logger: `log` facade over the debug UART plus an in-RAM ring
//! buffer. The ring buffer is what a panic dumps, so it keeps the most
//! recent output even when the UART level filters it.

use alloc::collections::VecDeque;
use core::fmt::Write;
use core::sync::atomic::{AtomicU8, Ordering};

use log::{Level, LevelFilter, Metadata, Record};
use spin::Mutex;

use crate::driver::uart;

/// Bytes of log history kept for the panic dump.
const RING_CAPACITY: usize = 16 * 1024;

lazy_static::lazy_static! {
    static ref RING: Mutex<VecDeque<u8>> = Mutex::new(VecDeque::with_capacity(RING_CAPACITY));
}

/// UART verbosity, adjustable from the boot command line.
static UART_LEVEL: AtomicU8 = AtomicU8::new(Level::Info as u8);

pub fn set_level(level: LevelFilter) {
    let as_level = level.to_level().unwrap_or(Level::Error);
    UART_LEVEL.store(as_level as u8, Ordering::Relaxed);
    log::set_max_level(LevelFilter::Trace);
}

struct SystemLogger;

impl log::Log for SystemLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut line = format!(
            "{:5} {} - {}\n",
            record.level(),
            record.target(),
            record.args()
        );
        if !line.ends_with('\n') {
            line.push('\n');
        }

        {
            let mut ring = RING.lock();
            for b in line.bytes() {
                if ring.len() == RING_CAPACITY {
                    ring.pop_front();
                }
                ring.push_back(b);
            }
        }

        if record.level() as u8 <= UART_LEVEL.load(Ordering::Relaxed) {
            uart::write_str(&line);
        }
    }

    fn flush(&self) {}
}

static LOGGER: SystemLogger = SystemLogger;

pub fn enable() {
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Trace);
    }
}

/// Panic path: dump the ring buffer and the panic record straight to the
/// UART, bypassing the logger. Must not allocate.
pub fn panic_dump(info: &core::panic::PanicInfo) {
    let mut out = uart::RawUart;
    let _ = out.write_str("\n*** KERNEL PANIC ***\n");
    let _ = writeln!(out, "{}", info);
    let _ = out.write_str("--- log ring buffer ---\n");
    if let Some(ring) = RING.try_lock() {
        for b in ring.iter() {
            uart::write_byte(*b);
        }
    } else {
        let _ = out.write_str("(ring buffer locked)\n");
    }
    let _ = out.write_str("--- end ---\n");
}
