//! Boot command line parsing.
//!
//! The firmware passes `cmdline.txt` through unmodified; the kernel picks
//! out the few `key=value` options it understands and ignores the rest
//! (the GPU firmware has its own options in the same line).

use log::LevelFilter;
use pionabi::process::{STRIDE_DEFAULT_TICKETS, STRIDE_MAX_TICKETS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootOptions {
    /// UART log verbosity (`verbose=0..=4`).
    pub verbose: LevelFilter,
    /// Path prefix inside the IFS handed to the first process.
    pub boot_prefix: &'static str,
    /// Stride tickets for the first process.
    pub root_tickets: i32,
}

impl Default for BootOptions {
    fn default() -> Self {
        BootOptions {
            verbose: LevelFilter::Info,
            boot_prefix: "",
            root_tickets: STRIDE_DEFAULT_TICKETS,
        }
    }
}

pub fn parse(cmdline: &'static str) -> BootOptions {
    let mut options = BootOptions::default();

    for word in cmdline.split_ascii_whitespace() {
        let (key, value) = match word.split_once('=') {
            Some(kv) => kv,
            None => continue,
        };
        match key {
            "verbose" => {
                options.verbose = match value {
                    "0" => LevelFilter::Error,
                    "1" => LevelFilter::Warn,
                    "2" => LevelFilter::Info,
                    "3" => LevelFilter::Debug,
                    "4" => LevelFilter::Trace,
                    _ => {
                        log::warn!("cmdline: bad verbose level {:?}", value);
                        options.verbose
                    },
                };
            },
            "boot_prefix" => options.boot_prefix = value,
            "tickets" => match value.parse::<i32>() {
                Ok(n) if n > 0 && n <= STRIDE_MAX_TICKETS => options.root_tickets = n,
                _ => log::warn!("cmdline: bad tickets value {:?}", value),
            },
            _ => {
                // GPU firmware options travel on the same line.
            },
        }
    }

    options
}
