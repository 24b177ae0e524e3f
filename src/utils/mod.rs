/// Utility functions and helpers
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic time, in microseconds
///
/// Retry and rebuild deadlines are plain timestamps compared against this
/// clock on the next relevant call; nothing is ever scheduled.
pub trait Clock {
    fn now_usec(&self) -> u64;
}

/// Process-monotonic clock anchored at its creation
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_usec(&self) -> u64 {
        // Start at 1 so that 0 can mean "no deadline".
        self.origin.elapsed().as_micros() as u64 + 1
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_usec: u64) -> Self {
        Self {
            now: AtomicU64::new(start_usec),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn set(&self, usec: u64) {
        self.now.store(usec, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_usec(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Calculate CRC16 checksum (XMODEM, as used for Redis slot calculation)
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ 0x1021;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// Extract the hashable part of a key using a `[open, close]` delimiter pair
///
/// The tag is the text between the first `open` and the first `close` that
/// follows it. A missing or empty tag yields the whole key.
pub fn extract_hash_tag(key: &[u8], tag: [u8; 2]) -> &[u8] {
    let [open, close] = tag;
    if let Some(start) = key.iter().position(|&b| b == open) {
        let rest = &key[start + 1..];
        if let Some(len) = rest.iter().position(|&b| b == close) {
            if len > 0 {
                return &rest[..len];
            }
        }
    }
    key
}

/// Format duration for human-readable output
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m{}s", secs / 60, secs % 60)
    } else {
        format!("{}h{}m{}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
