//! Timestamped logging with source locations and ANSI colour support.
//!
//! Provides the [`plog!`] macro for consistent log output in the format:
//!
//! ```text
//! 2026-08-24 14:02:51.143 src/engine.rs:210 session active for u-4f09a21
//! ```
//!
//! When stderr is a terminal, timestamps and source locations are dimmed and
//! user / conversation / message ids are coloured deterministically from
//! their content so the same id is always the same colour.
//!
//! Log lines go to stderr by default. Tests can call [`set_writer`] to
//! capture output; installing a custom writer disables colour codes.

use std::io::{self, IsTerminal, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::SystemTime;

static COLOUR_ENABLED: AtomicBool = AtomicBool::new(false);

static LOG_WRITER: LazyLock<Mutex<Box<dyn Write + Send>>> =
    LazyLock::new(|| Mutex::new(Box::new(io::stderr())));

/// Initialize logging. Call once at startup; detects ANSI support on stderr.
pub fn init() {
    COLOUR_ENABLED.store(io::stderr().is_terminal(), Ordering::Relaxed);
}

/// Redirect all subsequent [`plog!`] output to `w` and disable colours.
pub fn set_writer(w: Box<dyn Write + Send>) {
    COLOUR_ENABLED.store(false, Ordering::Relaxed);
    *LOG_WRITER.lock().unwrap() = w;
}

fn colour_enabled() -> bool {
    COLOUR_ENABLED.load(Ordering::Relaxed)
}

const RESET: &str = "\x1b[0m";
const DIM: &str = "\x1b[2m";

/// Bright palette only; the dim variants read too close to the timestamps.
const ID_COLOURS: &[&str] = &[
    "\x1b[96m", "\x1b[92m", "\x1b[95m", "\x1b[93m", "\x1b[94m", "\x1b[91m",
];

fn hash_colour(id: &str) -> &'static str {
    // FNV-1a, folded to the palette size.
    let hash = id.bytes().fold(0x811c_9dc5u32, |acc, b| {
        (acc ^ b as u32).wrapping_mul(0x0100_0193)
    });
    ID_COLOURS[(hash as usize) % ID_COLOURS.len()]
}

const ID_TRUNCATE_LEN: usize = 7;

fn short(id: &str) -> &str {
    let end = id
        .char_indices()
        .nth(ID_TRUNCATE_LEN)
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    &id[..end]
}

fn tagged_id(tag: char, id: &str) -> String {
    let s = short(id);
    if colour_enabled() {
        let colour = hash_colour(id);
        format!("{colour}{tag}-{s}{RESET}")
    } else {
        format!("{tag}-{s}")
    }
}

/// Format a user id with consistent colour and truncation, e.g. `u-4f09a21`.
pub fn user_id(id: &str) -> String {
    tagged_id('u', id)
}

/// Format a conversation id, e.g. `c-8Qv3bTk`.
pub fn conv_id(id: &str) -> String {
    tagged_id('c', id)
}

/// Format a message id, e.g. `m-a91cc04`.
pub fn msg_id(id: &str) -> String {
    tagged_id('m', id)
}

/// Current wall-clock time as `YYYY-MM-DD HH:MM:SS.mmm`.
pub fn format_timestamp() -> String {
    let duration = SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = duration.as_secs();
    let millis = duration.subsec_millis();

    let (year, month, day) = civil_date((secs / 86400) as i64);
    let time_secs = secs % 86400;

    format!(
        "{year:04}-{month:02}-{day:02} {:02}:{:02}:{:02}.{millis:03}",
        time_secs / 3600,
        (time_secs % 3600) / 60,
        time_secs % 60,
    )
}

/// Civil date from days since the UNIX epoch.
fn civil_date(days: i64) -> (i64, u64, u64) {
    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let mut year = yoe as i64 + era * 400;
    if month <= 2 {
        year += 1;
    }
    (year, month, day)
}

/// Write a single log line. Called by [`plog!`]; not intended for direct use.
pub fn emit(file: &str, line: u32, msg: &str) {
    let ts = format_timestamp();
    let location = format!("{file}:{line}");
    let formatted = if colour_enabled() {
        format!("{DIM}{ts} {location}{RESET} {msg}")
    } else {
        format!("{ts} {location} {msg}")
    };
    let mut writer = LOG_WRITER.lock().unwrap();
    let _ = writeln!(*writer, "{formatted}");
}

/// Emit a log line with timestamp and source location.
///
/// ```ignore
/// plog!("presence: {} online", roster.len());
/// plog!("message {} appended to {}", logging::msg_id(&mid), logging::conv_id(&cid));
/// ```
#[macro_export]
macro_rules! plog {
    ($($arg:tt)*) => {{
        $crate::logging::emit(file!(), line!(), &format!($($arg)*));
    }};
}
