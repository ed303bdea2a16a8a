#![forbid(unsafe_code)]

//! Console output helpers shared by the server.
//!
//! The server logs to plain stdout/stderr; colour is used only for short
//! prefixes (peer address, converter name) and is switched off globally by
//! the `NO_COLOR` configuration flag.

use chrono::Local;
use std::fmt::Display;
use std::sync::OnceLock;

pub const RESET: &str = "\x1b[0m";
pub const BLUE: &str = "\x1b[34m";
pub const BRIGHT_GREEN: &str = "\x1b[92m";
pub const BRIGHT_YELLOW: &str = "\x1b[93m";

/// Wraps `text` in the given ANSI colour, or returns it untouched when
/// colour output is disabled.
pub fn paint(color: &str, text: &str, colors: bool) -> String {
    if colors {
        format!("{color}{text}{RESET}")
    } else {
        text.to_string()
    }
}

pub fn info(message: impl Display) {
    println!("[{} INFO] {}", timestamp(), message);
}

pub fn warn(message: impl Display) {
    eprintln!("[{} WARN] {}", timestamp(), message);
}

/// Debug lines (per-frame converter output, raw inbound messages) are noisy,
/// so they only print when CUBECAST_DEBUG is set.
pub fn debug(message: impl Display) {
    if debug_enabled() {
        println!("[{} DEBUG] {}", timestamp(), message);
    }
}

fn debug_enabled() -> bool {
    static ENABLED: OnceLock<bool> = OnceLock::new();
    *ENABLED.get_or_init(|| {
        std::env::var("CUBECAST_DEBUG").is_ok_and(|value| !value.trim().is_empty())
    })
}

fn timestamp() -> String {
    Local::now().format("%H:%M:%S").to_string()
}
