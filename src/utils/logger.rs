use colored::Colorize;
use env_logger::Builder;
use log::{Level, LevelFilter};
use std::io::Write;

/// Colors used in terminal summaries.
pub struct Colors;

impl Colors {
    pub const SUCCESS: &'static str = "green";
    pub const FAILURE: &'static str = "red";
    pub const SKIPPED: &'static str = "yellow";

    pub fn colorize(color: &str, text: &str) -> String {
        text.color(color).to_string()
    }
}

/// One log line. Warnings and errors carry their target; debug lines from decode workers carry
/// the thread name so interleaved per-file output can be told apart.
fn format_line(level: Level, target: &str, thread: Option<&str>, msg: &str) -> String {
    let name = env!("CARGO_PKG_NAME").cyan();
    match level {
        Level::Error => format!("[{} {} {}] {}", name, "ERROR".red(), target.white(), msg),
        Level::Warn => format!("[{} {} {}] {}", name, "WARN".yellow(), target.white(), msg),
        Level::Debug | Level::Trace => match thread {
            Some(t) if t.starts_with("decode-") => format!("[{} {}] {}", name, t.dimmed(), msg),
            _ => format!("[{}] {}", name, msg),
        },
        Level::Info => format!("[{}] {}", name, msg),
    }
}

pub fn setup_logging(verbose: bool) {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    // try_init: a second call (e.g. lib caller already installed a logger) is not an error.
    let _ = Builder::from_default_env()
        .filter_level(LevelFilter::Warn)
        .filter_module(env!("CARGO_PKG_NAME"), level)
        .format(|buf, record| {
            let current = std::thread::current();
            let line = format_line(
                record.level(),
                record.target(),
                current.name(),
                &record.args().to_string(),
            );
            writeln!(buf, "{}", line)
        })
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn warn_line_names_target() {
        colored::control::set_override(false);
        let line = format_line(Level::Warn, "capsweep::pipeline", None, "disk low");
        assert_eq!(line, "[capsweep WARN capsweep::pipeline] disk low");
    }

    #[test]
    fn debug_line_tags_decode_worker() {
        colored::control::set_override(false);
        let line = format_line(Level::Debug, "capsweep", Some("decode-3"), "start");
        assert_eq!(line, "[capsweep decode-3] start");
        let main = format_line(Level::Debug, "capsweep", Some("main"), "start");
        assert_eq!(main, "[capsweep] start");
    }
}
