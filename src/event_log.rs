use std::fmt;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;

use chrono::Local;
use tracing::warn;

/// Wire-event trace, enabled with `RUDP_LOG=1`: one line per protocol event
/// (`SND DATA SEQ=... LEN=...`, `RETX DATA ...`, `DROP DATA ...`, ...) written
/// to `<role>_log.txt` so external harnesses can assert on the exact event
/// sequence. Handles are cheap clones sharing the underlying file, which is
/// how a listener and the connections it accepts end up in the same trace.
#[derive(Clone, Default)]
pub struct EventLog {
    file: Option<Arc<File>>,
}

impl EventLog {
    pub fn disabled() -> EventLog {
        EventLog { file: None }
    }

    /// Open `<role>_log.txt` if `RUDP_LOG=1`, otherwise a no-op log. A log
    /// file that cannot be created degrades to the no-op log rather than
    /// failing the connection.
    pub fn for_role(role: &str) -> EventLog {
        if std::env::var("RUDP_LOG").as_deref() != Ok("1") {
            return EventLog::disabled();
        }
        match File::create(format!("{role}_log.txt")) {
            Ok(file) => EventLog {
                file: Some(Arc::new(file)),
            },
            Err(e) => {
                warn!("cannot create wire log for role {:?}: {} - tracing disabled", role, e);
                EventLog::disabled()
            }
        }
    }

    pub fn emit(&self, event: fmt::Arguments<'_>) {
        if let Some(file) = &self.file {
            let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
            let mut file: &File = file.as_ref();
            // a failed trace write is not worth killing the connection over
            let _ = writeln!(file, "[{timestamp}] [LOG] {event}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_log_swallows_events() {
        let log = EventLog::disabled();
        log.emit(format_args!("SND SYN SEQ={}", 5));
    }

    #[test]
    fn test_emit_format() {
        let path = std::env::temp_dir().join("rudp_event_log_test.txt");
        let log = EventLog {
            file: Some(Arc::new(File::create(&path).unwrap())),
        };

        log.emit(format_args!("SND SYN SEQ={}", 42));
        log.emit(format_args!("RCV ACK={}", 43));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with('['));
        assert!(lines[0].contains("] [LOG] SND SYN SEQ=42"));
        assert!(lines[1].contains("] [LOG] RCV ACK=43"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_clones_share_the_file() {
        let path = std::env::temp_dir().join("rudp_event_log_clone_test.txt");
        let log = EventLog {
            file: Some(Arc::new(File::create(&path).unwrap())),
        };
        let clone = log.clone();

        log.emit(format_args!("RCV SYN SEQ=1"));
        clone.emit(format_args!("SND SYN-ACK SEQ=2 ACK=2"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);

        std::fs::remove_file(&path).ok();
    }
}
