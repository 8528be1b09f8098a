//! Observer surface for session events.
//!
//! The client reports progress, diagnostics and results through a single
//! [`Observer`] trait object held behind a mutex, so implementations can
//! assume callbacks arrive one at a time. Callbacks must not call back into
//! the client.

use std::io::Write;

use serde::Serialize;

use crate::settings::NettestFlags;

/// Receives everything a running session wants to tell the caller.
///
/// All methods default to doing nothing, so implementations override only
/// the events they care about.
pub trait Observer: Send {
    /// A warning the user should probably see.
    fn on_warning(&mut self, _msg: &str) {}

    /// Informational progress message.
    fn on_info(&mut self, _msg: &str) {}

    /// Diagnostic chatter useful when debugging.
    fn on_debug(&mut self, _msg: &str) {}

    /// A throughput sample.
    ///
    /// `measured_bytes` were transferred in the last `measurement_interval`
    /// seconds, `elapsed` seconds into a subtest capped at `max_runtime`
    /// seconds, across `nflows` parallel flows.
    fn on_performance(
        &mut self,
        _tid: NettestFlags,
        _nflows: u8,
        _measured_bytes: f64,
        _measurement_interval: f64,
        _elapsed: f64,
        _max_runtime: f64,
    ) {
    }

    /// A final variable reported by the server.
    ///
    /// `scope` is `"web100"`, `"tcp_info"`, or `"summary"`.
    fn on_result(&mut self, _scope: &str, _name: &str, _value: &str) {}

    /// The server is busy; the client will try the next candidate.
    fn on_server_busy(&mut self, _msg: &str) {}
}

/// Human-readable observer writing one line per event.
pub struct LogObserver<W: Write> {
    out: W,
}

impl LogObserver<std::io::Stderr> {
    /// An observer writing to standard error.
    pub fn stderr() -> Self {
        LogObserver { out: std::io::stderr() }
    }
}

impl<W: Write> LogObserver<W> {
    /// An observer writing to `out`.
    pub fn new(out: W) -> Self {
        LogObserver { out }
    }
}

impl<W: Write + Send> Observer for LogObserver<W> {
    fn on_warning(&mut self, msg: &str) {
        let _ = writeln!(self.out, "warning: {msg}");
    }

    fn on_info(&mut self, msg: &str) {
        let _ = writeln!(self.out, "{msg}");
    }

    fn on_debug(&mut self, msg: &str) {
        let _ = writeln!(self.out, "debug: {msg}");
    }

    fn on_performance(
        &mut self,
        tid: NettestFlags,
        nflows: u8,
        measured_bytes: f64,
        measurement_interval: f64,
        elapsed: f64,
        max_runtime: f64,
    ) {
        if measurement_interval <= 0.0 {
            return;
        }
        let speed = measured_bytes * 8.0 / measurement_interval / 1_000_000.0;
        let percent = (elapsed / max_runtime * 100.0).min(100.0);
        let _ = writeln!(
            self.out,
            "{} ({} flows): {:>8.2} Mbit/s ({:>5.1}%)",
            tid.name(),
            nflows,
            speed,
            percent
        );
    }

    fn on_result(&mut self, scope: &str, name: &str, value: &str) {
        let _ = writeln!(self.out, "{scope}.{name}: {value}");
    }

    fn on_server_busy(&mut self, msg: &str) {
        let _ = writeln!(self.out, "server busy: {msg}");
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Event<'a> {
    Warning {
        message: &'a str,
    },
    Info {
        message: &'a str,
    },
    Debug {
        message: &'a str,
    },
    Performance {
        test: &'a str,
        nflows: u8,
        measured_bytes: f64,
        measurement_interval: f64,
        elapsed: f64,
        max_runtime: f64,
    },
    Result {
        scope: &'a str,
        name: &'a str,
        value: &'a str,
    },
    ServerBusy {
        message: &'a str,
    },
}

/// Machine-readable observer writing one JSON object per line.
pub struct JsonObserver<W: Write> {
    out: W,
}

impl JsonObserver<std::io::Stdout> {
    /// An observer writing to standard output.
    pub fn stdout() -> Self {
        JsonObserver { out: std::io::stdout() }
    }
}

impl<W: Write> JsonObserver<W> {
    /// An observer writing to `out`.
    pub fn new(out: W) -> Self {
        JsonObserver { out }
    }

    fn emit(&mut self, event: &Event) {
        if let Ok(json) = serde_json::to_string(event) {
            let _ = writeln!(self.out, "{json}");
        }
    }
}

impl<W: Write + Send> Observer for JsonObserver<W> {
    fn on_warning(&mut self, msg: &str) {
        self.emit(&Event::Warning { message: msg });
    }

    fn on_info(&mut self, msg: &str) {
        self.emit(&Event::Info { message: msg });
    }

    fn on_debug(&mut self, msg: &str) {
        self.emit(&Event::Debug { message: msg });
    }

    fn on_performance(
        &mut self,
        tid: NettestFlags,
        nflows: u8,
        measured_bytes: f64,
        measurement_interval: f64,
        elapsed: f64,
        max_runtime: f64,
    ) {
        self.emit(&Event::Performance {
            test: tid.name(),
            nflows,
            measured_bytes,
            measurement_interval,
            elapsed,
            max_runtime,
        });
    }

    fn on_result(&mut self, scope: &str, name: &str, value: &str) {
        self.emit(&Event::Result { scope, name, value });
    }

    fn on_server_busy(&mut self, msg: &str) {
        self.emit(&Event::ServerBusy { message: msg });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_observer_formats_speed() {
        let mut buf = Vec::new();
        let mut observer = LogObserver::new(&mut buf);

        // 1 MB over one second across one flow is 8 Mbit/s.
        observer.on_performance(NettestFlags::DOWNLOAD, 1, 1_000_000.0, 1.0, 2.0, 10.0);

        let out = String::from_utf8(buf).unwrap();
        assert!(out.contains("download"));
        assert!(out.contains("8.00 Mbit/s"));
    }

    #[test]
    fn json_observer_emits_valid_lines() {
        let mut buf = Vec::new();
        let mut observer = JsonObserver::new(&mut buf);

        observer.on_result("web100", "CurRTO", "300");
        observer.on_server_busy("9977");

        let out = String::from_utf8(buf).unwrap();
        let mut lines = out.lines();

        let result: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(result["type"], "result");
        assert_eq!(result["scope"], "web100");
        assert_eq!(result["name"], "CurRTO");

        let busy: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(busy["type"], "server_busy");
        assert_eq!(busy["message"], "9977");
    }
}
