use std::fmt;
use std::time::Duration;

/// Per-phase durations recorded for one request, for human output.
///
/// Phases that never ran (plain-HTTP requests have no TLS handshake, a
/// reused connection skips DNS and connect) stay `None` and render as
/// N/A.
#[derive(Debug, Default, Clone)]
pub struct PhaseSummary {
    pub connection_acquire: Option<Duration>,
    pub dns: Option<Duration>,
    pub tcp_connect: Option<Duration>,
    pub tls_handshake: Option<Duration>,
    pub header_write: Option<Duration>,
    pub request_write: Option<Duration>,
    pub first_byte: Option<Duration>,
}

impl fmt::Display for PhaseSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "\nTime breakdown:")?;
        phase_line(f, "DNS lookup:", self.dns)?;
        phase_line(f, "TCP connect:", self.tcp_connect)?;
        phase_line(f, "TLS handshake:", self.tls_handshake)?;
        phase_line(f, "Conn acquire:", self.connection_acquire)?;
        phase_line(f, "Headers written:", self.header_write)?;
        phase_line(f, "Request written:", self.request_write)?;
        phase_line(f, "First byte:", self.first_byte)?;
        Ok(())
    }
}

fn phase_line(f: &mut fmt::Formatter<'_>, name: &str, duration: Option<Duration>) -> fmt::Result {
    match duration {
        Some(d) => writeln!(f, "  {:<17} {:>10.3} ms", name, d.as_secs_f64() * 1000.0),
        None => writeln!(f, "  {:<17}        N/A", name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_recorded_and_missing_phases() {
        let summary = PhaseSummary {
            dns: Some(Duration::from_millis(12)),
            tcp_connect: Some(Duration::from_millis(30)),
            ..Default::default()
        };
        let text = summary.to_string();

        assert!(text.contains("Time breakdown:"));
        assert!(text.contains("DNS lookup:"));
        assert!(text.contains("12.000 ms"));
        assert!(text.contains("30.000 ms"));
        assert!(text.contains("N/A"));
    }
}
