// src/supervisor/output.rs - Line-oriented monitoring of the stack's output
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Startup confirmation flag and bounded diagnostic buffer for one process run.
pub struct OutputState {
    confirmed: watch::Sender<bool>,
    diagnostics: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl OutputState {
    pub fn new(capacity: usize) -> Self {
        let (confirmed, _) = watch::channel(false);
        Self {
            confirmed,
            diagnostics: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Forget everything captured for the previous run.
    pub fn reset(&self) {
        self.confirmed.send_replace(false);
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    /// Set the confirmation flag; true only for the call that set it.
    pub fn confirm(&self) -> bool {
        self.confirmed.send_if_modified(|confirmed| {
            if *confirmed {
                false
            } else {
                *confirmed = true;
                true
            }
        })
    }

    pub fn is_confirmed(&self) -> bool {
        *self.confirmed.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.confirmed.subscribe()
    }

    /// Append a line, dropping the oldest once the buffer is full.
    pub fn push_diagnostic(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        let mut diagnostics = self.diagnostics.lock().unwrap_or_else(|e| e.into_inner());
        while diagnostics.len() >= self.capacity {
            diagnostics.pop_front();
        }
        diagnostics.push_back(line);
    }

    pub fn diagnostics(&self) -> Vec<String> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Marker matching for output lines.
#[derive(Debug, Clone)]
pub struct LineClassifier {
    success: Vec<String>,
    errors: Vec<String>,
}

impl LineClassifier {
    pub fn new(success: &[String], errors: &[String]) -> Self {
        Self {
            success: success.to_vec(),
            errors: errors.iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    /// Success markers are matched case-sensitively.
    pub fn is_success(&self, line: &str) -> bool {
        self.success.iter().any(|m| line.contains(m.as_str()))
    }

    pub fn is_error(&self, line: &str) -> bool {
        let lower = line.to_lowercase();
        self.errors.iter().any(|m| lower.contains(m.as_str()))
    }
}

#[derive(Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

impl Stream {
    fn name(self) -> &'static str {
        match self {
            Stream::Stdout => "stdout",
            Stream::Stderr => "stderr",
        }
    }
}

/// Decode one raw line; invalid UTF-8 is replaced rather than rejected.
fn decode_line(buf: &mut Vec<u8>) -> String {
    let line = String::from_utf8_lossy(buf).trim_end().to_string();
    buf.clear();
    line
}

/// Follow both output streams until the process closes them.
///
/// A stream only counts as closed at end of file. Read errors are logged and
/// reading continues, so the child never blocks on a full pipe.
pub fn spawn_reader<O, E>(
    label: String,
    stdout: O,
    stderr: E,
    classifier: LineClassifier,
    state: Arc<OutputState>,
) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut out = BufReader::new(stdout);
        let mut err = BufReader::new(stderr);
        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();
        let mut out_open = true;
        let mut err_open = true;

        while out_open || err_open {
            // Partial lines stay in their buffer when the other branch wins.
            let (stream, read) = tokio::select! {
                read = out.read_until(b'\n', &mut out_buf), if out_open => (Stream::Stdout, read),
                read = err.read_until(b'\n', &mut err_buf), if err_open => (Stream::Stderr, read),
            };

            let line = match (stream, read) {
                (Stream::Stdout, Ok(0)) => {
                    out_open = false;
                    continue;
                }
                (Stream::Stderr, Ok(0)) => {
                    err_open = false;
                    continue;
                }
                (stream, Err(e)) => {
                    tracing::warn!("Error reading {} {}: {}", label, stream.name(), e);
                    continue;
                }
                (Stream::Stdout, Ok(_)) => decode_line(&mut out_buf),
                (Stream::Stderr, Ok(_)) => decode_line(&mut err_buf),
            };

            if line.is_empty() {
                continue;
            }
            tracing::debug!("{}: {}", label, line);

            if classifier.is_success(&line) && state.confirm() {
                tracing::info!("{} reported startup: {}", label, line);
            }
            if classifier.is_error(&line) {
                state.push_diagnostic(line);
            }
        }

        tracing::debug!("{} output closed", label);
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> LineClassifier {
        LineClassifier::new(
            &["LocalIP=".to_string(), "Ready to go".to_string()],
            &["error".to_string(), "cannot".to_string()],
        )
    }

    #[test]
    fn test_classifier() {
        let c = classifier();
        assert!(c.is_success("LocalIP=192.168.1.20"));
        assert!(!c.is_success("ready to go"));
        assert!(c.is_error("ERROR: socket"));
        assert!(c.is_error("Cannot bind port"));
        assert!(!c.is_error("Device 25411 online"));
    }

    #[test]
    fn test_diagnostics_are_bounded() {
        let state = OutputState::new(2);
        state.push_diagnostic("a".to_string());
        state.push_diagnostic("b".to_string());
        state.push_diagnostic("c".to_string());
        assert_eq!(state.diagnostics(), vec!["b", "c"]);

        state.reset();
        assert!(state.diagnostics().is_empty());
    }

    #[test]
    fn test_confirmation_is_set_once() {
        let state = OutputState::new(4);
        assert!(state.confirm());
        assert!(!state.confirm());
        assert!(state.is_confirmed());
        state.reset();
        assert!(!state.is_confirmed());
    }

    #[tokio::test]
    async fn test_reader_collects_both_streams() {
        let state = Arc::new(OutputState::new(8));
        let stdout: &'static [u8] = b"starting\nLocalIP=10.0.0.5\nReady to go\n";
        let stderr: &'static [u8] = b"error: cannot open /dev/null\nwarning only\n";

        spawn_reader("stack".to_string(), stdout, stderr, classifier(), state.clone())
            .await
            .unwrap();

        assert!(state.is_confirmed());
        assert_eq!(state.diagnostics(), vec!["error: cannot open /dev/null"]);
    }

    #[tokio::test]
    async fn test_reader_survives_invalid_utf8() {
        let state = Arc::new(OutputState::new(8));
        let stdout: &'static [u8] = b"name=\xff\nReady to go\n";
        let stderr: &'static [u8] = b"\xfe\xfd\nerror: bad \xff frame\ntrailing error";

        spawn_reader("stack".to_string(), stdout, stderr, classifier(), state.clone())
            .await
            .unwrap();

        assert!(state.is_confirmed());
        assert_eq!(
            state.diagnostics(),
            vec!["error: bad \u{FFFD} frame".to_string(), "trailing error".to_string()]
        );
    }
}
