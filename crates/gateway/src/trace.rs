//! Tracing setup. Every formatted log line is passed through the secret
//! redactor before it reaches stderr, so provider keys and tokens never
//! land in logs regardless of which module emitted them.

use std::io::Write;

use tracing_subscriber::fmt::MakeWriter;

use wf_domain::redact::redact;

/// `MakeWriter` that wraps stderr with redaction.
#[derive(Clone, Default)]
pub struct RedactingStderr;

pub struct RedactingWriter {
    inner: std::io::Stderr,
}

impl Write for RedactingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        let cleaned = redact(&text);
        self.inner.write_all(cleaned.as_bytes())?;
        // Report the original length: the caller tracks its own buffer.
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

impl<'a> MakeWriter<'a> for RedactingStderr {
    type Writer = RedactingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RedactingWriter {
            inner: std::io::stderr(),
        }
    }
}

/// Install the global subscriber: env-filter (default `info`) over a
/// redacting stderr writer.
pub fn init() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(RedactingStderr)
        .init();
}
