use std::time::SystemTime;

use crate::metric::{Metric, Value};

const HEARTBEAT: &str = "heartbeat";
const EXTENDED_SUFFIXES: [&str; 3] = ["min", "avg", "max"];

struct ValueFormatter {
    int_writer: itoa::Buffer,
    float_writer: ryu::Buffer,
}

impl ValueFormatter {
    fn new() -> Self {
        Self { int_writer: itoa::Buffer::new(), float_writer: ryu::Buffer::new() }
    }

    fn format(&mut self, value: Value) -> &str {
        match value {
            Value::Integer(v) => self.int_writer.format(v),
            Value::Float(v) => self.float_writer.format(v),
        }
    }

    fn format_timestamp(&mut self, timestamp: SystemTime) -> &str {
        let secs = timestamp
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0.0, |elapsed| elapsed.as_secs_f64());
        self.float_writer.format(secs)
    }
}

/// Writes metrics in the Carbon plaintext protocol.
///
/// Every point is a single newline-terminated line of the form `<path> <value> <timestamp>`, where the path is the
/// metric name prefixed by the namespace (if any) and the timestamp is in fractional seconds since the Unix epoch. A
/// batch is the concatenation of a heartbeat line and any number of metric lines, and is sent as a single payload.
///
/// A metric contributes one line for its simple value, if it has one, and three lines (`.min`, `.avg` and `.max`) for
/// its extended aggregate, if any observations were recorded. A metric with neither contributes nothing.
pub struct PayloadWriter {
    buf: Vec<u8>,
    lines_written: usize,
    formatter: ValueFormatter,
}

impl PayloadWriter {
    /// Creates an empty `PayloadWriter`.
    pub fn new() -> Self {
        Self { buf: Vec::new(), lines_written: 0, formatter: ValueFormatter::new() }
    }

    fn write_path(&mut self, prefix: Option<&str>, name: &str, suffix: Option<&str>) {
        if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
            self.buf.extend_from_slice(prefix.as_bytes());
            self.buf.push(b'.');
        }

        // Graphite tags (`name;k=v`) must come after the stat suffix.
        let (base, tags) = match name.find(';') {
            Some(idx) => name.split_at(idx),
            None => (name, ""),
        };

        self.buf.extend_from_slice(base.as_bytes());

        if let Some(suffix) = suffix {
            self.buf.push(b'.');
            self.buf.extend_from_slice(suffix.as_bytes());
        }

        self.buf.extend_from_slice(tags.as_bytes());
    }

    fn write_line(
        &mut self,
        prefix: Option<&str>,
        name: &str,
        suffix: Option<&str>,
        value: Value,
        timestamp: SystemTime,
    ) {
        self.write_path(prefix, name, suffix);

        self.buf.push(b' ');
        let value_str = self.formatter.format(value);
        self.buf.extend_from_slice(value_str.as_bytes());

        self.buf.push(b' ');
        let ts_str = self.formatter.format_timestamp(timestamp);
        self.buf.extend_from_slice(ts_str.as_bytes());

        self.buf.push(b'\n');
        self.lines_written += 1;
    }

    /// Writes the heartbeat line that leads every batch.
    pub fn write_heartbeat(&mut self, prefix: Option<&str>, counter: u32, timestamp: SystemTime) {
        self.write_line(prefix, HEARTBEAT, None, Value::from(counter), timestamp);
    }

    /// Writes every line for the given metric, returning the number of lines written.
    pub fn write_metric(&mut self, prefix: Option<&str>, metric: &Metric) -> usize {
        let mut written = 0;

        if let Some(simple) = metric.simple() {
            self.write_line(prefix, metric.name(), None, simple.value(), simple.timestamp());
            written += 1;
        }

        let aggregate = metric.aggregate();
        if let (Some(min), Some(avg), Some(max), Some(timestamp)) =
            (aggregate.min(), aggregate.avg(), aggregate.max(), aggregate.timestamp())
        {
            for (suffix, value) in EXTENDED_SUFFIXES.into_iter().zip([min, avg, max]) {
                self.write_line(prefix, metric.name(), Some(suffix), Value::Float(value), timestamp);
                written += 1;
            }
        }

        written
    }

    /// Returns the number of lines written so far.
    pub fn lines_written(&self) -> usize {
        self.lines_written
    }

    /// Returns the number of bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Returns the payload written so far.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Consumes the writer, returning the payload.
    pub fn into_payload(self) -> Vec<u8> {
        self.buf
    }

    /// Clears the writer so it can be reused for another batch.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.lines_written = 0;
    }
}

impl Default for PayloadWriter {
    fn default() -> Self {
        Self::new()
    }
}
