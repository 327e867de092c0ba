use std::io::Write;

/// Prepends `package:task: ` to every line it forwards, so interleaved task
/// output stays attributable.
pub struct PrefixedWriter<W> {
    prefix: String,
    writer: W,
    buffer: Vec<u8>,
}

impl<W: Write> PrefixedWriter<W> {
    pub fn new(prefix: String, writer: W) -> Self {
        Self {
            prefix,
            writer,
            buffer: Vec::new(),
        }
    }
}

impl<W: Write> Write for PrefixedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        while let Some(newline_index) = self.buffer.iter().position(|byte| *byte == b'\n') {
            // Assemble prefix and line into one write so that concurrent
            // tasks interleave at line granularity.
            let mut line = Vec::with_capacity(self.prefix.len() + newline_index + 1);
            line.extend_from_slice(self.prefix.as_bytes());
            line.extend(self.buffer.drain(..=newline_index));
            self.writer.write_all(&line)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let mut line = Vec::with_capacity(self.prefix.len() + self.buffer.len() + 1);
            line.extend_from_slice(self.prefix.as_bytes());
            line.append(&mut self.buffer);
            line.push(b'\n');
            self.writer.write_all(&line)?;
        }
        self.writer.flush()
    }
}

/// Fans writes out to multiple sinks, e.g. the log file and the terminal.
pub struct MultiWriter<'a> {
    writers: Vec<&'a mut (dyn Write + Send)>,
}

impl<'a> MultiWriter<'a> {
    pub fn new(writers: Vec<&'a mut (dyn Write + Send)>) -> Self {
        Self { writers }
    }
}

impl Write for MultiWriter<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        for writer in self.writers.iter_mut() {
            writer.write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        for writer in self.writers.iter_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}
