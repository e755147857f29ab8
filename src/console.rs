//! Console endpoints behind descriptors 0 and 1. Reads are line at a
//! time; writes are buffered and pushed out after every call.
//!
//! The endpoints are injectable so a test (or any embedder) can feed
//! input and capture output; `Console::stdio` wires them to the host's
//! standard streams.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::sync::Mutex;

struct ConsoleIn {
    src: Box<dyn BufRead + Send>,
    /// Bytes of the current line not yet handed to a reader.
    pending: VecDeque<u8>,
}

pub struct Console {
    input: Mutex<ConsoleIn>,
    output: Mutex<Box<dyn Write + Send>>,
}

impl Console {
    pub fn new(input: Box<dyn BufRead + Send>, output: Box<dyn Write + Send>) -> Self {
        Self {
            input: Mutex::new(ConsoleIn {
                src: input,
                pending: VecDeque::new(),
            }),
            output: Mutex::new(output),
        }
    }

    /// Console on the host's stdin/stdout.
    pub fn stdio() -> Self {
        Self::new(
            Box::new(BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    /// Fills `buf` from console input, pulling at most one fresh line
    /// from the source. Returns the bytes copied; 0 at end of input.
    pub fn read(&self, buf: &mut [u8]) -> usize {
        let mut input = self.input.lock().unwrap();
        if input.pending.is_empty() {
            let mut line = String::new();
            if input.src.read_line(&mut line).unwrap_or(0) == 0 {
                return 0;
            }
            input.pending.extend(line.into_bytes());
        }

        let mut done = 0;
        while done < buf.len() {
            match input.pending.pop_front() {
                Some(b) => {
                    buf[done] = b;
                    done += 1;
                }
                None => break,
            }
        }
        done
    }

    /// Writes `buf` to console output and flushes it through.
    pub fn write(&self, buf: &[u8]) -> usize {
        let mut output = self.output.lock().unwrap();
        if output.write_all(buf).is_err() {
            return 0;
        }
        let _ = output.flush();
        buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Output sink tests can inspect afterwards.
    #[derive(Clone, Default)]
    pub(crate) struct Sink(pub Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn console_over(input: &'static str) -> (Console, Sink) {
        let sink = Sink::default();
        let console = Console::new(
            Box::new(io::Cursor::new(input.as_bytes())),
            Box::new(sink.clone()),
        );
        (console, sink)
    }

    #[test]
    fn reads_line_by_line() {
        let (console, _) = console_over("first line\nsecond\n");
        let mut buf = [0u8; 64];

        let n = console.read(&mut buf);
        assert_eq!(&buf[..n], b"first line\n");

        let n = console.read(&mut buf);
        assert_eq!(&buf[..n], b"second\n");

        assert_eq!(console.read(&mut buf), 0);
    }

    #[test]
    fn short_reads_keep_the_rest_of_the_line() {
        let (console, _) = console_over("abcdef\n");
        let mut buf = [0u8; 3];
        assert_eq!(console.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(console.read(&mut buf), 3);
        assert_eq!(&buf, b"def");
    }

    #[test]
    fn writes_reach_the_sink() {
        let (console, sink) = console_over("");
        assert_eq!(console.write(b"hello"), 5);
        assert_eq!(&*sink.0.lock().unwrap(), b"hello");
    }
}
