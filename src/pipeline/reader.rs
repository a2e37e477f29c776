//! DataReader: parses CSV files into validated rows.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use whois_ingest_core::domain::RowValidator;
use whois_ingest_core::models::keys;

use super::{push, Row, StageControl};
use crate::events::EventTracker;

const FILE_POLL: Duration = Duration::from_millis(200);

pub struct DataReader {
    pipeline: usize,
    file_queue: Receiver<PathBuf>,
    data_queue: Sender<Row>,
    events: EventTracker,
    control: Arc<StageControl>,
    validator: RowValidator,
}

impl DataReader {
    pub fn new(
        pipeline: usize,
        file_queue: Receiver<PathBuf>,
        data_queue: Sender<Row>,
        events: EventTracker,
        control: Arc<StageControl>,
    ) -> Result<Self, regex::Error> {
        Ok(Self {
            pipeline,
            file_queue,
            data_queue,
            events,
            control,
            validator: RowValidator::new()?,
        })
    }

    pub fn run(self) {
        loop {
            if !self.control.wait_while_paused() {
                break;
            }
            match self.file_queue.recv_timeout(FILE_POLL) {
                Ok(path) => self.parse_file(&path),
                Err(RecvTimeoutError::Timeout) => {
                    if self.events.file_reader_done() {
                        // a path may have landed between the timeout and the flag
                        match self.file_queue.try_recv() {
                            Ok(path) => self.parse_file(&path),
                            Err(_) => {
                                debug!(pipeline = self.pipeline, "file reader done seen");
                                break;
                            }
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!(pipeline = self.pipeline, "reader exiting");
    }

    fn parse_file(&self, path: &Path) {
        if self.control.is_shutdown() {
            return;
        }

        match std::fs::metadata(path) {
            Ok(meta) if meta.len() == 0 => {
                warn!(file = %path.display(), "file empty");
                return;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(file = %path.display(), error = %e, "unable to stat file, skipping");
                return;
            }
        }

        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                warn!(file = %path.display(), error = %e, "file could not be opened");
                return;
            }
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::Fields)
            .from_reader(StrictQuotes::new(file));

        info!(pipeline = self.pipeline, file = %path.display(), "processing file");

        let mut records = reader.records();
        let header: Vec<String> = match records.next() {
            Some(Ok(record)) => record.iter().map(str::to_string).collect(),
            Some(Err(e)) => {
                error!(file = %path.display(), error = %e, "unable to read csv header");
                return;
            }
            None => {
                warn!(file = %path.display(), "file has no header");
                return;
            }
        };
        let Some(domain_idx) = header.iter().position(|h| h == keys::DOMAIN_NAME) else {
            error!(file = %path.display(), "CSV header not found");
            return;
        };
        let header = Arc::new(header);

        let mut accepted = 0u64;
        for result in records {
            if !self.control.wait_while_paused() {
                debug!(pipeline = self.pipeline, "shutdown received");
                break;
            }
            let record = match result {
                Ok(record) => record,
                Err(e) => {
                    let line = e.position().map(|p| p.line()).unwrap_or(0);
                    error!(file = %path.display(), line, error = %e, "CSV parse error");
                    break;
                }
            };
            let fields: Vec<String> = record.iter().map(str::to_string).collect();
            if fields.iter().all(String::is_empty) {
                warn!(file = %path.display(), "skipping empty row");
                continue;
            }
            if let Err(e) = self.validator.validate(&header, &fields, domain_idx) {
                warn!(file = %path.display(), error = %e, "invalid row dropped");
                continue;
            }
            let row = Row {
                header: Arc::clone(&header),
                fields,
            };
            if !push(&self.data_queue, row, &self.control) {
                break;
            }
            accepted += 1;
        }
        debug!(pipeline = self.pipeline, file = %path.display(), rows = accepted, "file done");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum QuoteState {
    FieldStart,
    Unquoted,
    Quoted,
    /// A quote seen inside a quoted field: either a doubled quote or the
    /// closing one.
    QuoteInQuoted,
}

/// Byte stream guard that fails on quoting the csv crate would accept
/// leniently: anything but a delimiter, a line end or a second quote after a
/// closing quote, and input ending inside a quoted field.
///
/// Input is passed through up to the start of the offending record, so every
/// complete record before it is still parsed; the following read fails.
struct StrictQuotes<R> {
    inner: R,
    state: QuoteState,
    line: u64,
    failure: Option<String>,
}

impl<R: Read> StrictQuotes<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            state: QuoteState::FieldStart,
            line: 1,
            failure: None,
        }
    }

    /// Advance over one byte. Returns whether it ended a record.
    fn scan(&mut self, byte: u8) -> Result<bool, String> {
        use QuoteState::*;

        let mut record_end = false;
        self.state = match (self.state, byte) {
            (Quoted, b'"') => QuoteInQuoted,
            (Quoted, _) => Quoted,
            (FieldStart, b'"') | (QuoteInQuoted, b'"') => Quoted,
            (_, b',') => FieldStart,
            (_, b'\n') | (_, b'\r') => {
                record_end = true;
                FieldStart
            }
            (QuoteInQuoted, _) => {
                return Err(format!("'\"' expected after '\"' on line {}", self.line));
            }
            _ => Unquoted,
        };
        if byte == b'\n' {
            self.line += 1;
        }
        Ok(record_end)
    }

    fn fail(&mut self, message: String) -> io::Error {
        self.failure = Some(message.clone());
        io::Error::new(io::ErrorKind::InvalidData, message)
    }
}

impl<R: Read> Read for StrictQuotes<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(message) = &self.failure {
            return Err(io::Error::new(io::ErrorKind::InvalidData, message.clone()));
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            if self.state == QuoteState::Quoted {
                let message = format!("unexpected end of data inside quotes on line {}", self.line);
                return Err(self.fail(message));
            }
            return Ok(0);
        }

        let mut record_start = 0;
        for (i, &byte) in buf[..n].iter().enumerate() {
            match self.scan(byte) {
                Ok(true) => record_start = i + 1,
                Ok(false) => {}
                Err(message) => {
                    let err = self.fail(message);
                    if record_start > 0 {
                        return Ok(record_start);
                    }
                    return Err(err);
                }
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{bounded, unbounded};
    use tempfile::TempDir;

    fn read_files(files: &[(&str, &str)]) -> Vec<Row> {
        let tmp = TempDir::new().unwrap();
        let (file_tx, file_rx) = unbounded();
        for (name, content) in files {
            let path = tmp.path().join(name);
            std::fs::write(&path, content).unwrap();
            file_tx.send(path).unwrap();
        }
        let (data_tx, data_rx) = bounded(1000);
        let events = EventTracker::new();
        events.set_file_reader_done();
        DataReader::new(0, file_rx, data_tx, events, StageControl::new())
            .unwrap()
            .run();
        data_rx.try_iter().collect()
    }

    #[test]
    fn valid_rows_are_forwarded() {
        let rows = read_files(&[(
            "a.csv",
            "domainName,registrant_name\nexample.com,Alice\nexample.org, Bob \n",
        )]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields, vec!["example.com", "Alice"]);
        assert_eq!(rows[1].fields[1], "Bob");
        assert_eq!(rows[0].header[0], "domainName");
    }

    #[test]
    fn malformed_rows_are_dropped() {
        let long_label = "a".repeat(64);
        let content = format!(
            "domainName,registrant_name\n\
             ,Nobody\n\
             {}.com,Long\n\
             short.com\n\
             nodot,x\n\
             good.com,Alice\n",
            long_label
        );
        let rows = read_files(&[("a.csv", &content)]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields[0], "good.com");
    }

    #[test]
    fn files_without_domain_column_or_content_are_skipped() {
        let rows = read_files(&[
            ("empty.csv", ""),
            ("noheader.csv", "name,registrant\nexample.com,Alice\n"),
            ("ok.csv", "registrant_name,domainName\nAlice,example.com\n"),
        ]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].fields[1], "example.com");
    }

    #[test]
    fn csv_syntax_error_stops_the_file() {
        let rows = read_files(&[
            (
                "bad.csv",
                "domainName,registrant_name\na.com,x\nb.com,\"unterminated\nc.com,y\n",
            ),
            (
                "misquoted.csv",
                "domainName,registrant_name\ne.com,Eve\nf.com,\"Al\"ice\ng.com,Bob\n",
            ),
            ("next.csv", "domainName,registrant_name\nd.com,z\n"),
        ]);
        let domains: Vec<&str> = rows.iter().map(|r| r.fields[0].as_str()).collect();
        assert_eq!(domains, vec!["a.com", "e.com", "d.com"]);
    }

    #[test]
    fn quoted_fields_follow_csv_rules() {
        let rows = read_files(&[(
            "a.csv",
            "domainName,registrant_name,address\n\
             a.com,\"Al \"\"The\"\" Ice\",\"1 Main St\nSpringfield\"\n\
             b.com,O\"Brien,\"\"\r\n",
        )]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].fields[1], "Al \"The\" Ice");
        assert_eq!(rows[0].fields[2], "1 Main St\nSpringfield");
        assert_eq!(rows[1].fields[1], "O\"Brien");
        assert_eq!(rows[1].fields[2], "");
    }

    #[test]
    fn strict_quotes_passes_complete_records_before_a_bad_one() {
        let input = "a,b\nc,\"d\"x\ne,f\n";
        let mut guard = StrictQuotes::new(input.as_bytes());
        let mut buf = [0u8; 64];
        let n = guard.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"a,b\n");
        let err = guard.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert!(err.to_string().contains("line 2"));
    }
}
