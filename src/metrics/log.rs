//! HdrHistogram interval logs.
//!
//! A log opens with a comment, a format version marker, the start time and the
//! column legend, then carries one line per interval:
//!
//! ```text
//! #[Latency histogram (based on correct start times), logged with pacebench]
//! #[Histogram log format version 1.3]
//! #[StartTime: 1712345678.901 (seconds since epoch)]
//! "StartTimestamp","Interval_Length","Interval_Max","Interval_Compressed_Histogram"
//! 0.000,1.000,12.345,HISTFAAAA...
//! ```
//!
//! Offsets are seconds since the log's base time, maxima are in milliseconds.
//! Encoding happens on a blocking task fed through a channel so the sampling
//! loop never waits on I/O.
use std::{
    io::Write,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::{Engine as _, engine::general_purpose::STANDARD};
use hdrhistogram::{
    Histogram,
    serialization::{Serializer, V2DeflateSerializer},
};
use tokio::{
    sync::mpsc::{UnboundedSender, unbounded_channel},
    task::JoinHandle,
};

use crate::error::{Error, Result};

pub const LOG_FORMAT_VERSION: &str = "1.3";

const LEGEND: &str =
    "\"StartTimestamp\",\"Interval_Length\",\"Interval_Max\",\"Interval_Compressed_Histogram\"";

/// Recorded values are nanoseconds, the log reports milliseconds.
const MAX_VALUE_DIVISOR: f64 = 1_000_000.0;

pub const RESPONSE_TIME_COMMENT: &str =
    "[Latency histogram (based on correct start times), logged with pacebench]";
pub const SERVICE_TIME_COMMENT: &str =
    "[Latency histogram (based on uncorrected start times), logged with pacebench]";

/// One interval's histogram, positioned relative to the log's base time.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub start: Duration,
    pub length: Duration,
    pub histogram: Histogram<u64>,
}

/// Cloneable handle that queues entries for a [`HistogramLog`].
#[derive(Debug, Clone)]
pub struct LogSender {
    tx: UnboundedSender<LogEntry>,
}

impl LogSender {
    pub fn write(&self, entry: LogEntry) -> Result<()> {
        self.tx
            .send(entry)
            .map_err(|_| Error::HistogramLog("log writer has shut down".to_string()))
    }
}

/// An open interval log. Must be opened inside a tokio runtime.
#[derive(Debug)]
pub struct HistogramLog {
    sender: LogSender,
    task: JoinHandle<Result<()>>,
}

impl HistogramLog {
    /// Writes the header to `writer` and starts the encoding task.
    pub fn open<W>(mut writer: W, comment: &str, start_time: SystemTime) -> Result<Self>
    where
        W: Write + Send + 'static,
    {
        write_header(&mut writer, comment, start_time)?;

        let (tx, mut rx) = unbounded_channel::<LogEntry>();
        let task = tokio::task::spawn_blocking(move || -> Result<()> {
            let mut serializer = V2DeflateSerializer::new();
            let mut buf = Vec::new();
            while let Some(entry) = rx.blocking_recv() {
                write_interval(&mut writer, &mut serializer, &mut buf, &entry)?;
            }
            writer.flush()?;
            Ok(())
        });

        Ok(Self {
            sender: LogSender { tx },
            task,
        })
    }

    pub fn sender(&self) -> LogSender {
        self.sender.clone()
    }

    /// Flushes queued entries and closes the log. Entries sent through
    /// outstanding [`LogSender`] clones are written as long as they were sent
    /// before those clones were dropped.
    pub async fn close(self) -> Result<()> {
        drop(self.sender);
        self.task.await?
    }
}

fn write_header<W: Write>(writer: &mut W, comment: &str, start_time: SystemTime) -> Result<()> {
    let start = start_time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64();
    writeln!(writer, "#{comment}")?;
    writeln!(writer, "#[Histogram log format version {LOG_FORMAT_VERSION}]")?;
    writeln!(writer, "#[StartTime: {start:.3} (seconds since epoch)]")?;
    writeln!(writer, "{LEGEND}")?;
    Ok(())
}

/// `start,length,max_ms,` followed by the base64 of the deflated histogram.
fn write_interval<W: Write>(
    writer: &mut W,
    serializer: &mut V2DeflateSerializer,
    buf: &mut Vec<u8>,
    entry: &LogEntry,
) -> Result<()> {
    buf.clear();
    serializer
        .serialize(&entry.histogram, buf)
        .map_err(|e| Error::HistogramLog(format!("{e:?}")))?;
    writeln!(
        writer,
        "{:.3},{:.3},{:.3},{}",
        entry.start.as_secs_f64(),
        entry.length.as_secs_f64(),
        entry.histogram.max() as f64 / MAX_VALUE_DIVISOR,
        STANDARD.encode(&buf[..])
    )?;
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::{testing::*, *};

    #[tokio::test]
    async fn header_lines_in_order() {
        let buf = SharedBuf::default();
        let start = UNIX_EPOCH + Duration::from_millis(1_700_000_000_250);
        let log = HistogramLog::open(buf.clone(), RESPONSE_TIME_COMMENT, start).unwrap();
        let mut histogram = Histogram::<u64>::new(3).unwrap();
        histogram.record(5_000_000).unwrap();
        log.sender()
            .write(LogEntry {
                start: Duration::ZERO,
                length: Duration::from_secs(1),
                histogram,
            })
            .unwrap();
        log.close().await.unwrap();

        let text = buf.contents();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 5, "{text}");
        assert_eq!(
            lines[..4],
            [
                "#[Latency histogram (based on correct start times), logged with pacebench]",
                "#[Histogram log format version 1.3]",
                "#[StartTime: 1700000000.250 (seconds since epoch)]",
                LEGEND,
            ]
        );
        assert!(lines[4].starts_with("0.000,1.000,5.00"), "{}", lines[4]);
        assert!(lines[4].contains(",HISTF"));
    }

    #[test]
    fn interval_histogram_decodes_back() {
        let mut histogram = Histogram::<u64>::new(3).unwrap();
        histogram.record(12_000_000).unwrap();
        histogram.record(7_000_000).unwrap();
        let mut out = Vec::new();
        write_interval(
            &mut out,
            &mut V2DeflateSerializer::new(),
            &mut Vec::new(),
            &LogEntry {
                start: Duration::from_millis(2_500),
                length: Duration::from_millis(500),
                histogram,
            },
        )
        .unwrap();

        let line = String::from_utf8(out).unwrap();
        let fields: Vec<_> = line.trim_end().split(',').collect();
        assert_eq!(fields[..2], ["2.500", "0.500"]);
        let bytes = STANDARD.decode(fields[3]).unwrap();
        let decoded: Histogram<u64> = hdrhistogram::serialization::Deserializer::new()
            .deserialize(&mut &bytes[..])
            .unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[tokio::test]
    async fn writes_one_line_per_interval() {
        let buf = SharedBuf::default();
        let log = HistogramLog::open(buf.clone(), SERVICE_TIME_COMMENT, SystemTime::now()).unwrap();

        let sender = log.sender();
        for i in 0..3u64 {
            let mut histogram = Histogram::<u64>::new(3).unwrap();
            histogram.record(12_000_000 * (i + 1)).unwrap();
            sender
                .write(LogEntry {
                    start: Duration::from_secs(i),
                    length: Duration::from_secs(1),
                    histogram,
                })
                .unwrap();
        }
        drop(sender);
        log.close().await.unwrap();

        let text = buf.contents();
        assert!(text.starts_with(&format!("#{SERVICE_TIME_COMMENT}\n")));

        let lines = interval_lines(&text);
        assert_eq!(lines.len(), 3);
        for (i, line) in lines.iter().enumerate() {
            let fields: Vec<_> = line.split(',').collect();
            assert_eq!(fields.len(), 4, "{line}");
            let start: f64 = fields[0].parse().unwrap();
            let length: f64 = fields[1].parse().unwrap();
            let max_ms: f64 = fields[2].parse().unwrap();
            assert_eq!(start, i as f64);
            assert_eq!(length, 1.0);
            assert!((max_ms - 12.0 * (i as f64 + 1.0)).abs() < 0.1);
            assert!(fields[3].starts_with("HISTF"));
        }
    }
}
