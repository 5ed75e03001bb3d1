//! Event stream interface and its file-backed implementation

use crate::error::{EventStreamError, EventStreamResult};
use crate::journal::{self, EventEntry, MAX_PAYLOAD_LEN, SEGMENT_HEADER_LEN};

use async_trait::async_trait;
use cachemeta_common::{EventSequencePoint, LogId, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Consumer of entries produced by [`EventStream::read_events_from`].
/// `accept` may suspend, which throttles the reader.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn accept(&self, entry: EventEntry) -> Result<()>;
}

/// Appendable, sealable log of serialized write requests
#[async_trait]
pub trait EventStream: Send + Sync {
    /// Append a request; returns the position it was written at
    async fn write_event(&self, kind: u8, payload: &[u8]) -> Result<LogId>;

    /// Feed every entry at or after `position` to `sink`, in log order.
    /// Returns the position at which live writing should resume.
    async fn read_events_from(&self, position: LogId, sink: &dyn EventSink) -> Result<LogId>;

    /// Make everything written so far durable and return the position of the
    /// last entry (`LogId::ORIGIN` when nothing was written)
    async fn before_checkpoint(&self) -> Result<EventSequencePoint>;

    /// Bookkeeping once a checkpoint anchored at `point` is durable
    async fn after_checkpoint(&self, point: EventSequencePoint) -> Result<()>;

    /// Enable or disable appends
    fn set_logging(&self, enabled: bool);

    fn is_logging(&self) -> bool;

    /// Start a fresh segment so the next write lands at `resume`
    async fn seal_or_rotate(&self, resume: LogId) -> Result<()>;
}

/// Writer side of the current segment
struct SegmentWriter {
    writer: Option<BufWriter<File>>,
    /// Position the next append receives
    next_position: LogId,
    /// Bytes in the current segment
    current_size: u64,
}

/// Segmented event log in a directory
pub struct FileEventStream {
    dir: PathBuf,
    max_segment_size: u64,
    state: Mutex<SegmentWriter>,
    logging: AtomicBool,
}

impl FileEventStream {
    /// Open (or create) the log in `dir`. Logging starts disabled.
    pub fn open<P: AsRef<Path>>(dir: P, max_segment_size: u64) -> EventStreamResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let segments = journal::list_segments(&dir)?;
        let (next_position, writer, current_size) = match segments.last() {
            Some((first, path)) => {
                let (last, valid_len) = Self::scan_segment(path, *first)?;
                let next = last.map_or(*first, LogId::next);
                let file = OpenOptions::new().append(true).open(path)?;
                let size = file.metadata()?.len();
                // Drop a torn tail so new entries follow the last valid one
                if size > valid_len {
                    warn!(
                        "Truncating {} bytes of torn tail from {:?}",
                        size - valid_len,
                        path
                    );
                    file.set_len(valid_len)?;
                    file.sync_data()?;
                }
                (next, Some(BufWriter::new(file)), valid_len)
            }
            None => (LogId::INITIAL, None, 0),
        };

        info!(
            "Opened event stream at {:?}: segments={}, next={}",
            dir,
            segments.len(),
            next_position
        );

        Ok(Self {
            dir,
            max_segment_size,
            state: Mutex::new(SegmentWriter {
                writer,
                next_position,
                current_size,
            }),
            logging: AtomicBool::new(false),
        })
    }

    /// Position the next append receives
    pub fn next_position(&self) -> LogId {
        self.state.lock().next_position
    }

    /// Last valid position in a segment and the byte length of its valid
    /// prefix
    fn scan_segment(path: &Path, first: LogId) -> EventStreamResult<(Option<LogId>, u64)> {
        let mut reader = BufReader::new(File::open(path)?);
        let header_first = journal::read_header(&mut reader)?;
        if header_first != first {
            return Err(EventStreamError::Corrupt(format!(
                "segment {path:?} starts at {header_first}, name says {first}"
            )));
        }
        let mut last = None;
        let mut valid_len = SEGMENT_HEADER_LEN;
        while let Some(entry) = EventEntry::deserialize(&mut reader)? {
            last = Some(entry.position);
            valid_len += entry.encoded_len();
        }
        Ok((last, valid_len))
    }

    /// Create a fresh segment starting at `first`
    fn create_segment(&self, first: LogId) -> EventStreamResult<BufWriter<File>> {
        let path = journal::segment_path(&self.dir, first);
        let file = File::create(&path)?;
        let mut writer = BufWriter::new(file);
        journal::write_header(&mut writer, first)?;
        debug!("Created event segment {:?}", path);
        Ok(writer)
    }

    fn append(&self, kind: u8, payload: &[u8]) -> EventStreamResult<LogId> {
        if !self.is_logging() {
            return Err(EventStreamError::LoggingDisabled);
        }
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(EventStreamError::EntryTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_LEN,
            });
        }

        let mut state = self.state.lock();
        let position = state.next_position;
        if state.writer.is_none() {
            state.writer = Some(self.create_segment(position)?);
            state.current_size = SEGMENT_HEADER_LEN;
        }

        let data = EventEntry::new(position, kind, payload.to_vec()).serialize();
        let writer = state
            .writer
            .as_mut()
            .ok_or_else(|| EventStreamError::Corrupt("segment writer missing".to_string()))?;
        writer.write_all(&data)?;
        writer.flush()?;

        state.current_size += data.len() as u64;
        state.next_position = position.next();
        Ok(position)
    }

    fn sync(&self) -> EventStreamResult<LogId> {
        let mut state = self.state.lock();
        if let Some(writer) = state.writer.as_mut() {
            writer.flush()?;
            writer.get_ref().sync_data()?;
        }
        Ok(LogId::new(state.next_position.value().saturating_sub(1)))
    }

    /// Close the current segment if it grew past the limit, then delete
    /// segments whose entries are all covered by `point`.
    fn compact(&self, point: EventSequencePoint) -> EventStreamResult<usize> {
        {
            let mut state = self.state.lock();
            if state.current_size > self.max_segment_size {
                if let Some(mut writer) = state.writer.take() {
                    writer.flush()?;
                }
                state.current_size = 0;
                info!("Rotated event segment at position {}", state.next_position);
            }
        }

        let segments = journal::list_segments(&self.dir)?;
        let covered_until = point.position().next();
        let mut removed = 0;
        // A segment is covered when the following one starts at or before
        // `covered_until`; the last segment is never removed.
        for pair in segments.windows(2) {
            let (_, path) = &pair[0];
            let (next_first, _) = &pair[1];
            if *next_first <= covered_until {
                match std::fs::remove_file(path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to remove event segment {:?}: {}", path, e),
                }
            }
        }
        if removed > 0 {
            info!("Compacted {} event segments up to {}", removed, point);
        }
        Ok(removed)
    }

    fn read_segment(path: &Path, first: LogId) -> EventStreamResult<BufReader<File>> {
        let mut reader = BufReader::new(File::open(path)?);
        let header_first = journal::read_header(&mut reader)?;
        if header_first != first {
            return Err(EventStreamError::Corrupt(format!(
                "segment {path:?} starts at {header_first}, name says {first}"
            )));
        }
        reader.seek(SeekFrom::Start(SEGMENT_HEADER_LEN))?;
        Ok(reader)
    }
}

#[async_trait]
impl EventStream for FileEventStream {
    async fn write_event(&self, kind: u8, payload: &[u8]) -> Result<LogId> {
        Ok(self.append(kind, payload)?)
    }

    async fn read_events_from(&self, position: LogId, sink: &dyn EventSink) -> Result<LogId> {
        let segments = journal::list_segments(&self.dir).map_err(cachemeta_common::Error::from)?;
        let mut expected = position;

        for (i, (first, path)) in segments.iter().enumerate() {
            // Skip segments that end before `position`
            if let Some((next_first, _)) = segments.get(i + 1)
                && *next_first <= position
            {
                continue;
            }
            if *first > expected {
                return Err(EventStreamError::Gap {
                    expected,
                    found: *first,
                }
                .into());
            }

            let mut reader = Self::read_segment(path, *first)?;
            while let Some(entry) = EventEntry::deserialize(&mut reader)? {
                if entry.position < expected {
                    continue;
                }
                if entry.position != expected {
                    return Err(EventStreamError::Gap {
                        expected,
                        found: entry.position,
                    }
                    .into());
                }
                expected = entry.position.next();
                sink.accept(entry).await?;
            }
        }

        debug!("Read event stream from {} up to {}", position, expected);
        Ok(expected)
    }

    async fn before_checkpoint(&self) -> Result<EventSequencePoint> {
        Ok(EventSequencePoint::new(self.sync()?))
    }

    async fn after_checkpoint(&self, point: EventSequencePoint) -> Result<()> {
        self.compact(point)?;
        Ok(())
    }

    fn set_logging(&self, enabled: bool) {
        let was = self.logging.swap(enabled, Ordering::SeqCst);
        if was != enabled {
            info!("Event logging {}", if enabled { "enabled" } else { "disabled" });
        }
    }

    fn is_logging(&self) -> bool {
        self.logging.load(Ordering::SeqCst)
    }

    async fn seal_or_rotate(&self, resume: LogId) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(mut writer) = state.writer.take() {
            writer.flush().map_err(EventStreamError::from)?;
        }
        state.current_size = 0;
        state.next_position = resume;
        info!("Sealed event stream; next write at {}", resume);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct CollectingSink {
        entries: Mutex<Vec<EventEntry>>,
    }

    #[async_trait]
    impl EventSink for CollectingSink {
        async fn accept(&self, entry: EventEntry) -> Result<()> {
            self.entries.lock().push(entry);
            Ok(())
        }
    }

    impl CollectingSink {
        fn positions(&self) -> Vec<u64> {
            self.entries.lock().iter().map(|e| e.position.value()).collect()
        }
    }

    fn open_logging(dir: &Path, max_segment_size: u64) -> FileEventStream {
        let stream = FileEventStream::open(dir, max_segment_size).unwrap();
        stream.set_logging(true);
        stream
    }

    #[tokio::test]
    async fn test_writes_are_rejected_while_disabled() {
        let dir = tempdir().unwrap();
        let stream = FileEventStream::open(dir.path(), 1024).unwrap();
        assert!(!stream.is_logging());
        assert!(matches!(
            stream.write_event(1, b"x").await,
            Err(cachemeta_common::Error::LogWritingDisabled)
        ));
        stream.set_logging(true);
        assert_eq!(stream.write_event(1, b"x").await.unwrap(), LogId::INITIAL);
    }

    #[tokio::test]
    async fn test_read_from_position() {
        let dir = tempdir().unwrap();
        let stream = open_logging(dir.path(), 1024 * 1024);
        for i in 0..10u8 {
            stream.write_event(1, &[i]).await.unwrap();
        }

        let sink = CollectingSink::default();
        let resume = stream.read_events_from(LogId::new(4), &sink).await.unwrap();
        assert_eq!(resume, LogId::new(11));
        assert_eq!(sink.positions(), (4..=10).collect::<Vec<_>>());
        assert_eq!(sink.entries.lock()[0].payload.as_ref(), &[3u8]);

        // Reading past the head returns the requested position untouched
        let empty = CollectingSink::default();
        let resume = stream.read_events_from(LogId::new(11), &empty).await.unwrap();
        assert_eq!(resume, LogId::new(11));
        assert!(empty.positions().is_empty());
    }

    #[tokio::test]
    async fn test_before_checkpoint_reports_last_written() {
        let dir = tempdir().unwrap();
        let stream = open_logging(dir.path(), 1024);
        assert_eq!(
            stream.before_checkpoint().await.unwrap().position(),
            LogId::ORIGIN
        );
        stream.write_event(1, b"a").await.unwrap();
        stream.write_event(1, b"b").await.unwrap();
        assert_eq!(
            stream.before_checkpoint().await.unwrap().position(),
            LogId::new(2)
        );
    }

    #[tokio::test]
    async fn test_reopen_recovers_next_position() {
        let dir = tempdir().unwrap();
        {
            let stream = open_logging(dir.path(), 1024);
            for _ in 0..3 {
                stream.write_event(2, b"payload").await.unwrap();
            }
        }
        let stream = open_logging(dir.path(), 1024);
        assert_eq!(stream.next_position(), LogId::new(4));
        assert_eq!(stream.write_event(2, b"more").await.unwrap(), LogId::new(4));
    }

    #[tokio::test]
    async fn test_reopen_truncates_torn_tail() {
        let dir = tempdir().unwrap();
        {
            let stream = open_logging(dir.path(), 1024);
            for _ in 0..3 {
                stream.write_event(2, b"payload").await.unwrap();
            }
        }
        // A crash mid-append leaves part of an entry behind
        let (_, path) = journal::list_segments(dir.path()).unwrap().pop().unwrap();
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[4, 0, 0, 0, 0]).unwrap();
        drop(file);

        let stream = open_logging(dir.path(), 1024);
        assert_eq!(stream.next_position(), LogId::new(4));
        assert_eq!(stream.write_event(2, b"after").await.unwrap(), LogId::new(4));

        let sink = CollectingSink::default();
        let resume = stream.read_events_from(LogId::INITIAL, &sink).await.unwrap();
        assert_eq!(sink.positions(), vec![1, 2, 3, 4]);
        assert_eq!(resume, LogId::new(5));
        assert_eq!(sink.entries.lock()[3].payload.as_ref(), b"after");
    }

    #[tokio::test]
    async fn test_oversized_payload_is_rejected() {
        let dir = tempdir().unwrap();
        let stream = open_logging(dir.path(), 1024);
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert!(stream.write_event(1, &payload).await.is_err());
        assert_eq!(stream.next_position(), LogId::INITIAL);
    }

    #[tokio::test]
    async fn test_after_checkpoint_compacts_covered_segments() {
        let dir = tempdir().unwrap();
        // Tiny segments so every checkpoint rotates
        let stream = open_logging(dir.path(), 1);
        for _ in 0..3 {
            stream.write_event(1, b"a").await.unwrap();
        }
        let first = stream.before_checkpoint().await.unwrap();
        stream.after_checkpoint(first).await.unwrap();

        for _ in 0..2 {
            stream.write_event(1, b"b").await.unwrap();
        }
        let second = stream.before_checkpoint().await.unwrap();
        assert_eq!(second.position(), LogId::new(5));
        stream.after_checkpoint(second).await.unwrap();

        // 1..=3 is gone; the last segment is always kept
        let segments = journal::list_segments(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert_eq!(segments[0].0, LogId::new(4));

        // Entries after the anchor are still readable
        stream.write_event(1, b"c").await.unwrap();
        let sink = CollectingSink::default();
        let resume = stream
            .read_events_from(second.position().next(), &sink)
            .await
            .unwrap();
        assert_eq!(sink.positions(), vec![6]);
        assert_eq!(resume, LogId::new(7));
    }

    #[tokio::test]
    async fn test_seal_moves_head() {
        let dir = tempdir().unwrap();
        let stream = open_logging(dir.path(), 1024);
        stream.write_event(1, b"a").await.unwrap();

        let sink = CollectingSink::default();
        let resume = stream.read_events_from(LogId::INITIAL, &sink).await.unwrap();
        stream.seal_or_rotate(resume).await.unwrap();
        assert_eq!(stream.write_event(1, b"b").await.unwrap(), LogId::new(2));

        let sink = CollectingSink::default();
        stream.read_events_from(LogId::INITIAL, &sink).await.unwrap();
        assert_eq!(sink.positions(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_gap_is_reported() {
        let dir = tempdir().unwrap();
        let stream = open_logging(dir.path(), 1024);
        stream.write_event(1, b"a").await.unwrap();
        stream.seal_or_rotate(LogId::new(5)).await.unwrap();
        stream.write_event(1, b"b").await.unwrap();

        let sink = CollectingSink::default();
        let err = stream.read_events_from(LogId::INITIAL, &sink).await.unwrap_err();
        assert!(matches!(err, cachemeta_common::Error::DataCorruption(_)));
    }
}
