use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::model::Event;

/// Frames claiming a larger payload are treated as corruption.
const MAX_FRAME_LEN: usize = 1 << 20;

/// `[u32 le: len][bincode: Event][u32 le: crc32(payload)]`
fn write_frame(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(payload.len() as u32).to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc32fast::hash(&payload).to_le_bytes())?;
    Ok(())
}

enum Frame {
    Event { event: Event, len: u64 },
    /// Clean end of file, or a torn/corrupt tail.
    End,
}

/// `read_exact` that reports a short read as `Ok(false)`.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame(reader: &mut impl Read) -> io::Result<Frame> {
    let mut word = [0u8; 4];
    if !fill(reader, &mut word)? {
        return Ok(Frame::End);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(Frame::End);
    }

    let mut payload = vec![0u8; len];
    if !fill(reader, &mut payload)? || !fill(reader, &mut word)? {
        return Ok(Frame::End);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::End);
    }
    match bincode::deserialize::<Event>(&payload) {
        Ok(event) => Ok(Frame::Event {
            event,
            len: (len + 8) as u64,
        }),
        Err(_) => Ok(Frame::End),
    }
}

/// Events recovered from disk plus the byte length of the valid prefix.
pub struct Replay {
    pub events: Vec<Event>,
    pub valid_len: u64,
}

/// Append-only event log. Everything the engine knows is rebuilt from it
/// on startup.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Replay the log at `path`, cut off any torn tail, and open it for
    /// appending. A missing file is an empty log.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let replay = Self::replay(path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let on_disk = file.metadata()?.len();
        if on_disk > replay.valid_len {
            warn!(
                "discarding {} trailing bytes from {}",
                on_disk - replay.valid_len,
                path.display()
            );
            file.set_len(replay.valid_len)?;
            file.sync_all()?;
        }
        let wal = Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        };
        Ok((wal, replay.events))
    }

    /// Read every intact frame. Stops at the first short, oversized, or
    /// corrupt frame.
    pub fn replay(path: &Path) -> io::Result<Replay> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(Replay {
                    events: Vec::new(),
                    valid_len: 0,
                });
            }
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut events = Vec::new();
        let mut valid_len = 0;
        while let Frame::Event { event, len } = read_frame(&mut reader)? {
            events.push(event);
            valid_len += len;
        }
        Ok(Replay { events, valid_len })
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer one event. Nothing is durable until `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        write_frame(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_data()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write `events` to the side file next to `path` and fsync it.
    pub fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            write_frame(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the side file over the log and reopen it for appending.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppointmentStatus, Span};
    use crate::schedule::{DayWindow, WeeklySchedule};
    use chrono::{NaiveTime, Weekday};
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("petbook_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn booked(business_id: Ulid) -> Event {
        Event::AppointmentBooked {
            id: Ulid::new(),
            business_id,
            span: Span::new(1_000, 2_000),
            status: AppointmentStatus::Pending,
            label: Some("Milo".into()),
        }
    }

    fn sample_events() -> Vec<Event> {
        let bid = Ulid::new();
        let window = DayWindow::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(17, 0, 0).unwrap(),
        )
        .unwrap();
        vec![
            Event::BusinessCreated {
                id: bid,
                name: Some("Paws & Claws".into()),
            },
            Event::ScheduleSet {
                business_id: bid,
                schedule: Some(WeeklySchedule::closed().with_day(Weekday::Sat, Some(window))),
            },
            booked(bid),
        ]
    }

    #[test]
    fn append_and_reopen() {
        let path = tmp_path("append_and_reopen.wal");
        let events = sample_events();
        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert!(replayed.is_empty());
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events);
    }

    #[test]
    fn torn_tail_is_cut_before_new_appends() {
        let path = tmp_path("torn_tail.wal");
        let events = sample_events();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&events[0]).unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        {
            let (mut wal, replayed) = Wal::open(&path).unwrap();
            assert_eq!(replayed, events[..1]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);
            wal.append(&events[1]).unwrap();
        }
        // Without the cut, the second event would sit behind garbage and be lost.
        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed, events[..2]);
    }

    #[test]
    fn missing_file_is_empty() {
        let path = tmp_path("missing.wal");
        let replay = Wal::replay(&path).unwrap();
        assert!(replay.events.is_empty());
        assert_eq!(replay.valid_len, 0);
    }

    #[test]
    fn bad_crc_stops_replay() {
        let path = tmp_path("bad_crc.wal");
        let event = Event::BusinessDeleted { id: Ulid::new() };
        {
            let payload = bincode::serialize(&event).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEAD_BEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().events.is_empty());
    }

    #[test]
    fn oversized_length_stops_replay() {
        let path = tmp_path("oversized.wal");
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            wal.append(&Event::BusinessDeleted { id: Ulid::new() }).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events.len(), 1);
    }

    #[test]
    fn compaction_replaces_history() {
        let path = tmp_path("compaction.wal");
        let bid = Ulid::new();
        let created = Event::BusinessCreated { id: bid, name: None };
        let survivor = booked(bid);

        let (mut wal, _) = Wal::open(&path).unwrap();
        wal.append(&created).unwrap();
        for _ in 0..10 {
            let churn = booked(bid);
            let Event::AppointmentBooked { id, .. } = churn else { unreachable!() };
            wal.append(&churn).unwrap();
            wal.append(&Event::AppointmentDeleted { id, business_id: bid }).unwrap();
        }
        wal.append(&survivor).unwrap();
        let before = fs::metadata(&path).unwrap().len();

        let compacted = vec![created, survivor];
        Wal::write_compact_file(wal.path(), &compacted).unwrap();
        wal.swap_compact_file().unwrap();
        assert_eq!(wal.appends_since_compact(), 0);
        assert!(fs::metadata(&path).unwrap().len() < before);

        let after_compact = Event::AppointmentStatusChanged {
            id: Ulid::new(),
            business_id: bid,
            status: AppointmentStatus::Confirmed,
        };
        wal.append(&after_compact).unwrap();
        drop(wal);

        let (_, replayed) = Wal::open(&path).unwrap();
        assert_eq!(replayed.len(), 3);
        assert_eq!(replayed[..2], compacted[..]);
        assert_eq!(replayed[2], after_compact);
    }

    #[test]
    fn buffered_appends_are_counted() {
        let path = tmp_path("buffered.wal");
        let events = sample_events();
        {
            let (mut wal, _) = Wal::open(&path).unwrap();
            for e in &events {
                wal.append_buffered(e).unwrap();
            }
            assert_eq!(wal.appends_since_compact(), 3);
            wal.flush_sync().unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap().events, events);
    }
}
