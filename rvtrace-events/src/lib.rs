//! Event logger (C3): Perfetto-style packet records, batched and flushed
//! through the bounded work-queue (C2) to a text sink.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rvtrace_queue::WorkQueue;

/// How many packets accumulate before a batch is handed to the sink.
pub const PACKET_FLUSH_THRESHOLD: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackEventType {
    SliceBegin,
    SliceEnd,
    Instant,
}

impl TrackEventType {
    fn as_proto_name(self) -> &'static str {
        match self {
            TrackEventType::SliceBegin => "TYPE_SLICE_BEGIN",
            TrackEventType::SliceEnd => "TYPE_SLICE_END",
            TrackEventType::Instant => "TYPE_INSTANT",
        }
    }
}

/// One Perfetto packet: either a track descriptor or a track event.
#[derive(Debug, Clone)]
pub enum Packet {
    TrackDescriptor {
        name: String,
        track_id: i32,
    },
    TrackEvent {
        name: String,
        kind: TrackEventType,
        track_id: i32,
        timestamp: u64,
    },
}

impl Packet {
    pub fn instant(name: impl Into<String>, track_id: i32, timestamp: u64) -> Self {
        Packet::TrackEvent {
            name: name.into(),
            kind: TrackEventType::Instant,
            track_id,
            timestamp,
        }
    }

    pub fn slice_begin(name: impl Into<String>, track_id: i32, timestamp: u64) -> Self {
        Packet::TrackEvent {
            name: name.into(),
            kind: TrackEventType::SliceBegin,
            track_id,
            timestamp,
        }
    }

    pub fn slice_end(name: impl Into<String>, track_id: i32, timestamp: u64) -> Self {
        Packet::TrackEvent {
            name: name.into(),
            kind: TrackEventType::SliceEnd,
            track_id,
            timestamp,
        }
    }

    pub fn track_descriptor(name: impl Into<String>, track_id: i32) -> Self {
        Packet::TrackDescriptor {
            name: name.into(),
            track_id,
        }
    }

    pub fn write_text(&self, w: &mut impl Write) -> io::Result<()> {
        match self {
            Packet::TrackEvent {
                name,
                kind,
                track_id,
                timestamp,
            } => {
                writeln!(w, "packet {{")?;
                writeln!(w, "  timestamp: {timestamp}")?;
                writeln!(w, "  track_event: {{")?;
                writeln!(w, "    type: {}", kind.as_proto_name())?;
                writeln!(w, "    name: \"{name}\"")?;
                writeln!(w, "    track_uuid: {track_id}")?;
                writeln!(w, "  }}")?;
                writeln!(w, "  trusted_packet_sequence_id: 1")?;
                writeln!(w, "}}")?;
            }
            Packet::TrackDescriptor { name, track_id } => {
                writeln!(w, "packet {{")?;
                writeln!(w, "  track_descriptor {{")?;
                writeln!(w, "    name: \"{name}\"")?;
                writeln!(w, "    uuid: {track_id}")?;
                writeln!(w, "  }}")?;
                writeln!(w, "}}")?;
            }
        }
        Ok(())
    }
}

/// Buffers packets until [`PACKET_FLUSH_THRESHOLD`] is reached, then hands
/// the batch to a single-worker [`WorkQueue`] that appends the text form to
/// the sink file. A single worker is used deliberately: batches must be
/// written in submission order, and the channel only guarantees FIFO
/// *dequeue* order, not completion order, across more than one worker.
pub struct EventLogger {
    buffer: Vec<Packet>,
    queue: WorkQueue<Vec<Packet>>,
}

impl EventLogger {
    pub fn new(sink_path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::create(sink_path)?;
        let writer = Arc::new(Mutex::new(BufWriter::new(file)));
        let queue = WorkQueue::new(1, move |batch: Vec<Packet>| {
            let mut w = writer.lock().unwrap();
            for packet in &batch {
                if let Err(err) = packet.write_text(&mut *w) {
                    log::error!("failed to write perfetto packet: {err}");
                }
            }
            if let Err(err) = w.flush() {
                log::error!("failed to flush event sink: {err}");
            }
        });
        Ok(EventLogger {
            buffer: Vec::with_capacity(PACKET_FLUSH_THRESHOLD),
            queue,
        })
    }

    /// Accept one packet, flushing a full batch to the sink if the
    /// threshold is reached.
    pub fn submit_packet(&mut self, packet: Packet) {
        self.buffer.push(packet);
        if self.buffer.len() >= PACKET_FLUSH_THRESHOLD {
            self.flush();
        }
    }

    /// Drain any partial batch.
    pub fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(PACKET_FLUSH_THRESHOLD));
        self.queue.queue_job(batch);
    }

    /// Flush, then drain and join the sink worker.
    pub fn stop(&mut self) {
        self.flush();
        self.queue.stop();
    }
}

impl Drop for EventLogger {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instant_packet_text_form() {
        let mut buf = Vec::new();
        Packet::instant("do_execveat_common", 7, 42)
            .write_text(&mut buf)
            .unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("timestamp: 42"));
        assert!(text.contains("type: TYPE_INSTANT"));
        assert!(text.contains("name: \"do_execveat_common\""));
        assert!(text.contains("track_uuid: 7"));
    }

    #[test]
    fn flush_writes_full_batches_and_partial_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.pftrace.txt");
        let mut logger = EventLogger::new(&path).unwrap();
        for i in 0..(PACKET_FLUSH_THRESHOLD + 3) {
            logger.submit_packet(Packet::instant("tick", 1, i as u64));
        }
        logger.stop();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.matches("packet {").count(), PACKET_FLUSH_THRESHOLD + 3);
    }
}
