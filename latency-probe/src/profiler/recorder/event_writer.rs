use super::shared_state::Health;
use crate::profiler::events::ProbeEvent;
use crate::profiler::format::TraceHeader;
use crate::profiler::writer::TraceWriter;
use std::collections::VecDeque;
use std::io;

/// Intermediate layer between the recorder and the raw `TraceWriter`.
///
/// Owns the writer and the backlog of batches that could not be written
/// yet. A failed write leaves the failing event at the front of the
/// backlog, so the next attempt resumes exactly where this one stopped.
pub(crate) struct EventWriter {
    writer: Box<dyn TraceWriter>,
    backlog: VecDeque<Vec<ProbeEvent>>,
    /// Events of the front backlog batch already written.
    offset: usize,
}

impl EventWriter {
    /// Emit the session header and wrap the writer.
    pub(crate) fn start(mut writer: Box<dyn TraceWriter>, header: &TraceHeader) -> io::Result<Self> {
        writer.write_header(header)?;
        Ok(Self {
            writer,
            backlog: VecDeque::new(),
            offset: 0,
        })
    }

    pub(crate) fn has_backlog(&self) -> bool {
        !self.backlog.is_empty()
    }

    pub(crate) fn backlog_len(&self) -> u64 {
        let total: usize = self.backlog.iter().map(Vec::len).sum();
        (total - self.offset) as u64
    }

    /// Queue `batches` behind any backlog and write as much as possible.
    pub(crate) fn write(&mut self, batches: Vec<Vec<ProbeEvent>>, health: &Health) -> io::Result<()> {
        self.backlog
            .extend(batches.into_iter().filter(|batch| !batch.is_empty()));
        self.write_backlog(health)
    }

    /// Write queued events in order. Stops at the first error.
    pub(crate) fn write_backlog(&mut self, health: &Health) -> io::Result<()> {
        while let Some(batch) = self.backlog.front() {
            let mut written = 0u64;
            let mut result = Ok(());
            for event in &batch[self.offset..] {
                if let Err(e) = self.writer.write_event(event) {
                    result = Err(e);
                    break;
                }
                written += 1;
            }
            self.offset += written as usize;
            health.add_written(written);
            if let Err(e) = result {
                health.write_failed(&e);
                return Err(e);
            }
            self.backlog.pop_front();
            self.offset = 0;
        }
        if self.writer.take_rotated() {
            tracing::info!("trace output rotated to a new file");
        }
        Ok(())
    }

    pub(crate) fn flush(&mut self, health: &Health) -> io::Result<()> {
        match self.writer.flush() {
            Ok(()) => {
                health.write_succeeded();
                Ok(())
            }
            Err(e) => {
                health.write_failed(&e);
                Err(e)
            }
        }
    }
}
