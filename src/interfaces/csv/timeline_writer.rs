use crate::error::Result;
use serde::Serialize;
use std::io::Write;

/// Gateway state observed after one scenario step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimelineRow {
    pub step: usize,
    pub action: String,
    pub available: bool,
    pub processing: String,
    pub active: bool,
    pub auto_renewing: bool,
}

pub struct TimelineWriter<W: Write> {
    writer: csv::Writer<W>,
}

impl<W: Write> TimelineWriter<W> {
    pub fn new(sink: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(sink),
        }
    }

    pub fn write_row(&mut self, row: &TimelineRow) -> Result<()> {
        self.writer.serialize(row)?;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
