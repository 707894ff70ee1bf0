//! Frame assembler
//!
//! Accumulates decoded columns into one revolution. Columns are placed at
//! their `measurement_id`, so arrival order inside a revolution does not
//! matter. A revolution is emitted when every slot is filled or when a
//! column from a newer revolution arrives.
//!
//! Emitted frame ids never go backwards: columns from a revolution that is
//! already behind the current one are dropped. A backwards jump larger than
//! [`STALE_FRAME_WINDOW`] is taken as a sensor restart and starts a new
//! revolution. A restart to an id inside the window looks like late data at
//! first; once a full revolution's worth of consecutive columns has been
//! dropped as stale, the next stale column is accepted as a restart.

use tracing::{debug, trace};

use crate::decoder::DecodedColumn;

/// How far behind the current revolution a column may be and still be
/// considered late (rather than a restart)
pub const STALE_FRAME_WINDOW: u16 = 16;

/// Why a column was not accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnRejected {
    /// `measurement_id` is outside the revolution
    OutOfRange { position: u16, width: usize },
    /// Column belongs to a revolution already emitted or superseded
    Stale { frame_id: u16, current: u16 },
}

impl std::fmt::Display for ColumnRejected {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ColumnRejected::OutOfRange { position, width } => {
                write!(f, "column {position} out of range (width {width})")
            }
            ColumnRejected::Stale { frame_id, current } => {
                write!(f, "stale frame {frame_id} (current {current})")
            }
        }
    }
}

/// A completed (or flushed) revolution
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledFrame {
    pub frame_id: u16,
    /// One slot per column position; `None` where nothing arrived
    pub columns: Vec<Option<DecodedColumn>>,
    /// Host receive time of the first packet of this revolution
    pub received_at_ns: u64,
}

impl AssembledFrame {
    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn is_filled(&self, position: usize) -> bool {
        self.columns.get(position).is_some_and(Option::is_some)
    }

    pub fn missing_columns(&self) -> usize {
        self.columns.iter().filter(|c| c.is_none()).count()
    }

    pub fn is_complete(&self) -> bool {
        self.missing_columns() == 0
    }
}

/// Assembler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AssemblerStats {
    pub frames: u64,
    pub incomplete_frames: u64,
    pub duplicates: u64,
    pub out_of_range: u64,
    pub stale: u64,
}

#[derive(Debug)]
struct FrameBuffer {
    frame_id: u16,
    columns: Vec<Option<DecodedColumn>>,
    filled: usize,
    received_at_ns: u64,
}

impl FrameBuffer {
    fn new(frame_id: u16, width: usize, received_at_ns: u64) -> Self {
        Self {
            frame_id,
            columns: vec![None; width],
            filled: 0,
            received_at_ns,
        }
    }

    /// Returns true if the slot was already filled
    fn insert(&mut self, position: usize, column: DecodedColumn) -> bool {
        let duplicate = self.columns[position].replace(column).is_some();
        if !duplicate {
            self.filled += 1;
        }
        duplicate
    }

    fn is_full(&self) -> bool {
        self.filled == self.columns.len()
    }

    fn finish(self) -> AssembledFrame {
        AssembledFrame {
            frame_id: self.frame_id,
            columns: self.columns,
            received_at_ns: self.received_at_ns,
        }
    }
}

/// Revolution assembler
#[derive(Debug)]
pub struct FrameAssembler {
    width: usize,
    current: Option<FrameBuffer>,
    /// Id of the last emitted revolution
    last_emitted: Option<u16>,
    /// Consecutive columns dropped as stale
    stale_run: usize,
    stats: AssemblerStats,
}

impl FrameAssembler {
    /// Create an assembler for `width` columns per revolution
    pub fn new(width: usize) -> Self {
        Self {
            width,
            current: None,
            last_emitted: None,
            stale_run: 0,
            stats: AssemblerStats::default(),
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Change the revolution width, discarding any partial frame
    pub fn resize(&mut self, width: usize) {
        if width != self.width {
            debug!(from = self.width, to = width, "Assembler resized");
        }
        self.width = width;
        self.reset();
    }

    /// Add one column
    ///
    /// Returns the frame that this column completed or closed, if any.
    pub fn push(
        &mut self,
        column: DecodedColumn,
        received_at_ns: u64,
    ) -> Result<Option<AssembledFrame>, ColumnRejected> {
        let position = column.measurement_id as usize;
        if position >= self.width {
            self.stats.out_of_range += 1;
            return Err(ColumnRejected::OutOfRange {
                position: column.measurement_id,
                width: self.width,
            });
        }

        let frame_id = column.frame_id;
        let mut closed = None;

        match self.current.as_ref().map(|f| f.frame_id) {
            Some(current) if current == frame_id => {}
            Some(current) => {
                if is_behind(current, frame_id) && !self.restarted() {
                    return Err(self.stale(frame_id, current));
                }
                trace!(from = current, to = frame_id, "Frame boundary");
                closed = self.current.take().map(|f| self.emit(f));
                self.current = Some(FrameBuffer::new(frame_id, self.width, received_at_ns));
            }
            None => {
                if let Some(last) = self.last_emitted {
                    if (last == frame_id || is_behind(last, frame_id)) && !self.restarted() {
                        return Err(self.stale(frame_id, last));
                    }
                }
                self.current = Some(FrameBuffer::new(frame_id, self.width, received_at_ns));
            }
        }

        self.stale_run = 0;
        let Some(buffer) = self.current.as_mut() else {
            return Ok(closed);
        };
        if buffer.insert(position, column) {
            self.stats.duplicates += 1;
        }

        // A column that closed the previous frame cannot also complete the
        // new one unless the width is 1; that frame is emitted on the next
        // push or flush.
        if closed.is_none() && buffer.is_full() {
            closed = self.current.take().map(|f| self.emit(f));
        }

        Ok(closed)
    }

    /// Emit the partial frame, if any
    pub fn flush(&mut self) -> Option<AssembledFrame> {
        self.current.take().map(|f| self.emit(f))
    }

    /// Discard the partial frame and forget revolution history
    pub fn reset(&mut self) {
        if let Some(frame) = self.current.take() {
            debug!(
                frame_id = frame.frame_id,
                filled = frame.filled,
                "Discarding partial frame"
            );
        }
        self.last_emitted = None;
        self.stale_run = 0;
    }

    pub fn current_frame_id(&self) -> Option<u16> {
        self.current.as_ref().map(|f| f.frame_id)
    }

    pub fn stats(&self) -> AssemblerStats {
        self.stats
    }

    fn stale(&mut self, frame_id: u16, current: u16) -> ColumnRejected {
        self.stats.stale += 1;
        self.stale_run += 1;
        ColumnRejected::Stale { frame_id, current }
    }

    /// A whole revolution of stale columns means the sensor went back
    fn restarted(&self) -> bool {
        let restarted = self.width > 0 && self.stale_run >= self.width;
        if restarted {
            debug!(dropped = self.stale_run, "Frame ids restarted inside stale window");
        }
        restarted
    }

    fn emit(&mut self, buffer: FrameBuffer) -> AssembledFrame {
        self.stats.frames += 1;
        if !buffer.is_full() {
            self.stats.incomplete_frames += 1;
        }
        self.last_emitted = Some(buffer.frame_id);
        buffer.finish()
    }
}

/// Whether `frame_id` lies within the stale window behind `reference`
fn is_behind(reference: u16, frame_id: u16) -> bool {
    let back = reference.wrapping_sub(frame_id);
    back != 0 && back <= STALE_FRAME_WINDOW
}
