use std::{
    fmt,
    fs::File,
    io::{self, BufWriter, Write},
    path::Path,
    thread::JoinHandle,
};

use crossbeam::channel::{Receiver, Sender};

use crate::engine::{DiskEvent, EngineEvent};

#[derive(Debug)]
pub enum CollectorError {
    OutOfRange { index: usize, pieces: usize },
    Io(io::Error),
}

impl From<io::Error> for CollectorError {
    fn from(err: io::Error) -> Self {
        CollectorError::Io(err)
    }
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::OutOfRange { index, pieces } => {
                write!(f, "piece index {} out of range (have {})", index, pieces)
            }
            CollectorError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for CollectorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CollectorError::Io(e) => Some(e),
            _ => None,
        }
    }
}

/// Accumulates validated pieces and flushes them to the output file in
/// strict index order, however they arrived.
///
/// Each slot is written at most once; a second copy of the same piece is
/// silently dropped. An out-of-range index is an error: the upstream
/// validation should make it impossible.
#[derive(Debug)]
pub struct PieceCollector {
    slots: Vec<Option<Vec<u8>>>,
    collected: usize,
    write_ptr: usize,
    out: BufWriter<File>,
}

impl PieceCollector {
    /// Opens (truncating) the output file and prepares one slot per piece.
    pub fn new(pieces: usize, path: &Path) -> io::Result<Self> {
        let file = File::create(path)?;
        Ok(Self {
            slots: vec![None; pieces],
            collected: 0,
            write_ptr: 0,
            out: BufWriter::new(file),
        })
    }

    pub fn contains(&self, index: usize) -> bool {
        self.slots.get(index).is_some_and(|s| s.is_some())
    }

    /// Stores a validated piece. Returns whether the slot was newly filled.
    pub fn collect(&mut self, index: usize, data: Vec<u8>) -> Result<bool, CollectorError> {
        let pieces = self.slots.len();
        let slot = self
            .slots
            .get_mut(index)
            .ok_or(CollectorError::OutOfRange { index, pieces })?;
        if slot.is_some() {
            return Ok(false);
        }
        *slot = Some(data);
        self.collected += 1;
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.collected == self.slots.len()
    }

    pub fn percent_complete(&self) -> f64 {
        if self.slots.is_empty() {
            return 100.0;
        }
        self.collected as f64 / self.slots.len() as f64 * 100.0
    }

    /// Streams every filled slot from the write cursor onward to the file,
    /// in index order, releasing buffers as they land on disk. Stops at the
    /// first unfilled slot.
    pub fn write_pending(&mut self) -> io::Result<()> {
        while self.write_ptr < self.slots.len() {
            let Some(data) = self.slots[self.write_ptr].take() else {
                break;
            };
            self.out.write_all(&data)?;
            self.write_ptr += 1;
        }
        if self.write_ptr == self.slots.len() {
            self.out.flush()?;
        }
        Ok(())
    }

    pub fn write_done(&self) -> bool {
        self.write_ptr == self.slots.len()
    }
}

/// Runs the collector on its own thread, fed by the coordinator.
#[derive(Debug)]
pub struct DiskManager {
    join: Option<JoinHandle<()>>,
}

impl DiskManager {
    pub fn new() -> Self {
        Self { join: None }
    }

    pub fn start(
        &mut self,
        mut collector: PieceCollector,
        rx: &Receiver<DiskEvent>,
        engine_tx: &Sender<EngineEvent>,
    ) {
        let rx = rx.clone();
        let engine_tx = engine_tx.clone();
        let join = std::thread::spawn(move || {
            while let Ok(ev) = rx.recv() {
                match ev {
                    DiskEvent::Collect { index, data } => {
                        match collector.collect(index as usize, data) {
                            Ok(true) => {
                                log::debug!(
                                    "collected piece {} ({:.1}% of payload)",
                                    index,
                                    collector.percent_complete()
                                );
                            }
                            Ok(false) => {
                                log::debug!("piece {} already collected, dropping copy", index);
                                continue;
                            }
                            Err(e) => {
                                let _ = engine_tx.send(EngineEvent::DiskError {
                                    reason: e.to_string(),
                                });
                                return;
                            }
                        }
                        if collector.is_complete() {
                            let _ = engine_tx.send(EngineEvent::CollectionComplete);
                            if let Err(e) = collector.write_pending() {
                                let _ = engine_tx.send(EngineEvent::DiskError {
                                    reason: e.to_string(),
                                });
                                return;
                            }
                            let _ = engine_tx.send(EngineEvent::WriteComplete);
                            return;
                        }
                    }
                }
            }
        });
        self.join = Some(join);
    }

    pub fn join(&mut self) {
        let join = match self.join.take() {
            Some(j) => j,
            None => return,
        };
        let _ = join.join();
    }
}

impl Default for DiskManager {
    fn default() -> Self {
        Self::new()
    }
}
