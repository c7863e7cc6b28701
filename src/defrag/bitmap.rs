//! Free-space runs decoded from the volume allocation bitmap.

use std::io;

use crate::platform::{BitmapChunk, DefragBackend};

/// A maximal run of unallocated clusters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeRun {
    pub start: u64,
    pub length: u64,
}

impl FreeRun {
    pub fn end(&self) -> u64 {
        self.start + self.length
    }
}

/// Incremental decoder; a run may span any number of chunks.
#[derive(Debug, Default)]
pub struct FreeRunDecoder {
    runs: Vec<FreeRun>,
    open: Option<FreeRun>,
    next_lcn: u64,
}

impl FreeRunDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// First cluster not yet decoded.
    pub fn next_lcn(&self) -> u64 {
        self.next_lcn
    }

    pub fn feed(&mut self, chunk: &BitmapChunk) {
        // Bits already seen are skipped; clusters never reported are treated as allocated.
        let mut i = self.next_lcn.saturating_sub(chunk.starting_lcn);
        if chunk.starting_lcn > self.next_lcn {
            self.close();
        }

        while i < chunk.cluster_count {
            let Some(&byte) = chunk.bits.get((i / 8) as usize) else {
                break;
            };
            let bit = i % 8;
            let lcn = chunk.starting_lcn + i;

            if bit == 0 && i + 8 <= chunk.cluster_count {
                match byte {
                    0x00 => {
                        self.extend(lcn, 8);
                        i += 8;
                        continue;
                    }
                    0xFF => {
                        self.close();
                        i += 8;
                        continue;
                    }
                    _ => {}
                }
            }

            if byte & (1 << bit) == 0 {
                self.extend(lcn, 1);
            } else {
                self.close();
            }
            i += 1;
        }

        self.next_lcn = self.next_lcn.max(chunk.starting_lcn + i);
    }

    pub fn finish(mut self) -> Vec<FreeRun> {
        self.close();
        self.runs
    }

    fn extend(&mut self, lcn: u64, count: u64) {
        match &mut self.open {
            Some(run) if run.end() == lcn => run.length += count,
            _ => {
                self.close();
                self.open = Some(FreeRun { start: lcn, length: count });
            }
        }
    }

    fn close(&mut self) {
        if let Some(run) = self.open.take() {
            self.runs.push(run);
        }
    }
}

/// Read the whole bitmap of `volume`, chunk by chunk, into free runs in LCN order.
pub fn read_free_runs<B: DefragBackend>(backend: &B, volume: &B::Volume) -> io::Result<Vec<FreeRun>> {
    let mut decoder = FreeRunDecoder::new();
    let mut reads = 0usize;
    loop {
        let chunk = backend.read_bitmap(volume, decoder.next_lcn())?;
        reads += 1;
        let before = decoder.next_lcn();
        decoder.feed(&chunk);
        if !chunk.more || decoder.next_lcn() == before {
            break;
        }
    }
    let runs = decoder.finish();
    tracing::debug!(reads, runs = runs.len(), "Volume bitmap decoded");
    Ok(runs)
}

/// First run, in LCN order, with room for `clusters`.
pub fn first_fit(runs: &[FreeRun], clusters: u64) -> Option<FreeRun> {
    runs.iter().copied().find(|run| run.length >= clusters)
}
