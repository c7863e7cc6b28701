//! A file's extent map, with cluster counts derived from VCN boundaries.

use std::io;

use crate::platform::{DefragBackend, Extent};

/// One extent with its starting VCN resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentRun {
    pub vcn: u64,
    /// `None` for sparse runs.
    pub lcn: Option<u64>,
    pub clusters: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentList {
    runs: Vec<ExtentRun>,
}

impl ExtentList {
    /// Build from `(next_vcn, lcn)` pairs starting at VCN 0.
    pub fn from_boundaries(extents: impl IntoIterator<Item = Extent>) -> Self {
        let mut list = Self::default();
        list.append(0, extents);
        list
    }

    fn append(&mut self, mut vcn: u64, extents: impl IntoIterator<Item = Extent>) {
        for extent in extents {
            self.runs.push(ExtentRun {
                vcn,
                lcn: extent.lcn,
                clusters: extent.next_vcn.saturating_sub(vcn),
            });
            vcn = extent.next_vcn;
        }
    }

    /// VCN following the last known extent.
    pub fn end_vcn(&self) -> u64 {
        self.runs.last().map(|run| run.vcn + run.clusters).unwrap_or(0)
    }

    pub fn runs(&self) -> &[ExtentRun] {
        &self.runs
    }

    /// Runs that occupy clusters on the volume.
    pub fn allocated(&self) -> impl Iterator<Item = &ExtentRun> {
        self.runs.iter().filter(|run| run.lcn.is_some())
    }

    /// Number of allocated runs, i.e. fragments.
    pub fn fragments(&self) -> usize {
        self.allocated().count()
    }

    pub fn allocated_clusters(&self) -> u64 {
        self.allocated().map(|run| run.clusters).sum()
    }

    pub fn is_contiguous(&self) -> bool {
        self.fragments() <= 1
    }
}

/// Read all retrieval pointers of `file`.
pub fn read_extents<B: DefragBackend>(backend: &B, file: &B::File) -> io::Result<ExtentList> {
    let mut list = ExtentList::default();
    loop {
        let chunk = backend.read_extents(file, list.end_vcn())?;
        let added = !chunk.extents.is_empty();
        list.append(chunk.starting_vcn, chunk.extents);
        if !chunk.more || !added {
            break;
        }
    }
    Ok(list)
}
