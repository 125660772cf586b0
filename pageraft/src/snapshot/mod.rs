//! The incremental snapshot-installation protocol.
//!
//! When a follower has fallen behind the leader's snapshot anchor, the
//! leader does not retransmit the whole snapshot. Instead both sides run a
//! page-diff exchange:
//!
//! 1. The follower computes a checksum for every page of the content it
//!    already has and both sides load them into a checksum table
//!    ([`ChecksumTable`]).
//! 2. The leader walks its snapshot page by page. A page whose checksum
//!    the follower already has at the same position is skipped; one the
//!    follower has at a different position becomes a cheap remapping
//!    ([`Message::SnapshotMv`](crate::message::Message)); only pages the
//!    follower does not have at all are shipped as raw bytes
//!    ([`Message::SnapshotCp`](crate::message::Message)).
//!
//! The exchange is driven by two coupled state machines, [`leader`] and
//! [`follower`], encoded as an explicit dispatch on `(state, input)` with
//! an allowed-transitions table checked on every move. Timeouts, send
//! confirmations and background-job completions are synthetic inputs, so
//! the machines are fully deterministic and testable without IO.

pub mod follower;
pub mod leader;

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use bytes::Bytes;

use crate::message::Message;
use crate::message::PageChecksum;
use crate::message::PageMove;
use crate::Checksum;
use crate::PageNo;

pub use follower::FollowerSession;
pub use leader::LeaderSession;

/// Identifies one queued background job.
pub type WorkId = u64;

/// Page-addressable content of a snapshot or database.
///
/// Pages are cheap to share: each is a [`Bytes`] handle, so capturing or
/// staging a page set clones references, not content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PageSet {
    page_size: u32,
    pages: Vec<Bytes>,
}

impl PageSet {
    pub fn new(page_size: u32) -> Self {
        PageSet { page_size, pages: Vec::new() }
    }

    /// Split a flat buffer into pages. The last page may be short.
    pub fn from_bytes(page_size: u32, content: Bytes) -> Self {
        let mut pages = Vec::new();
        let mut at = 0;
        while at < content.len() {
            let end = content.len().min(at + page_size as usize);
            pages.push(content.slice(at..end));
            at = end;
        }
        PageSet { page_size, pages }
    }

    /// Concatenate all pages back into a flat buffer.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = Vec::with_capacity(self.pages.iter().map(|p| p.len()).sum());
        for page in &self.pages {
            buf.extend_from_slice(page);
        }
        Bytes::from(buf)
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn page_count(&self) -> PageNo {
        self.pages.len() as PageNo
    }

    pub fn read_page(&self, page_no: PageNo) -> Option<Bytes> {
        self.pages.get(page_no as usize).cloned()
    }

    /// Write a page, extending the set with empty pages as needed.
    /// Writing the same content twice is a no-op, which is what makes a
    /// re-delivered `Cp` harmless.
    pub fn write_page(&mut self, page_no: PageNo, data: Bytes) {
        let i = page_no as usize;
        while self.pages.len() <= i {
            self.pages.push(Bytes::new());
        }
        self.pages[i] = data;
    }

    /// Drop pages with number >= `page_count`.
    pub fn truncate_pages(&mut self, page_count: PageNo) {
        self.pages.truncate(page_count as usize);
    }

    pub fn checksum(&self, page_no: PageNo) -> Option<Checksum> {
        self.read_page(page_no).map(|p| crc32fast::hash(&p))
    }
}

/// The per-session mapping `checksum -> page numbers`.
///
/// Mirrors the persistent table the production deployment keeps in a
/// SQLite database (`map(checksum, pageno)` with an index on `checksum`);
/// in-process a sorted map is sufficient and keeps lookups deterministic.
#[derive(Debug, Default)]
pub struct ChecksumTable {
    map: BTreeMap<Checksum, BTreeSet<PageNo>>,
    len: usize,
}

impl ChecksumTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, checksum: Checksum, page_no: PageNo) {
        if self.map.entry(checksum).or_default().insert(page_no) {
            self.len += 1;
        }
    }

    /// The smallest page number holding content with this checksum.
    /// Smallest wins so repeated runs pick the same source page.
    pub fn lookup(&self, checksum: Checksum) -> Option<PageNo> {
        self.map.get(&checksum).and_then(|pages| pages.iter().next().copied())
    }

    pub fn contains_at(&self, checksum: Checksum, page_no: PageNo) -> bool {
        self.map.get(&checksum).map(|pages| pages.contains(&page_no)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// The payload of one data-bearing chunk message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkPayload {
    Cp { page_no: PageNo, data: Bytes },
    Mv { moves: Vec<PageMove> },
}

impl ChunkPayload {
    /// The resynchronization cursor acknowledged for this chunk.
    pub fn last_page_no(&self) -> PageNo {
        match self {
            ChunkPayload::Cp { page_no, .. } => *page_no,
            ChunkPayload::Mv { moves } => moves.iter().map(|m| m.to).max().unwrap_or(0),
        }
    }
}

/// A background job dispatched to the worker pool.
///
/// Jobs are pure: [`run_job`] computes the output from the inputs carried
/// by the job itself, so a driver may run it on any thread and a test
/// fixture may run it at completion time. Mutations implied by an output
/// (table inserts, staged page writes) are applied by the owning session
/// when the completion is delivered.
#[derive(Clone, Debug)]
pub enum WorkJob {
    /// Create the checksum table backing store.
    HtCreate,
    /// Compute checksums for the pages `[from, to]` of `pages`.
    CalcSigs { pages: PageSet, from: PageNo, to: PageNo },
    /// Read a batch of the follower's own checksums back out of its table.
    ReadSig { sigs: Vec<PageChecksum>, done: bool },
    /// Persist one batch of follower checksums into the leader's table.
    HtInsert { sigs: Vec<PageChecksum> },
    /// Read one snapshot page and compute its checksum.
    PageRead { pages: PageSet, page_no: PageNo },
    /// Persist one received chunk.
    WriteChunk { chunk: ChunkPayload },
}

/// Completion of a [`WorkJob`].
#[derive(Clone, Debug)]
pub enum WorkOutput {
    HtCreated,
    SigsCalculated { from: PageNo, sigs: Vec<PageChecksum> },
    SigsRead { sigs: Vec<PageChecksum>, done: bool },
    HtInserted,
    PageRead { page_no: PageNo, checksum: Checksum, data: Bytes },
    ChunkWritten { chunk: ChunkPayload },
}

/// Execute a job. CPU-bound (checksumming) or IO-bound in a real
/// deployment; always safe to call from a worker thread.
pub fn run_job(job: WorkJob) -> WorkOutput {
    match job {
        WorkJob::HtCreate => WorkOutput::HtCreated,
        WorkJob::CalcSigs { pages, from, to } => {
            let mut sigs = Vec::new();
            for page_no in from..=to {
                match pages.checksum(page_no) {
                    Some(checksum) => sigs.push(PageChecksum { page_no, checksum }),
                    None => break,
                }
            }
            WorkOutput::SigsCalculated { from, sigs }
        }
        WorkJob::ReadSig { sigs, done } => WorkOutput::SigsRead { sigs, done },
        WorkJob::HtInsert { .. } => WorkOutput::HtInserted,
        WorkJob::PageRead { pages, page_no } => {
            let data = pages.read_page(page_no).unwrap_or_default();
            WorkOutput::PageRead { page_no, checksum: crc32fast::hash(&data), data }
        }
        WorkJob::WriteChunk { chunk } => WorkOutput::ChunkWritten { chunk },
    }
}

/// What a session asks its owner (the raft core) to do.
#[derive(Debug)]
pub enum SessionEffect {
    /// Send a message to the session peer.
    Send(Message),
    /// Queue a background job for this session.
    Work(WorkJob),
    /// The installation completed; the leader resumes AppendEntries, the
    /// follower restores the assembled snapshot.
    Done,
    /// The peer reported `unexpected`; discard the session and start over.
    Reset,
}

/// Synthetic and real inputs driving a session state machine.
#[derive(Debug)]
pub enum SessionInput<'a> {
    /// An RPC or backoff deadline expired.
    Timeout,
    /// A background job completed.
    WorkDone(WorkOutput),
    /// The transport confirmed the last message was handed off.
    MsgSent,
    /// The transport failed to hand off the last message.
    SendFailed,
    /// A message from the session peer.
    Msg(&'a Message),
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn page_set_roundtrip() {
        let content = Bytes::from((0..10u8).collect::<Vec<_>>());
        let pages = PageSet::from_bytes(4, content.clone());
        assert_eq!(pages.page_count(), 3);
        assert_eq!(pages.read_page(0).unwrap().len(), 4);
        assert_eq!(pages.read_page(2).unwrap().len(), 2);
        assert_eq!(pages.to_bytes(), content);
        assert_eq!(pages.read_page(3), None);
    }

    #[test]
    fn write_page_extends_and_is_idempotent() {
        let mut pages = PageSet::new(4);
        let data = Bytes::from_static(b"abcd");
        pages.write_page(2, data.clone());
        assert_eq!(pages.page_count(), 3);
        assert_eq!(pages.read_page(0).unwrap().len(), 0);

        let before = pages.clone();
        pages.write_page(2, data);
        assert_eq!(pages, before);
    }

    #[test]
    fn checksum_table_prefers_smallest_page() {
        let mut ht = ChecksumTable::new();
        ht.insert(0xdead, 9);
        ht.insert(0xdead, 4);
        ht.insert(0xdead, 4);
        assert_eq!(ht.lookup(0xdead), Some(4));
        assert_eq!(ht.len(), 2);
        assert!(ht.contains_at(0xdead, 9));
        assert!(!ht.contains_at(0xbeef, 9));
    }

    #[test]
    fn calc_sigs_job_stops_at_page_end() {
        let pages = PageSet::from_bytes(2, Bytes::from_static(b"abcdef"));
        let WorkOutput::SigsCalculated { from, sigs } = run_job(WorkJob::CalcSigs { pages: pages.clone(), from: 1, to: 10 })
        else {
            panic!()
        };
        assert_eq!(from, 1);
        assert_eq!(sigs.len(), 2);
        assert_eq!(sigs[0].page_no, 1);
        assert_eq!(sigs[0].checksum, crc32fast::hash(b"cd"));
    }

    #[test]
    fn page_read_job_checksums_content() {
        let pages = PageSet::from_bytes(2, Bytes::from_static(b"abcd"));
        let WorkOutput::PageRead { page_no, checksum, data } = run_job(WorkJob::PageRead { pages, page_no: 1 }) else {
            panic!()
        };
        assert_eq!(page_no, 1);
        assert_eq!(&data[..], b"cd");
        assert_eq!(checksum, crc32fast::hash(b"cd"));
    }
}
