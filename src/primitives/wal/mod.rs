#![forbid(unsafe_code)]

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::types::{
    frame_crc32, read_u16, read_u32, read_u64, read_u8, Checksum, Crc32Fast, DtId, Lsn, Result,
    TxId, VitreeError, WorkerId,
};

const FRAME_HEADER_LEN: usize = 40;

/// Kind of a WAL frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Record owned by a data structure (see `storage::wal_records`).
    Data,
    /// Transaction commit marker.
    Commit,
    /// Transaction abort marker, written once its records have been undone.
    Abort,
}

impl FrameKind {
    fn to_u8(self) -> u8 {
        match self {
            FrameKind::Data => 1,
            FrameKind::Commit => 2,
            FrameKind::Abort => 3,
        }
    }

    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(FrameKind::Data),
            2 => Some(FrameKind::Commit),
            3 => Some(FrameKind::Abort),
            _ => None,
        }
    }
}

/// A decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WalFrame {
    /// Position in the log.
    pub lsn: Lsn,
    /// Owning transaction.
    pub tx_id: TxId,
    /// Target data structure; zero for commit and abort markers.
    pub dt_id: DtId,
    /// Worker that produced the frame.
    pub worker_id: WorkerId,
    /// Frame kind.
    pub kind: FrameKind,
    /// Record bytes.
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug)]
struct FrameHeader {
    lsn: Lsn,
    tx_id: TxId,
    dt_id: DtId,
    worker_id: WorkerId,
    kind: FrameKind,
    payload_len: u32,
    payload_crc32: u32,
}

impl FrameHeader {
    fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..8].copy_from_slice(&self.lsn.0.to_be_bytes());
        buf[8..16].copy_from_slice(&self.tx_id.to_be_bytes());
        buf[16..24].copy_from_slice(&self.dt_id.0.to_be_bytes());
        buf[24] = self.worker_id;
        buf[25] = self.kind.to_u8();
        buf[26..28].fill(0);
        buf[28..32].copy_from_slice(&self.payload_len.to_be_bytes());
        buf[32..36].copy_from_slice(&self.payload_crc32.to_be_bytes());
        let mut crc = Crc32Fast::default();
        crc.update(&buf[..36]);
        buf[36..40].copy_from_slice(&crc.finalize().to_be_bytes());
        buf
    }

    fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < FRAME_HEADER_LEN {
            return Err(VitreeError::Corruption("wal frame header truncated"));
        }
        let stored_crc = read_u32(src, 36, "wal frame header truncated")?;
        let mut crc = Crc32Fast::default();
        crc.update(&src[..36]);
        if crc.finalize() != stored_crc {
            return Err(VitreeError::Corruption("wal frame header crc mismatch"));
        }
        if read_u16(src, 26, "wal frame header truncated")? != 0 {
            return Err(VitreeError::Corruption("wal frame reserved bytes non-zero"));
        }
        let kind = FrameKind::from_u8(read_u8(src, 25, "wal frame header truncated")?)
            .ok_or(VitreeError::Corruption("wal frame kind unknown"))?;
        Ok(Self {
            lsn: Lsn(read_u64(src, 0, "wal frame header truncated")?),
            tx_id: read_u64(src, 8, "wal frame header truncated")?,
            dt_id: DtId(read_u64(src, 16, "wal frame header truncated")?),
            worker_id: src[24],
            kind,
            payload_len: read_u32(src, 28, "wal frame header truncated")?,
            payload_crc32: read_u32(src, 32, "wal frame header truncated")?,
        })
    }
}

/// Counters describing log activity.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WalStats {
    /// Frames appended since the log was created.
    pub frames_appended: u64,
    /// Bytes appended, headers included.
    pub bytes_appended: u64,
    /// Commit markers appended.
    pub commits: u64,
    /// Abort markers appended.
    pub aborts: u64,
}

struct WalState {
    buf: Vec<u8>,
    next_lsn: u64,
    stats: WalStats,
}

/// Append-only write-ahead log held as a byte image.
///
/// The image is exactly what would be written to disk: a sequence of
/// checksummed frames. [`WalLog::from_bytes`] reopens an image, discarding a
/// torn or corrupt tail.
pub struct WalLog {
    state: Mutex<WalState>,
}

impl Default for WalLog {
    fn default() -> Self {
        Self::new()
    }
}

impl WalLog {
    /// Creates an empty log starting at LSN 1.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(WalState {
                buf: Vec::new(),
                next_lsn: 1,
                stats: WalStats::default(),
            }),
        }
    }

    /// Reopens a log image, keeping the longest valid prefix of frames.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let (frames, valid_len) = scan_frames(bytes);
        if valid_len < bytes.len() {
            debug!(
                valid = valid_len,
                total = bytes.len(),
                "wal.reopen.truncated_tail"
            );
        }
        let next_lsn = frames.last().map(|f| f.lsn.0 + 1).unwrap_or(1);
        Self {
            state: Mutex::new(WalState {
                buf: bytes[..valid_len].to_vec(),
                next_lsn,
                stats: WalStats::default(),
            }),
        }
    }

    /// Appends a frame and returns its LSN.
    pub fn append(
        &self,
        kind: FrameKind,
        tx_id: TxId,
        worker_id: WorkerId,
        dt_id: DtId,
        payload: &[u8],
    ) -> Result<Lsn> {
        let payload_len = u32::try_from(payload.len())
            .map_err(|_| VitreeError::Invalid("wal payload exceeds u32"))?;
        let mut state = self.state.lock();
        let lsn = Lsn(state.next_lsn);
        state.next_lsn += 1;
        let header = FrameHeader {
            lsn,
            tx_id,
            dt_id,
            worker_id,
            kind,
            payload_len,
            payload_crc32: frame_crc32(lsn.0, payload),
        };
        state.buf.extend_from_slice(&header.encode());
        state.buf.extend_from_slice(payload);
        state.stats.frames_appended += 1;
        state.stats.bytes_appended += (FRAME_HEADER_LEN + payload.len()) as u64;
        match kind {
            FrameKind::Commit => state.stats.commits += 1,
            FrameKind::Abort => state.stats.aborts += 1,
            FrameKind::Data => {}
        }
        trace!(lsn = lsn.0, tx = tx_id, kind = ?kind, "wal.append");
        Ok(lsn)
    }

    /// Copy of the log image.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.state.lock().buf.clone()
    }

    /// Decodes every frame in LSN order.
    pub fn frames(&self) -> Vec<WalFrame> {
        let state = self.state.lock();
        scan_frames(&state.buf).0
    }

    /// Returns activity counters.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Size of the log image in bytes.
    pub fn len_bytes(&self) -> usize {
        self.state.lock().buf.len()
    }
}

fn scan_frames(bytes: &[u8]) -> (Vec<WalFrame>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        match decode_frame(&bytes[offset..]) {
            Ok((frame, consumed)) => {
                frames.push(frame);
                offset += consumed;
            }
            Err(err) => {
                debug!(offset, error = %err, "wal.scan.stop");
                break;
            }
        }
    }
    (frames, offset)
}

fn decode_frame(src: &[u8]) -> Result<(WalFrame, usize)> {
    let header = FrameHeader::decode(src)?;
    let len = header.payload_len as usize;
    let payload = src
        .get(FRAME_HEADER_LEN..FRAME_HEADER_LEN + len)
        .ok_or(VitreeError::Corruption("wal frame payload truncated"))?;
    if frame_crc32(header.lsn.0, payload) != header.payload_crc32 {
        return Err(VitreeError::Corruption("wal frame payload crc mismatch"));
    }
    Ok((
        WalFrame {
            lsn: header.lsn,
            tx_id: header.tx_id,
            dt_id: header.dt_id,
            worker_id: header.worker_id,
            kind: header.kind,
            payload: payload.to_vec(),
        },
        FRAME_HEADER_LEN + len,
    ))
}
