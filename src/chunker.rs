//! Splits an input byte buffer into ordered, bounded chunks.
//!
//! The default splitter slices fixed-size byte ranges with a small overlap
//! so the assembler can stitch words cut at a boundary. For containers
//! whose frames are independently decodable the format-aware splitters cut
//! at frame boundaries instead: WAV chunks get a rewritten RIFF header,
//! MP3 chunks start at a frame sync.

use crate::jobs::models::{ByteRange, ChunkingMethod};
use bytes::Bytes;
use tracing::debug;

const DEFAULT_OVERLAP_PERCENT: u64 = 5;
const DEFAULT_OVERLAP_CAP: u64 = 50 * 1024;
/// How far past a nominal cut point the MP3 splitter searches for a frame
/// sync before giving up on format-aware splitting.
const MP3_SYNC_SEARCH_WINDOW: usize = 64 * 1024;

/// One byte-range slice of the input.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub index: usize,
    pub range: ByteRange,
    pub bytes: Bytes,
    /// Whether this chunk is independently decodable by the upstream API.
    pub is_playable: bool,
}

/// Output of a split: the ordered chunks plus how they were produced.
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub chunks: Vec<Chunk>,
    pub method: ChunkingMethod,
}

/// Configurable splitter.
#[derive(Debug, Clone)]
pub struct Chunker {
    target_chunk_size: u64,
    overlap_percent: u64,
    overlap_cap: u64,
}

impl Chunker {
    pub fn new(target_chunk_size: u64) -> Self {
        Self {
            target_chunk_size: target_chunk_size.max(1),
            overlap_percent: DEFAULT_OVERLAP_PERCENT,
            overlap_cap: DEFAULT_OVERLAP_CAP,
        }
    }

    pub fn with_overlap(mut self, percent: u64, cap: u64) -> Self {
        self.overlap_percent = percent;
        self.overlap_cap = cap;
        self
    }

    /// Overlap applied by the byte splitter: `percent` of the chunk capped
    /// at `overlap_cap`, never more than half a chunk.
    fn overlap(&self) -> u64 {
        let by_percent = self.target_chunk_size * self.overlap_percent / 100;
        by_percent.min(self.overlap_cap).min(self.target_chunk_size / 2)
    }

    /// Splits `data`, picking a format-aware splitter when the filename
    /// suggests one and the bytes actually parse as that container.
    pub fn split(&self, data: Bytes, filename: &str) -> ChunkPlan {
        if (data.len() as u64) <= self.target_chunk_size {
            return ChunkPlan {
                method: ChunkingMethod::SingleChunk,
                chunks: vec![Chunk {
                    index: 0,
                    range: ByteRange::new(0, data.len() as u64),
                    bytes: data,
                    is_playable: true,
                }],
            };
        }

        let ext = filename
            .rsplit('.')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        let plan = match ext.as_str() {
            "wav" => self.split_wav(&data),
            "mp3" => self.split_mp3(&data),
            _ => None,
        };
        match plan {
            Some(plan) => {
                debug!(
                    target: "chunker",
                    filename = %filename,
                    method = ?plan.method,
                    chunks = plan.chunks.len(),
                    "Format-aware split"
                );
                plan
            }
            None => self.split_bytes(data),
        }
    }

    /// Fixed-size slicing with overlap. Only the first chunk carries the
    /// container header, so only it is marked playable.
    fn split_bytes(&self, data: Bytes) -> ChunkPlan {
        let total = data.len() as u64;
        let target = self.target_chunk_size;
        let overlap = self.overlap();
        let count = total.div_ceil(target) as usize;

        let mut chunks = Vec::with_capacity(count);
        for index in 0..count {
            let nominal_start = index as u64 * target;
            let start = if index == 0 {
                0
            } else {
                nominal_start.saturating_sub(overlap)
            };
            let end = (nominal_start + target).min(total);
            chunks.push(Chunk {
                index,
                range: ByteRange::new(start, end),
                bytes: data.slice(start as usize..end as usize),
                is_playable: index == 0,
            });
        }
        ChunkPlan {
            chunks,
            method: ChunkingMethod::ByteRange,
        }
    }

    /// WAV splitter: slices the data section at block-align boundaries and
    /// rewrites a RIFF header onto every chunk.
    fn split_wav(&self, data: &Bytes) -> Option<ChunkPlan> {
        let wav = WavLayout::parse(data)?;
        let header_budget = (wav.fmt.len() + 28) as u64;
        if self.target_chunk_size <= header_budget {
            return None;
        }
        let payload_target = self.target_chunk_size - header_budget;
        let align = wav.block_align.max(1) as u64;
        let slice_len = (payload_target / align).max(1) * align;

        let mut chunks = Vec::new();
        let mut pos = 0u64;
        while pos < wav.data_len {
            let len = slice_len.min(wav.data_len - pos);
            let abs_start = wav.data_offset + pos;
            let abs_end = abs_start + len;
            let body = data.slice(abs_start as usize..abs_end as usize);
            chunks.push(Chunk {
                index: chunks.len(),
                range: ByteRange::new(abs_start, abs_end),
                bytes: wav.chunk_with_header(&body),
                is_playable: true,
            });
            pos += len;
        }
        if chunks.len() < 2 {
            return None;
        }
        Some(ChunkPlan {
            chunks,
            method: ChunkingMethod::WavFrames,
        })
    }

    /// MP3 splitter: cuts at frame syncs near each nominal boundary. MP3
    /// frames are self-contained, so every chunk is playable without a
    /// header rewrite.
    fn split_mp3(&self, data: &Bytes) -> Option<ChunkPlan> {
        let total = data.len();
        let target = self.target_chunk_size as usize;

        let mut cuts = vec![0usize];
        let mut pos = target;
        while pos < total {
            let cut = find_mp3_frame_sync(data, pos, MP3_SYNC_SEARCH_WINDOW)?;
            if cut >= total {
                break;
            }
            cuts.push(cut);
            pos = cut + target;
        }
        if cuts.len() < 2 {
            return None;
        }
        cuts.push(total);

        let chunks = cuts
            .windows(2)
            .enumerate()
            .map(|(index, window)| {
                let (start, end) = (window[0], window[1]);
                Chunk {
                    index,
                    range: ByteRange::new(start as u64, end as u64),
                    bytes: data.slice(start..end),
                    is_playable: true,
                }
            })
            .collect();
        Some(ChunkPlan {
            chunks,
            method: ChunkingMethod::Mp3Frames,
        })
    }
}

/// Parsed layout of a RIFF/WAVE file: the fmt payload plus the location
/// of the data section.
struct WavLayout {
    fmt: Bytes,
    block_align: u16,
    data_offset: u64,
    data_len: u64,
}

impl WavLayout {
    fn parse(data: &Bytes) -> Option<Self> {
        if data.len() < 44 || &data[0..4] != b"RIFF" || &data[8..12] != b"WAVE" {
            return None;
        }
        let mut fmt: Option<Bytes> = None;
        let mut offset = 12usize;
        // Walk the top-level RIFF sub-chunks until the data chunk.
        while offset + 8 <= data.len() {
            let id = &data[offset..offset + 4];
            let size =
                u32::from_le_bytes(data[offset + 4..offset + 8].try_into().ok()?) as usize;
            let body_start = offset + 8;
            match id {
                b"fmt " => {
                    if body_start + size > data.len() || size < 16 {
                        return None;
                    }
                    fmt = Some(data.slice(body_start..body_start + size));
                }
                b"data" => {
                    let fmt = fmt?;
                    let block_align = u16::from_le_bytes(fmt[12..14].try_into().ok()?);
                    let data_len = (size as u64).min((data.len() - body_start) as u64);
                    return Some(Self {
                        fmt,
                        block_align,
                        data_offset: body_start as u64,
                        data_len,
                    });
                }
                _ => {}
            }
            // Sub-chunks are word-aligned.
            offset = body_start + size + (size % 2);
        }
        None
    }

    /// Builds a standalone WAV file for one data slice.
    fn chunk_with_header(&self, body: &Bytes) -> Bytes {
        let fmt_len = self.fmt.len() as u32;
        let riff_len = 4 + (8 + fmt_len) + (8 + body.len() as u32);
        let mut out = Vec::with_capacity(12 + 8 + self.fmt.len() + 8 + body.len());
        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&riff_len.to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&fmt_len.to_le_bytes());
        out.extend_from_slice(&self.fmt);
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(body.len() as u32).to_le_bytes());
        out.extend_from_slice(body);
        Bytes::from(out)
    }
}

/// Scans forward from `from` for an MPEG audio frame sync.
fn find_mp3_frame_sync(data: &Bytes, from: usize, window: usize) -> Option<usize> {
    let end = (from + window).min(data.len().saturating_sub(1));
    (from..end).find(|&i| is_mp3_frame_header(data[i], data[i + 1]))
}

fn is_mp3_frame_header(b0: u8, b1: u8) -> bool {
    // 11-bit sync, then reject reserved version (01) and reserved layer (00).
    b0 == 0xFF && (b1 & 0xE0) == 0xE0 && (b1 & 0x18) != 0x08 && (b1 & 0x06) != 0x00
}
