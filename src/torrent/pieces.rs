use std::fmt;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;

use log::{debug, warn};
use sha1_smol::Sha1;

pub const DIGEST_LENGTH: usize = sha1_smol::DIGEST_LENGTH;

#[derive(Clone, Copy, Eq, Hash, PartialEq)]
pub struct Digest([u8; DIGEST_LENGTH]);

impl Digest {
    pub fn bytes(&self) -> [u8; DIGEST_LENGTH] {
        self.0
    }
}

impl From<[u8; DIGEST_LENGTH]> for Digest {
    fn from(bytes: [u8; DIGEST_LENGTH]) -> Self {
        Digest(bytes)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// The piece digests of a torrent plus a byte offset into its payload.
///
/// Every `TorrentFile` holds a projection of the same digest array
/// starting at the file's cumulative offset; `slice_from` is zero-copy.
#[derive(Clone, Debug)]
pub struct Pieces {
    piece_length: u64,
    digests: Arc<[Digest]>,
    start_offset: u64,
}

/// Piece boundaries of one file, as absolute piece indices.
///
/// `start_piece`/`end_piece` are the first and last piece the file
/// touches. `first_complete_piece` through `last_complete_piece` are
/// the pieces fully contained in the file; the range may be empty for
/// files smaller than a piece. `start_offset` is the number of bytes
/// between the start of the file and its first full piece boundary.
#[derive(Clone, Debug)]
pub struct PieceCalculation {
    digests: Arc<[Digest]>,
    pub start_piece: u64,
    pub start_offset: u64,
    pub first_complete_piece: u64,
    pub end_piece: u64,
    pub end_offset: u64,
    complete_end: u64,
}

impl PieceCalculation {
    pub fn has_complete_pieces(&self) -> bool {
        self.complete_end > self.first_complete_piece
    }

    pub fn last_complete_piece(&self) -> Option<u64> {
        self.has_complete_pieces().then(|| self.complete_end - 1)
    }

    /// All piece indices the file touches, including a shared final
    /// piece that mostly belongs to a neighbor.
    pub fn piece_indices(&self) -> std::ops::RangeInclusive<u64> {
        self.start_piece..=self.end_piece
    }

    pub fn complete_piece_indices(&self) -> std::ops::Range<u64> {
        self.first_complete_piece..self.complete_end.max(self.first_complete_piece)
    }

    /// Expected digests for every piece the file touches.
    pub fn pieces(&self) -> &[Digest] {
        clamped(&self.digests, self.start_piece, self.end_piece + 1)
    }

    /// Expected digests for the pieces fully contained in the file.
    pub fn complete_pieces(&self) -> &[Digest] {
        clamped(&self.digests, self.first_complete_piece, self.complete_end)
    }
}

fn clamped(digests: &[Digest], start: u64, end: u64) -> &[Digest] {
    let start = (start as usize).min(digests.len());
    let end = (end as usize).min(digests.len()).max(start);
    &digests[start..end]
}

impl Pieces {
    pub fn new(piece_length: u64, digests: Vec<Digest>) -> Self {
        Pieces {
            piece_length,
            digests: digests.into(),
            start_offset: 0,
        }
    }

    /// Split a concatenated digest blob from a metainfo `pieces` value.
    ///
    /// Returns `None` when the blob is not a multiple of the digest
    /// length.
    pub fn from_blob(piece_length: u64, blob: &[u8]) -> Option<Self> {
        if blob.len() % DIGEST_LENGTH != 0 {
            return None;
        }
        let digests = blob
            .chunks(DIGEST_LENGTH)
            .map(|chunk| Digest(<[u8; DIGEST_LENGTH]>::try_from(chunk).unwrap()))
            .collect();
        Some(Pieces {
            piece_length,
            digests,
            start_offset: 0,
        })
    }

    /// A projection of the same digests starting `start` bytes further
    /// into the payload.
    pub fn slice_from(&self, start: u64) -> Pieces {
        Pieces {
            piece_length: self.piece_length,
            digests: Arc::clone(&self.digests),
            start_offset: self.start_offset + start,
        }
    }

    pub fn piece_length(&self) -> u64 {
        self.piece_length
    }

    pub fn piece_count(&self) -> u64 {
        self.digests.len() as u64
    }

    pub fn digest(&self, index: u64) -> Option<Digest> {
        self.digests.get(index as usize).copied()
    }

    /// Map a file of `size` bytes at this projection's offset onto
    /// piece boundaries. The short final piece of the torrent counts as
    /// complete for the last file.
    pub fn calculate_offsets(&self, size: u64, is_last_file: bool) -> PieceCalculation {
        let start_piece = self.start_offset / self.piece_length;
        let mut start_offset = self.start_offset % self.piece_length;
        let mut first_complete_piece = start_piece;
        if start_offset != 0 {
            first_complete_piece += 1;
            start_offset = self.piece_length - start_offset;
        }

        let end_size = self.start_offset + size;
        let end_piece = end_size / self.piece_length;
        let end_offset = end_size % self.piece_length;
        let complete_end = if end_offset != 0 && !is_last_file {
            end_piece
        } else {
            end_piece + 1
        };

        let calculation = PieceCalculation {
            digests: Arc::clone(&self.digests),
            start_piece,
            start_offset,
            first_complete_piece,
            end_piece,
            end_offset,
            complete_end,
        };
        debug!(
            "piece calculation start_piece: {} start_offset: {} first_complete_piece: {} end_piece: {} end_offset: {} last_complete_piece: {:?}",
            calculation.start_piece,
            calculation.start_offset,
            calculation.first_complete_piece,
            calculation.end_piece,
            calculation.end_offset,
            calculation.last_complete_piece(),
        );
        calculation
    }

    /// Hash one full piece read from `reader`, returning `None` when
    /// the reader runs out of data early.
    pub fn hash_piece<R: Read>(&self, reader: &mut R) -> io::Result<Option<Digest>> {
        let mut missing = self.piece_length;
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; 16384];
        debug!("trying to read {missing} bytes");

        while missing > 0 {
            let wanted = missing.min(buffer.len() as u64) as usize;
            let read = reader.read(&mut buffer[..wanted])?;
            if read == 0 {
                warn!("expected to be able to read more data with missing size {missing}, bailing");
                return Ok(None);
            }
            hasher.update(&buffer[..read]);
            missing -= read as u64;
        }

        Ok(Some(Digest(hasher.digest().bytes())))
    }

    /// Test a candidate file's first and last fully-contained piece
    /// against the expected digests.
    ///
    /// Returns `Some(true)` on a pass, `Some(false)` on a mismatch and
    /// `None` when the file contains no full piece to test.
    pub fn probe_hash<R: Read + Seek>(&self, size: u64, file: &mut R) -> io::Result<Option<bool>> {
        let calculation = self.calculate_offsets(size, false);
        let complete_pieces = calculation.complete_pieces();
        if complete_pieces.is_empty() {
            return Ok(None);
        }

        let mut pieces_to_verify = vec![0usize];
        if complete_pieces.len() > 1 {
            pieces_to_verify.push(complete_pieces.len() - 1);
        }

        for piece in pieces_to_verify {
            file.seek(SeekFrom::Start(
                calculation.start_offset + piece as u64 * self.piece_length,
            ))?;
            if self.hash_piece(file)? != Some(complete_pieces[piece]) {
                return Ok(Some(false));
            }
        }

        Ok(Some(true))
    }
}
