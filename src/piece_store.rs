//! File-backed piece storage: layout arithmetic, verification and I/O.
use crate::bitmap::Bitmap;
use crate::torrent::Metainfo;
use sha1::{Digest, Sha1};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, instrument, warn};

#[derive(Debug, Error)]
pub enum PieceStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {index} has wrong length: expected {expected}, got {got}")]
    WrongLength {
        index: usize,
        expected: i64,
        got: usize,
    },
}

/// Owns the on-disk file backing a torrent's data and the verified-piece
/// bitmap derived from it.
pub struct PieceStore {
    file: std::fs::File,
    path: PathBuf,
    piece_length: i64,
    total_length: i64,
    piece_hashes: Vec<[u8; 20]>,
}

impl PieceStore {
    /// Opens (creating if absent) the file named `meta.info.name` inside
    /// `dir`, truncating it to `meta.info.length` if its current size
    /// doesn't match.
    #[instrument(level = "debug", skip(meta))]
    pub fn open(meta: &Metainfo, dir: impl AsRef<Path>) -> Result<Self, PieceStoreError> {
        let path = dir.as_ref().join(&meta.info.name);
        let file = OpenOptions::new().read(true).write(true).create(true).open(&path)?;

        let mut store = PieceStore {
            file,
            path,
            piece_length: meta.info.piece_length,
            total_length: meta.info.length,
            piece_hashes: meta.info.pieces.clone(),
        };
        store.resize_to_expected_length()?;
        Ok(store)
    }

    fn resize_to_expected_length(&mut self) -> Result<(), PieceStoreError> {
        let current_len = self.file.metadata()?.len();
        if current_len != self.total_length as u64 {
            debug!(current_len, expected = self.total_length, "truncating backing file");
            self.file.set_len(self.total_length as u64)?;
        }
        Ok(())
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    fn piece_size(&self, index: usize) -> i64 {
        if index >= self.piece_hashes.len() {
            return 0;
        }
        let remaining = self.total_length - (index as i64) * self.piece_length;
        remaining.min(self.piece_length)
    }

    /// Scans the whole file sequentially, hashing each piece and
    /// comparing it against the expected hash. I/O errors on an
    /// individual piece are not fatal — that piece is marked unsaved and
    /// scanning continues with the rest.
    #[instrument(level = "info", skip(self))]
    pub fn verify_all(&mut self) -> Result<Bitmap, PieceStoreError> {
        let mut saved = Bitmap::new(self.piece_hashes.len());
        for index in 0..self.piece_hashes.len() {
            match self.read_piece_unchecked(index) {
                Ok(bytes) => {
                    let digest = sha1_digest(&bytes);
                    saved.set(index, digest == self.piece_hashes[index]);
                }
                Err(e) => {
                    warn!(index, error = %e, "I/O error verifying piece, marking unsaved");
                    saved.set(index, false);
                }
            }
        }
        Ok(saved)
    }

    fn read_piece_unchecked(&mut self, index: usize) -> Result<Vec<u8>, PieceStoreError> {
        let size = self.piece_size(index) as usize;
        let mut buf = vec![0u8; size];
        self.file.seek(SeekFrom::Start((index as i64 * self.piece_length) as u64))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn read_piece(&mut self, index: usize) -> Result<Vec<u8>, PieceStoreError> {
        self.read_piece_unchecked(index)
    }

    /// Writes a fully assembled, already-verified piece to disk.
    /// Refuses data whose length doesn't match the expected piece
    /// length (the last piece may be shorter). Flushes on every
    /// successful write so a saved piece survives a crash.
    #[instrument(level = "debug", skip(self, bytes))]
    pub fn write_piece(&mut self, index: usize, bytes: &[u8]) -> Result<(), PieceStoreError> {
        let expected = self.piece_size(index);
        if bytes.len() as i64 != expected {
            return Err(PieceStoreError::WrongLength {
                index,
                expected,
                got: bytes.len(),
            });
        }
        self.file.seek(SeekFrom::Start((index as i64 * self.piece_length) as u64))?;
        self.file.write_all(bytes)?;
        self.file.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn sha1_digest(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}
