//! # Matrix Store: Disk-Backed User×Attribute Matrix
//!
//! Dense boolean matrices packed 8 cells per byte (LSB-first, rows padded to
//! whole bytes), persisted via `rkyv` zero-copy serialization. A store holds
//! the user×attribute matrix, its transpose, and the non-empty-attribute
//! indicator together with the blake3 digest of the ruleset snapshot it was
//! derived from. Workers attach through [`MappedMatrix`] and borrow read-only
//! [`MatrixView`]s; nothing is copied per worker.

use crate::bits;
use memmap2::Mmap;
use rkyv::bytecheck::CheckBytes;
use rkyv::{Archive, Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum MatrixError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("archive error: {0}")]
    Archive(String),
    #[error("cell ({row}, {col}) out of range for {rows}×{cols} matrix")]
    CellOutOfRange {
        row: usize,
        col: usize,
        rows: usize,
        cols: usize,
    },
    #[error("matrix shape mismatch: {rows}×{cols} needs {expected} bytes, store holds {got}")]
    ShapeMismatch {
        rows: usize,
        cols: usize,
        expected: usize,
        got: usize,
    },
}

/// Dense row-major boolean matrix.
#[derive(Debug, Clone, PartialEq, Archive, Deserialize, Serialize, CheckBytes)]
#[rkyv(derive(Debug))]
pub struct BitMatrix {
    rows: u32,
    cols: u32,
    stride: u32,
    bits: Vec<u8>,
}

impl BitMatrix {
    pub fn zeroed(rows: usize, cols: usize) -> Self {
        let stride = bits::packed_len(cols);
        Self {
            rows: rows as u32,
            cols: cols as u32,
            stride: stride as u32,
            bits: vec![0u8; rows * stride],
        }
    }

    /// Builds a matrix from per-row index sets.
    pub fn from_index_rows(index_rows: &[Vec<u32>], cols: usize) -> Result<Self, MatrixError> {
        let mut m = Self::zeroed(index_rows.len(), cols);
        for (r, indices) in index_rows.iter().enumerate() {
            for &c in indices {
                m.set(r, c as usize, true)?;
            }
        }
        Ok(m)
    }

    pub fn rows(&self) -> usize {
        self.rows as usize
    }

    pub fn cols(&self) -> usize {
        self.cols as usize
    }

    pub fn stride(&self) -> usize {
        self.stride as usize
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        bits::test(self.row(row), col)
    }

    pub fn set(&mut self, row: usize, col: usize, value: bool) -> Result<(), MatrixError> {
        if row >= self.rows() || col >= self.cols() {
            return Err(MatrixError::CellOutOfRange {
                row,
                col,
                rows: self.rows(),
                cols: self.cols(),
            });
        }
        let stride = self.stride();
        let slice = &mut self.bits[row * stride..(row + 1) * stride];
        if value {
            bits::set(slice, col);
        } else {
            bits::clear(slice, col);
        }
        Ok(())
    }

    pub fn row(&self, row: usize) -> &[u8] {
        let stride = self.stride();
        &self.bits[row * stride..(row + 1) * stride]
    }

    pub fn row_mut(&mut self, row: usize) -> &mut [u8] {
        let stride = self.stride();
        &mut self.bits[row * stride..(row + 1) * stride]
    }

    pub fn transposed(&self) -> BitMatrix {
        let mut t = BitMatrix::zeroed(self.cols(), self.rows());
        for r in 0..self.rows() {
            let row = self.row(r);
            for c in bits::iter_ones(row, self.cols()) {
                let stride = t.stride();
                bits::set(&mut t.bits[c as usize * stride..(c as usize + 1) * stride], r);
            }
        }
        t
    }

    pub fn view(&self) -> MatrixView<'_> {
        MatrixView {
            rows: self.rows(),
            cols: self.cols(),
            stride: self.stride(),
            bits: &self.bits,
        }
    }
}

/// Borrowed read-only view over a packed matrix (owned or mapped).
#[derive(Debug, Clone, Copy)]
pub struct MatrixView<'a> {
    rows: usize,
    cols: usize,
    stride: usize,
    bits: &'a [u8],
}

impl<'a> MatrixView<'a> {
    pub fn new(rows: usize, cols: usize, stride: usize, bits: &'a [u8]) -> Result<Self, MatrixError> {
        if stride != bits::packed_len(cols) || bits.len() != rows * stride {
            return Err(MatrixError::ShapeMismatch {
                rows,
                cols,
                expected: rows * bits::packed_len(cols),
                got: bits.len(),
            });
        }
        Ok(Self {
            rows,
            cols,
            stride,
            bits,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn get(&self, row: usize, col: usize) -> bool {
        bits::test(self.row(row), col)
    }

    pub fn row(&self, row: usize) -> &'a [u8] {
        &self.bits[row * self.stride..(row + 1) * self.stride]
    }

    pub fn row_count_ones(&self, row: usize) -> u64 {
        bits::count_ones(self.row(row))
    }
}

/// The shared-state bundle the fingerprinting kernels read: matrix,
/// transpose, non-empty-attribute indicator, and the snapshot digest that
/// binds derived artifacts to their ruleset snapshot.
#[derive(Debug, Clone, Archive, Deserialize, Serialize, CheckBytes)]
#[rkyv(derive(Debug))]
pub struct MatrixStore {
    pub user_attrs: BitMatrix,
    pub attr_users: BitMatrix,
    /// Bitmap over attributes: set iff at least one user has the attribute.
    pub non_empty: Vec<u8>,
    pub snapshot_digest: [u8; 32],
}

impl MatrixStore {
    /// Derives transpose and non-empty indicator from the user×attribute
    /// matrix.
    pub fn build(user_attrs: BitMatrix, snapshot_digest: [u8; 32]) -> Self {
        let attr_users = user_attrs.transposed();
        let mut non_empty = vec![0u8; bits::packed_len(attr_users.rows())];
        for a in 0..attr_users.rows() {
            if bits::count_ones(attr_users.row(a)) > 0 {
                bits::set(&mut non_empty, a);
            }
        }
        Self {
            user_attrs,
            attr_users,
            non_empty,
            snapshot_digest,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, MatrixError> {
        let aligned = rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map_err(|e| MatrixError::Archive(e.to_string()))?;
        Ok(aligned.to_vec())
    }

    /// Saves the store with write-then-rename so a partial file never
    /// masquerades as a complete one.
    pub fn save(&self, path: &Path) -> Result<(), MatrixError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = self.to_bytes()?;
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// Memory-mapped read-only store handle.
pub struct MappedMatrix {
    _mmap: Mmap,
}

impl MappedMatrix {
    /// Opens a store file via mmap and validates the archive and both
    /// matrix shapes once; views handed out afterwards are zero-copy.
    pub fn open(path: &Path) -> Result<Self, MatrixError> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        let archived = rkyv::access::<ArchivedMatrixStore, rkyv::rancor::Error>(&mmap)
            .map_err(|e| MatrixError::Archive(e.to_string()))?;
        Self::check_shape(&archived.user_attrs)?;
        Self::check_shape(&archived.attr_users)?;

        Ok(Self { _mmap: mmap })
    }

    fn check_shape(m: &ArchivedBitMatrix) -> Result<(), MatrixError> {
        let rows: u32 = m.rows.into();
        let cols: u32 = m.cols.into();
        let stride: u32 = m.stride.into();
        MatrixView::new(rows as usize, cols as usize, stride as usize, m.bits.as_slice())?;
        Ok(())
    }

    /// Returns a reference to the archived store (zero-copy).
    pub fn archived(&self) -> &ArchivedMatrixStore {
        // SAFETY: validated in `open()` via rkyv::access. The mmap is held
        // for the lifetime of self, so the reference is valid.
        unsafe { rkyv::access_unchecked::<ArchivedMatrixStore>(&self._mmap[..]) }
    }

    pub fn user_attrs(&self) -> MatrixView<'_> {
        Self::view_of(&self.archived().user_attrs)
    }

    pub fn attr_users(&self) -> MatrixView<'_> {
        Self::view_of(&self.archived().attr_users)
    }

    pub fn non_empty(&self) -> &[u8] {
        self.archived().non_empty.as_slice()
    }

    pub fn snapshot_digest(&self) -> [u8; 32] {
        self.archived().snapshot_digest
    }

    fn view_of(m: &ArchivedBitMatrix) -> MatrixView<'_> {
        let rows: u32 = m.rows.into();
        let cols: u32 = m.cols.into();
        let stride: u32 = m.stride.into();
        MatrixView {
            rows: rows as usize,
            cols: cols as usize,
            stride: stride as usize,
            bits: m.bits.as_slice(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BitMatrix {
        // 3 users × 3 attributes, one attribute each.
        BitMatrix::from_index_rows(&[vec![0], vec![1], vec![2]], 3).unwrap()
    }

    #[test]
    fn test_set_get() {
        let mut m = BitMatrix::zeroed(4, 10);
        m.set(2, 9, true).unwrap();
        assert!(m.get(2, 9));
        m.set(2, 9, false).unwrap();
        assert!(!m.get(2, 9));
        assert!(m.set(4, 0, true).is_err());
    }

    #[test]
    fn test_transpose() {
        let m = BitMatrix::from_index_rows(&[vec![0, 2], vec![1]], 3).unwrap();
        let t = m.transposed();
        assert_eq!(t.rows(), 3);
        assert_eq!(t.cols(), 2);
        for r in 0..m.rows() {
            for c in 0..m.cols() {
                assert_eq!(m.get(r, c), t.get(c, r));
            }
        }
    }

    #[test]
    fn test_store_roundtrip_mmap() {
        let digest = *blake3::hash(b"snapshot").as_bytes();
        let store = MatrixStore::build(sample(), digest);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.rkyv");
        store.save(&path).unwrap();

        let mapped = MappedMatrix::open(&path).unwrap();
        assert_eq!(mapped.snapshot_digest(), digest);

        let users = mapped.user_attrs();
        let attrs = mapped.attr_users();
        assert_eq!(users.rows(), 3);
        assert_eq!(attrs.rows(), 3);
        for u in 0..3 {
            for a in 0..3 {
                assert_eq!(users.get(u, a), u == a);
                assert_eq!(attrs.get(a, u), u == a);
            }
        }
        assert_eq!(bits::count_ones(mapped.non_empty()), 3);
    }

    #[test]
    fn test_non_empty_indicator() {
        // Attribute 1 has no users.
        let m = BitMatrix::from_index_rows(&[vec![0], vec![2]], 3).unwrap();
        let store = MatrixStore::build(m, [0u8; 32]);
        assert!(bits::test(&store.non_empty, 0));
        assert!(!bits::test(&store.non_empty, 1));
        assert!(bits::test(&store.non_empty, 2));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("matrix.rkyv");
        std::fs::write(&path, b"definitely not an archive").unwrap();
        assert!(MappedMatrix::open(&path).is_err());
    }
}
