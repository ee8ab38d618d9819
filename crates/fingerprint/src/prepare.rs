//! Attribute indexing and matrix preparation.
//!
//! The filterlist encoding assigns dense attribute ids in first-seen order
//! over the user rows; the id → equivalence-set mapping is emitted alongside
//! every result so masks stay interpretable. The rule encoding rehydrates
//! compressed per-user bitsets straight into matrix rows (the codec's packed
//! layout equals the row layout, so a row is decompress-and-copy).

use common::artifacts::MarkerMap;
use common::bitset::{self, CodecError};
use common::matrix::{BitMatrix, MatrixError};
use rayon::prelude::*;

#[derive(Debug, thiserror::Error)]
pub enum PrepareError {
    #[error("row {row}: {source}")]
    Row {
        row: usize,
        #[source]
        source: CodecError,
    },
    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Dense attribute adjacency for the set-based kernels.
#[derive(Debug, Default, Clone)]
pub struct AttrIndex {
    /// Per user: attribute ids, ascending.
    pub users: Vec<Vec<u32>>,
    /// Per attribute: user row ids, ascending.
    pub attr_users: Vec<Vec<u32>>,
    /// Attribute id → source id (equivalence-set id in filterlist mode).
    pub marker_map: MarkerMap,
}

impl AttrIndex {
    pub fn n_users(&self) -> usize {
        self.users.len()
    }

    pub fn n_attrs(&self) -> usize {
        self.attr_users.len()
    }
}

/// Indexes attributes in first-seen order over per-user source-id sets.
pub fn index_attributes(resolved: &[Vec<u32>]) -> AttrIndex {
    let mut index = AttrIndex::default();
    let mut attr_of: std::collections::HashMap<u32, u32> = std::collections::HashMap::new();

    for (u, sources) in resolved.iter().enumerate() {
        let mut attrs = Vec::with_capacity(sources.len());
        for &source in sources {
            let attr = match attr_of.get(&source) {
                Some(&attr) => attr,
                None => {
                    let attr = index.attr_users.len() as u32;
                    attr_of.insert(source, attr);
                    index.attr_users.push(Vec::new());
                    index.marker_map.insert(attr, source);
                    attr
                }
            };
            index.attr_users[attr as usize].push(u as u32);
            attrs.push(attr);
        }
        attrs.sort_unstable();
        index.users.push(attrs);
    }
    index
}

/// Dense matrix from the set adjacency.
pub fn matrix_from_index(index: &AttrIndex) -> Result<BitMatrix, MatrixError> {
    BitMatrix::from_index_rows(&index.users, index.n_attrs())
}

/// Rehydrates hex-encoded compressed bitset columns into a dense matrix,
/// one row per column, decoded in parallel.
pub fn rehydrate_matrix(columns: &[String], n_cols: usize) -> Result<BitMatrix, PrepareError> {
    let rows: Vec<Vec<u8>> = columns
        .par_iter()
        .enumerate()
        .map(|(row, column)| {
            match bitset::decode_hex(column, n_cols, bitset::DecodeMode::Raw) {
                Ok(bitset::Decoded::Raw(raw)) => Ok(raw),
                Ok(_) => unreachable!("raw mode returns raw bytes"),
                Err(source) => Err(PrepareError::Row { row, source }),
            }
        })
        .collect::<Result<_, PrepareError>>()?;

    let mut matrix = BitMatrix::zeroed(columns.len(), n_cols);
    for (r, raw) in rows.iter().enumerate() {
        matrix.row_mut(r).copy_from_slice(raw);
    }
    Ok(matrix)
}
