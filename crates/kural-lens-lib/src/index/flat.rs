use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;
use tracing::debug;

use super::{SearchResult, VectorIndex, dot};
use crate::error::KuralError;

/// Magic bytes of a FAISS `IndexFlatIP` file.
const MAGIC_FLAT_IP: &[u8; 4] = b"IxFI";

/// Magic bytes of a FAISS `IndexFlatL2` file (rejected: scores would be distances).
const MAGIC_FLAT_L2: &[u8; 4] = b"IxF2";

/// FAISS `METRIC_INNER_PRODUCT`.
const METRIC_INNER_PRODUCT: i32 = 0;

/// Placeholder FAISS writes into the two unused header slots.
const HEADER_DUMMY: i64 = 1 << 20;

const LABEL: &str = "vector index";

/// Exact inner-product index held fully in memory.
///
/// Reads and writes the FAISS `IndexFlatIP` layout (little-endian):
/// `"IxFI"`, `d: i32`, `ntotal: i64`, two `i64` placeholders, `is_trained: u8`,
/// `metric_type: i32`, then `count: u64` followed by `count` `f32` values.
#[derive(Debug, Clone)]
pub struct FlatIpIndex {
    dimension: usize,
    vectors: Vec<f32>,
}

impl FlatIpIndex {
    /// Build an index from row-major vectors.
    pub fn from_vectors(dimension: usize, vectors: Vec<f32>) -> anyhow::Result<Self> {
        if dimension == 0 {
            return Err(invalid("dimension must be positive".to_string()).into());
        }
        if vectors.len() % dimension != 0 {
            return Err(invalid(format!(
                "{} values do not divide into vectors of dimension {dimension}",
                vectors.len()
            ))
            .into());
        }
        Ok(Self { dimension, vectors })
    }

    /// Read an index written by FAISS `write_index` (or [`Self::save`]).
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("Failed to read vector index at {}", path.display()))?;
        Self::parse(&bytes).with_context(|| format!("Failed to load {}", path.display()))
    }

    fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut reader = ByteReader::new(bytes);

        let magic = reader.take(4)?;
        if magic == MAGIC_FLAT_L2 {
            return Err(invalid("L2 index found, an inner-product index is required".into()).into());
        }
        if magic != MAGIC_FLAT_IP {
            return Err(invalid(format!(
                "unrecognized index type {:?}",
                String::from_utf8_lossy(magic)
            ))
            .into());
        }

        let dimension = usize::try_from(reader.read_i32()?)
            .map_err(|_| invalid("negative dimension".into()))?;
        let ntotal = usize::try_from(reader.read_i64()?)
            .map_err(|_| invalid("negative vector count".into()))?;
        reader.read_i64()?;
        reader.read_i64()?;
        let _is_trained = reader.take(1)?;
        let metric = reader.read_i32()?;
        if metric != METRIC_INNER_PRODUCT {
            return Err(invalid(format!("metric type {metric} is not inner product")).into());
        }

        let count = usize::try_from(reader.read_u64()?)
            .map_err(|_| invalid("vector payload too large".into()))?;
        let expected = ntotal
            .checked_mul(dimension)
            .ok_or_else(|| invalid("vector payload too large".into()))?;
        if count != expected {
            return Err(invalid(format!(
                "header declares {ntotal} vectors of dimension {dimension}, payload holds {count} values"
            ))
            .into());
        }

        let vectors = reader
            .take(count * 4)?
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        Self::from_vectors(dimension, vectors)
    }

    /// Write the index in the FAISS `IndexFlatIP` layout.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let file = File::create(path)
            .with_context(|| format!("Failed to create vector index at {}", path.display()))?;
        let mut w = BufWriter::new(file);

        w.write_all(MAGIC_FLAT_IP)?;
        w.write_all(&i32::try_from(self.dimension)?.to_le_bytes())?;
        w.write_all(&i64::try_from(self.ntotal())?.to_le_bytes())?;
        w.write_all(&HEADER_DUMMY.to_le_bytes())?;
        w.write_all(&HEADER_DUMMY.to_le_bytes())?;
        w.write_all(&[1u8])?;
        w.write_all(&METRIC_INNER_PRODUCT.to_le_bytes())?;
        w.write_all(&(self.vectors.len() as u64).to_le_bytes())?;
        for value in &self.vectors {
            w.write_all(&value.to_le_bytes())?;
        }
        w.flush()?;
        Ok(())
    }

    /// Stored vector at `position`, if any.
    pub fn vector(&self, position: usize) -> Option<&[f32]> {
        self.vectors
            .chunks_exact(self.dimension)
            .nth(position)
    }
}

impl VectorIndex for FlatIpIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn ntotal(&self) -> usize {
        self.vectors.len() / self.dimension
    }

    fn search(&self, query: &[f32], k: usize) -> anyhow::Result<SearchResult> {
        if query.len() != self.dimension {
            return Err(KuralError::DimensionMismatch {
                what: "query vector".to_string(),
                expected: self.dimension,
                actual: query.len(),
            }
            .into());
        }

        let mut scored: Vec<(f32, usize)> = self
            .vectors
            .chunks_exact(self.dimension)
            .map(|v| dot(query, v))
            .zip(0..)
            .collect();

        // Descending score; ties keep the lower position first.
        let by_rank = |a: &(f32, usize), b: &(f32, usize)| -> Ordering {
            b.0.total_cmp(&a.0).then(a.1.cmp(&b.1))
        };
        let found = k.min(scored.len());
        if found > 0 && found < scored.len() {
            scored.select_nth_unstable_by(found - 1, by_rank);
            scored.truncate(found);
        }
        scored.sort_unstable_by(by_rank);
        scored.truncate(found);

        let mut result = SearchResult {
            scores: Vec::with_capacity(k),
            positions: Vec::with_capacity(k),
        };
        for (score, position) in scored {
            result.scores.push(score);
            result.positions.push(i64::try_from(position)?);
        }
        result.scores.resize(k, f32::NEG_INFINITY);
        result.positions.resize(k, -1);

        debug!(k = k, found = found, ntotal = self.ntotal(), "Flat index search completed");
        Ok(result)
    }
}

fn invalid(reason: String) -> KuralError {
    KuralError::InvalidArtifact {
        label: LABEL,
        reason,
    }
}

/// Little-endian cursor over an in-memory file.
struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    const fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| invalid(format!("truncated at byte {}", self.pos)))?;
        let bytes: &'a [u8] = self.bytes;
        self.pos = end;
        Ok(&bytes[end - n..end])
    }

    fn read_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        let mut buf = [0u8; N];
        buf.copy_from_slice(self.take(N)?);
        Ok(buf)
    }

    fn read_i32(&mut self) -> anyhow::Result<i32> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    fn read_i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    fn read_u64(&mut self) -> anyhow::Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> FlatIpIndex {
        FlatIpIndex::from_vectors(
            2,
            vec![
                1.0, 0.0, //
                0.0, 1.0, //
                0.6, 0.8, //
                -1.0, 0.0,
            ],
        )
        .unwrap()
    }

    #[test]
    fn search_orders_by_descending_inner_product() {
        let result = index().search(&[1.0, 0.0], 3).unwrap();
        assert_eq!(result.positions, vec![0, 2, 1]);
        assert_eq!(result.scores, vec![1.0, 0.6, 0.0]);
    }

    #[test]
    fn search_pads_when_k_exceeds_ntotal() {
        let result = index().search(&[0.0, 1.0], 6).unwrap();
        assert_eq!(result.positions, vec![1, 2, 0, 3, -1, -1]);
        assert_eq!(result.scores[4], f32::NEG_INFINITY);
    }

    #[test]
    fn search_ties_prefer_lower_position() {
        let idx = FlatIpIndex::from_vectors(1, vec![0.5, 0.5, 0.5]).unwrap();
        let result = idx.search(&[1.0], 2).unwrap();
        assert_eq!(result.positions, vec![0, 1]);
    }

    #[test]
    fn search_rejects_wrong_query_dimension() {
        let err = index().search(&[1.0, 0.0, 0.0], 1).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<KuralError>(),
            Some(KuralError::DimensionMismatch {
                expected: 2,
                actual: 3,
                ..
            })
        ));
    }

    #[test]
    fn search_with_zero_k_is_empty() {
        assert!(index().search(&[1.0, 0.0], 0).unwrap().is_empty());
    }

    #[test]
    fn save_and_load_preserve_vectors_and_order() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kural_index.faiss");
        index().save(&path).unwrap();

        let loaded = FlatIpIndex::load(&path).unwrap();
        assert_eq!(loaded.dimension(), 2);
        assert_eq!(loaded.ntotal(), 4);
        assert_eq!(loaded.vector(2), Some(&[0.6, 0.8][..]));
    }

    #[test]
    fn saved_file_uses_faiss_header_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kural_index.faiss");
        index().save(&path).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(&bytes[0..4], b"IxFI");
        assert_eq!(i32::from_le_bytes(bytes[4..8].try_into().unwrap()), 2);
        assert_eq!(i64::from_le_bytes(bytes[8..16].try_into().unwrap()), 4);
        // 4 magic + 4 d + 8 ntotal + 16 dummies + 1 trained + 4 metric + 8 count + 32 floats
        assert_eq!(bytes.len(), 77);
    }

    #[test]
    fn load_rejects_l2_index() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("l2.faiss");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"IxF2");
        bytes.extend_from_slice(&[0u8; 40]);
        fs::write(&path, bytes).unwrap();

        let err = FlatIpIndex::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("inner-product index is required"));
    }

    #[test]
    fn load_rejects_truncated_payload() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("kural_index.faiss");
        index().save(&path).unwrap();
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

        let err = FlatIpIndex::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("truncated"));
    }

    #[test]
    fn from_vectors_rejects_ragged_input() {
        assert!(FlatIpIndex::from_vectors(3, vec![1.0; 4]).is_err());
        assert!(FlatIpIndex::from_vectors(0, Vec::new()).is_err());
    }
}
