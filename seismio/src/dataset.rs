//! Typed N-dimensional datasets over a byte store.
//!
//! A [`Dataset`] holds `f32` elements in either a contiguous or a chunked
//! layout below a key prefix in a store. Its self-describing metadata
//! document lives at `<name>/meta.json`; chunked data lives one chunk per key
//! under `<name>/c/`, contiguous data in a single value at `<name>/data` with
//! row-granular partial writes so disjoint regions need no coordination.

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use seismio_storage::{ByteRange, Bytes, SharedStore, StorageError, StoreKey, StoreKeyError};

use crate::filter::{decode_chain, encode_chain, Filter, FilterError};
use crate::hyperslab::{linear_index, Hyperslab, HyperslabError};

/// The element size in bytes. Datasets hold `f32` elements.
pub const ELEMENT_SIZE: u64 = size_of::<f32>() as u64;

/// The element data type of a dataset.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// IEEE 754 single precision.
    Float32,
}

/// The physical layout of a dataset.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum DatasetLayout {
    /// One value holding the whole extent in row-major order.
    Contiguous,
    /// One value per chunk.
    Chunked {
        /// The chunk shape. Must match the dataset dimensionality.
        chunk_shape: Vec<u64>,
    },
}

/// When fill values are materialized.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillTime {
    /// Fill values are written when storage is allocated.
    OnAllocation,
    /// Fill values are never materialized; unwritten regions read back as
    /// the fill value anyway, this is purely an optimization hint.
    Never,
}

/// When backing storage is reserved.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocTime {
    /// Storage appears as regions are first written.
    Incremental,
    /// The whole extent is reserved at creation time.
    Early,
}

/// The metadata document describing a dataset.
///
/// This is the single schema-to-record mapping: the in-memory form and the
/// persisted JSON are kept in sync by the serde derive alone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatasetMetadata {
    /// The global array shape.
    pub shape: Vec<u64>,
    /// The element data type.
    pub data_type: DataType,
    /// The physical layout.
    pub layout: DatasetLayout,
    /// The value unwritten elements read back as.
    pub fill_value: f32,
    /// When fill values are materialized.
    pub fill_time: FillTime,
    /// When backing storage is reserved.
    pub alloc_time: AllocTime,
    /// The per-chunk filter chain. Requires a chunked layout.
    pub filters: Vec<Filter>,
}

impl DatasetMetadata {
    /// Validate the metadata.
    ///
    /// # Errors
    /// Returns a [`DatasetError`] for an empty shape or chunk, a chunk shape
    /// of the wrong dimensionality, filters on a contiguous layout, or
    /// invalid filter parameters.
    pub fn validate(&self) -> Result<(), DatasetError> {
        if self.shape.is_empty() || self.shape.contains(&0) {
            return Err(DatasetError::InvalidMetadata(format!(
                "invalid shape {:?}",
                self.shape
            )));
        }
        match &self.layout {
            DatasetLayout::Contiguous => {
                if !self.filters.is_empty() {
                    return Err(DatasetError::InvalidMetadata(
                        "filters require a chunked layout".to_string(),
                    ));
                }
            }
            DatasetLayout::Chunked { chunk_shape } => {
                if chunk_shape.len() != self.shape.len() || chunk_shape.contains(&0) {
                    return Err(DatasetError::InvalidMetadata(format!(
                        "invalid chunk shape {chunk_shape:?} for shape {:?}",
                        self.shape
                    )));
                }
            }
        }
        for filter in &self.filters {
            filter.validate()?;
        }
        Ok(())
    }

    /// The number of elements in the dataset.
    #[must_use]
    pub fn num_elements(&self) -> u64 {
        self.shape.iter().product()
    }
}

/// A dataset error.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// An underlying storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// A filter error.
    #[error(transparent)]
    Filter(#[from] FilterError),
    /// An invalid hyperslab.
    #[error(transparent)]
    Hyperslab(#[from] HyperslabError),
    /// An invalid dataset name.
    #[error(transparent)]
    InvalidName(#[from] StoreKeyError),
    /// The dataset does not exist in the container.
    #[error("dataset {0} does not exist")]
    Missing(String),
    /// An unparseable or inconsistent metadata document.
    #[error("invalid dataset metadata: {0}")]
    InvalidMetadata(String),
    /// A selection extending beyond the dataset shape.
    #[error("selection ending at {end:?} is out of bounds of dataset shape {shape:?}")]
    SelectionOutOfBounds {
        /// The exclusive selection end.
        end: Vec<u64>,
        /// The dataset shape.
        shape: Vec<u64>,
    },
    /// A buffer whose element count does not match the selection.
    #[error("buffer of {buffer} elements does not match selection of {selection} elements")]
    BufferLengthMismatch {
        /// The buffer element count.
        buffer: usize,
        /// The selection element count.
        selection: u64,
    },
    /// A strided selection on a chunked dataset.
    #[error("strided selections are not supported on chunked datasets")]
    UnsupportedSelection,
    /// A stored chunk that decoded to the wrong size.
    #[error("chunk {key} decoded to {got} bytes, expected {expected}")]
    CorruptChunk {
        /// The chunk key.
        key: StoreKey,
        /// The decoded size.
        got: usize,
        /// The expected size.
        expected: usize,
    },
}

/// A typed N-dimensional dataset bound to a store.
#[derive(Debug)]
pub struct Dataset {
    store: SharedStore,
    name: String,
    metadata: DatasetMetadata,
}

impl Dataset {
    /// Create a dataset named `name`, persisting its metadata document.
    ///
    /// Does not reserve data storage; see [`Dataset::allocate_early`].
    ///
    /// # Errors
    /// Returns a [`DatasetError`] if the metadata is invalid or storage
    /// fails.
    pub fn create(
        store: SharedStore,
        name: &str,
        metadata: DatasetMetadata,
    ) -> Result<Self, DatasetError> {
        metadata.validate()?;
        let key = StoreKey::new(format!("{name}/meta.json"))?;
        let document = serde_json::to_vec(&metadata)
            .map_err(|err| DatasetError::InvalidMetadata(err.to_string()))?;
        store.set(&key, document.into())?;
        Ok(Self {
            store,
            name: name.to_string(),
            metadata,
        })
    }

    /// Open the dataset named `name`.
    ///
    /// # Errors
    /// Returns [`DatasetError::Missing`] if no metadata document exists, or
    /// a [`DatasetError`] if it cannot be parsed.
    pub fn open(store: SharedStore, name: &str) -> Result<Self, DatasetError> {
        let key = StoreKey::new(format!("{name}/meta.json"))?;
        let document = store
            .get(&key)?
            .ok_or_else(|| DatasetError::Missing(name.to_string()))?;
        let metadata: DatasetMetadata = serde_json::from_slice(&document)
            .map_err(|err| DatasetError::InvalidMetadata(err.to_string()))?;
        metadata.validate()?;
        Ok(Self {
            store,
            name: name.to_string(),
            metadata,
        })
    }

    /// The dataset metadata.
    #[must_use]
    pub fn metadata(&self) -> &DatasetMetadata {
        &self.metadata
    }

    /// The dataset shape.
    #[must_use]
    pub fn shape(&self) -> &[u64] {
        &self.metadata.shape
    }

    /// Reserve backing storage for the whole extent.
    ///
    /// With [`FillTime::OnAllocation`] every element is materialized as the
    /// fill value; with [`FillTime::Never`] only the extent is reserved.
    /// Intended to be issued by one worker, not all.
    ///
    /// # Errors
    /// Returns a [`DatasetError`] if storage fails.
    pub fn allocate_early(&self) -> Result<(), DatasetError> {
        match self.metadata.layout.clone() {
            DatasetLayout::Contiguous => {
                let bytes = self.metadata.num_elements() * ELEMENT_SIZE;
                if self.metadata.fill_time == FillTime::Never {
                    // Reserve the extent without streaming fill values.
                    self.store
                        .set_partial(&self.data_key()?, &[(bytes - 1, Bytes::from_static(&[0]))])?;
                } else {
                    let fill = vec![self.metadata.fill_value; usize::try_from(bytes / ELEMENT_SIZE).unwrap()];
                    self.store
                        .set(&self.data_key()?, Bytes::copy_from_slice(bytemuck::cast_slice(&fill)))?;
                }
            }
            DatasetLayout::Chunked { chunk_shape } => {
                if self.metadata.fill_time == FillTime::Never {
                    return Ok(());
                }
                let chunk_elements =
                    usize::try_from(chunk_shape.iter().product::<u64>()).unwrap();
                let fill = vec![self.metadata.fill_value; chunk_elements];
                let encoded = encode_chain(
                    &self.metadata.filters,
                    bytemuck::cast_slice(&fill).to_vec(),
                )?;
                let chunks_per_axis: Vec<u64> = std::iter::zip(&self.metadata.shape, &chunk_shape)
                    .map(|(&extent, &chunk)| extent.div_ceil(chunk))
                    .collect();
                for index in indices(&chunks_per_axis) {
                    self.store
                        .set(&self.chunk_key(&index)?, Bytes::copy_from_slice(&encoded))?;
                }
            }
        }
        Ok(())
    }

    /// Write `data` into the region selected by `selection`.
    ///
    /// `data` is the dense row-major contents of the selection. The caller
    /// must exclusively own the selected region; chunks that straddle two
    /// writers' regions are read-modify-written and need external ordering.
    ///
    /// # Errors
    /// Returns a [`DatasetError`] if the selection is out of bounds, the
    /// buffer length does not match, or storage fails.
    pub fn write_hyperslab(
        &self,
        selection: &Hyperslab,
        data: &[f32],
    ) -> Result<(), DatasetError> {
        self.check_selection(selection, data.len())?;
        match self.metadata.layout.clone() {
            DatasetLayout::Contiguous => self.write_contiguous(selection, data),
            DatasetLayout::Chunked { chunk_shape } => {
                self.write_chunked(selection, data, &chunk_shape)
            }
        }
    }

    /// Read the region selected by `selection` into a dense row-major buffer.
    ///
    /// Unwritten elements read back as the fill value.
    ///
    /// # Errors
    /// Returns a [`DatasetError`] if the selection is out of bounds or
    /// storage fails.
    pub fn read_hyperslab(&self, selection: &Hyperslab) -> Result<Vec<f32>, DatasetError> {
        let num_elements = usize::try_from(selection.num_elements()).unwrap();
        self.check_selection(selection, num_elements)?;
        let mut out = vec![self.metadata.fill_value; num_elements];
        match self.metadata.layout.clone() {
            DatasetLayout::Contiguous => self.read_contiguous(selection, &mut out)?,
            DatasetLayout::Chunked { chunk_shape } => {
                self.read_chunked(selection, &mut out, &chunk_shape)?;
            }
        }
        Ok(out)
    }

    /// The storage consumed by the dataset's data, in bytes.
    ///
    /// Reflects the filter chain, so compressed datasets report their
    /// compressed size.
    ///
    /// # Errors
    /// Returns a [`StorageError`] if the store cannot be listed.
    pub fn storage_size(&self) -> Result<u64, StorageError> {
        let prefix = match self.metadata.layout {
            DatasetLayout::Contiguous => format!("{}/data", self.name),
            DatasetLayout::Chunked { .. } => format!("{}/c", self.name),
        };
        self.store.size_prefix(&prefix)
    }

    fn data_key(&self) -> Result<StoreKey, StoreKeyError> {
        StoreKey::new(format!("{}/data", self.name))
    }

    fn chunk_key(&self, chunk_index: &[u64]) -> Result<StoreKey, StoreKeyError> {
        StoreKey::new(format!(
            "{}/c/{}",
            self.name,
            chunk_index.iter().join("/")
        ))
    }

    fn check_selection(
        &self,
        selection: &Hyperslab,
        buffer_elements: usize,
    ) -> Result<(), DatasetError> {
        let end = selection.end_exc();
        if selection.dimensionality() != self.metadata.shape.len()
            || std::iter::zip(&end, &self.metadata.shape).any(|(&end, &extent)| end > extent)
        {
            return Err(DatasetError::SelectionOutOfBounds {
                end,
                shape: self.metadata.shape.clone(),
            });
        }
        if buffer_elements as u64 != selection.num_elements() {
            return Err(DatasetError::BufferLengthMismatch {
                buffer: buffer_elements,
                selection: selection.num_elements(),
            });
        }
        Ok(())
    }

    fn write_contiguous(&self, selection: &Hyperslab, data: &[f32]) -> Result<(), DatasetError> {
        let mut offset_values = Vec::new();
        let mut consumed = 0usize;
        for (index, length) in selection.rows() {
            let offset = linear_index(&self.metadata.shape, &index) * ELEMENT_SIZE;
            let end = consumed + usize::try_from(length).unwrap();
            let row = Bytes::copy_from_slice(bytemuck::cast_slice(&data[consumed..end]));
            offset_values.push((offset, row));
            consumed = end;
        }
        self.store.set_partial(&self.data_key()?, &offset_values)?;
        Ok(())
    }

    fn read_contiguous(&self, selection: &Hyperslab, out: &mut [f32]) -> Result<(), DatasetError> {
        let key = self.data_key()?;
        let Some(stored) = self.store.size_key(&key)? else {
            return Ok(());
        };
        let stored = stored - stored % ELEMENT_SIZE;
        let mut ranges = Vec::new();
        let mut destinations = Vec::new();
        let mut consumed = 0usize;
        for (index, length) in selection.rows() {
            let offset = linear_index(&self.metadata.shape, &index) * ELEMENT_SIZE;
            // Clamp to what was actually written; the rest keeps fill values.
            let available = stored.saturating_sub(offset).min(length * ELEMENT_SIZE);
            if available > 0 {
                ranges.push(ByteRange::new(offset, available));
                destinations.push(consumed);
            }
            consumed += usize::try_from(length).unwrap();
        }
        if let Some(rows) = self.store.get_partial(&key, &ranges)? {
            for (row, &destination) in std::iter::zip(rows, &destinations) {
                let elements: &[f32] = bytemuck::cast_slice(&row);
                out[destination..destination + elements.len()].copy_from_slice(elements);
            }
        }
        Ok(())
    }

    fn write_chunked(
        &self,
        selection: &Hyperslab,
        data: &[f32],
        chunk_shape: &[u64],
    ) -> Result<(), DatasetError> {
        if !selection.is_regular() {
            return Err(DatasetError::UnsupportedSelection);
        }
        let start = selection.start();
        let end = selection.end_exc();
        let chunk_elements = usize::try_from(chunk_shape.iter().product::<u64>()).unwrap();
        for chunk_index in overlapped_chunks(start, &end, chunk_shape) {
            let key = self.chunk_key(&chunk_index)?;
            let origin: Vec<u64> = std::iter::zip(&chunk_index, chunk_shape)
                .map(|(&index, &extent)| index * extent)
                .collect();
            let covers_chunk = std::iter::zip(&origin, chunk_shape).enumerate().all(
                |(axis, (&origin, &extent))| {
                    start[axis] <= origin && origin + extent <= end[axis]
                },
            );
            let mut chunk = if covers_chunk {
                vec![self.metadata.fill_value; chunk_elements]
            } else {
                // Read-modify-write for a partially covered chunk.
                self.decode_chunk(&key, chunk_elements)?
                    .unwrap_or_else(|| vec![self.metadata.fill_value; chunk_elements])
            };
            copy_intersection(
                start,
                &end,
                &origin,
                chunk_shape,
                |source, destination, length| {
                    chunk[destination..destination + length]
                        .copy_from_slice(&data[source..source + length]);
                },
            );
            let encoded =
                encode_chain(&self.metadata.filters, bytemuck::cast_slice(&chunk).to_vec())?;
            self.store.set(&key, encoded.into())?;
        }
        Ok(())
    }

    fn read_chunked(
        &self,
        selection: &Hyperslab,
        out: &mut [f32],
        chunk_shape: &[u64],
    ) -> Result<(), DatasetError> {
        if !selection.is_regular() {
            return Err(DatasetError::UnsupportedSelection);
        }
        let start = selection.start();
        let end = selection.end_exc();
        let chunk_elements = usize::try_from(chunk_shape.iter().product::<u64>()).unwrap();
        for chunk_index in overlapped_chunks(start, &end, chunk_shape) {
            let key = self.chunk_key(&chunk_index)?;
            let Some(chunk) = self.decode_chunk(&key, chunk_elements)? else {
                continue;
            };
            let origin: Vec<u64> = std::iter::zip(&chunk_index, chunk_shape)
                .map(|(&index, &extent)| index * extent)
                .collect();
            copy_intersection(
                start,
                &end,
                &origin,
                chunk_shape,
                |source, destination, length| {
                    out[source..source + length].copy_from_slice(&chunk[destination..destination + length]);
                },
            );
        }
        Ok(())
    }

    fn decode_chunk(
        &self,
        key: &StoreKey,
        chunk_elements: usize,
    ) -> Result<Option<Vec<f32>>, DatasetError> {
        let Some(encoded) = self.store.get(key)? else {
            return Ok(None);
        };
        let decoded = decode_chain(&self.metadata.filters, encoded.to_vec())?;
        if decoded.len() != chunk_elements * usize::try_from(ELEMENT_SIZE).unwrap() {
            return Err(DatasetError::CorruptChunk {
                key: key.clone(),
                got: decoded.len(),
                expected: chunk_elements * usize::try_from(ELEMENT_SIZE).unwrap(),
            });
        }
        Ok(Some(bytemuck::pod_collect_to_vec(&decoded)))
    }
}

/// Iterate all indices of an array of `shape` in row-major order.
fn indices(shape: &[u64]) -> impl Iterator<Item = Vec<u64>> {
    let ranges: Vec<std::ops::Range<u64>> = shape.iter().map(|&extent| 0..extent).collect();
    ranges.into_iter().multi_cartesian_product()
}

/// Iterate the chunk indices overlapped by the region `[start, end)`.
fn overlapped_chunks(
    start: &[u64],
    end: &[u64],
    chunk_shape: &[u64],
) -> impl Iterator<Item = Vec<u64>> {
    let ranges: Vec<std::ops::Range<u64>> = (0..start.len())
        .map(|axis| (start[axis] / chunk_shape[axis])..(end[axis] - 1) / chunk_shape[axis] + 1)
        .collect();
    ranges.into_iter().multi_cartesian_product()
}

/// Visit the rows of the intersection between the selection `[start, end)`
/// and the chunk at `origin`, as `(source, destination, length)` element
/// offsets into the dense selection buffer and the chunk buffer.
fn copy_intersection(
    start: &[u64],
    end: &[u64],
    origin: &[u64],
    chunk_shape: &[u64],
    mut copy: impl FnMut(usize, usize, usize),
) {
    let dimensionality = start.len();
    let selection_shape: Vec<u64> = (0..dimensionality).map(|axis| end[axis] - start[axis]).collect();
    let inter_start: Vec<u64> = (0..dimensionality)
        .map(|axis| start[axis].max(origin[axis]))
        .collect();
    let inter_end: Vec<u64> = (0..dimensionality)
        .map(|axis| end[axis].min(origin[axis] + chunk_shape[axis]))
        .collect();
    let last = dimensionality - 1;
    let run = usize::try_from(inter_end[last] - inter_start[last]).unwrap();
    let ranges: Vec<std::ops::Range<u64>> = (0..last)
        .map(|axis| inter_start[axis]..inter_end[axis])
        .collect();
    // One-dimensional intersections are a single trailing run.
    let leading: Box<dyn Iterator<Item = Vec<u64>>> = if last == 0 {
        Box::new(std::iter::once(Vec::new()))
    } else {
        Box::new(ranges.into_iter().multi_cartesian_product())
    };
    for mut index in leading {
        index.push(inter_start[last]);
        let source: Vec<u64> = std::iter::zip(&index, start).map(|(&i, &s)| i - s).collect();
        let destination: Vec<u64> =
            std::iter::zip(&index, origin).map(|(&i, &o)| i - o).collect();
        copy(
            usize::try_from(linear_index(&selection_shape, &source)).unwrap(),
            usize::try_from(linear_index(chunk_shape, &destination)).unwrap(),
            run,
        );
    }
}
