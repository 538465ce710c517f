//! Dataset layout planning.
//!
//! Derives the global array shape and the dataset metadata document from a
//! run configuration. Planning is pure: the same configuration always plans
//! the same metadata, so every worker can plan independently and create the
//! dataset idempotently.

use crate::config::{RunConfig, RunConfigError};
use crate::dataset::{AllocTime, DataType, DatasetLayout, DatasetMetadata, FillTime};
use crate::filter::Filter;

/// The global 4D array shape: time steps by the process grid scaled by the
/// per-worker block.
#[must_use]
pub fn global_shape(config: &RunConfig) -> [u64; 4] {
    [
        config.time_steps,
        config.process_grid[0] * config.domain_block[0],
        config.process_grid[1] * config.domain_block[1],
        config.process_grid[2] * config.domain_block[2],
    ]
}

/// Plan the dataset metadata for a run.
///
/// A nonzero chunk shape selects a chunked layout with one time step per
/// chunk; otherwise the layout is contiguous. Subfiling always plans a
/// contiguous layout, ignoring any configured chunk shape. Compression maps
/// to the per-chunk filter chain, `never_fill` and `early_allocation` to the
/// fill and allocation policies.
///
/// # Errors
/// Returns a [`RunConfigError`] if compression is requested without a
/// chunked layout (subfiling included) or both compressors are requested.
pub fn plan_dataset(config: &RunConfig) -> Result<DatasetMetadata, RunConfigError> {
    if config.deflate.is_some() && config.lossy_bits.is_some() {
        return Err(RunConfigError::ConflictingCompression);
    }
    if (config.deflate.is_some() || config.lossy_bits.is_some()) && !config.chunked_layout() {
        return Err(RunConfigError::CompressionRequiresChunking);
    }
    let layout = if config.chunked_layout() {
        DatasetLayout::Chunked {
            chunk_shape: vec![
                1,
                config.chunk_shape[0],
                config.chunk_shape[1],
                config.chunk_shape[2],
            ],
        }
    } else {
        DatasetLayout::Contiguous
    };
    let mut filters = Vec::new();
    if let Some(bits) = config.lossy_bits {
        filters.push(Filter::BitRound { keep_bits: bits });
    }
    if let Some(level) = config.deflate {
        filters.push(Filter::Deflate { level });
    }
    Ok(DatasetMetadata {
        shape: global_shape(config).to_vec(),
        data_type: DataType::Float32,
        layout,
        fill_value: 0.0,
        fill_time: if config.never_fill {
            FillTime::Never
        } else {
            FillTime::OnAllocation
        },
        alloc_time: if config.early_allocation {
            AllocTime::Early
        } else {
            AllocTime::Incremental
        },
        filters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> RunConfig {
        RunConfig {
            process_grid: [2, 2, 2],
            domain_block: [10, 20, 30],
            time_steps: 5,
            ..RunConfig::default()
        }
    }

    #[test]
    fn global_shape_scales_the_grid() {
        assert_eq!(global_shape(&config()), [5, 20, 40, 60]);
    }

    #[test]
    fn contiguous_by_default() {
        let metadata = plan_dataset(&config()).unwrap();
        assert_eq!(metadata.layout, DatasetLayout::Contiguous);
        assert_eq!(metadata.shape, vec![5, 20, 40, 60]);
        assert_eq!(metadata.fill_time, FillTime::OnAllocation);
        assert_eq!(metadata.alloc_time, AllocTime::Incremental);
        assert!(metadata.filters.is_empty());
    }

    #[test]
    fn chunked_chunks_single_time_steps() {
        let config = RunConfig {
            chunk_shape: [5, 10, 15],
            ..config()
        };
        let metadata = plan_dataset(&config).unwrap();
        assert_eq!(
            metadata.layout,
            DatasetLayout::Chunked {
                chunk_shape: vec![1, 5, 10, 15]
            }
        );
    }

    #[test]
    fn policies_map_to_metadata() {
        let config = RunConfig {
            chunk_shape: [5, 10, 15],
            never_fill: true,
            early_allocation: true,
            deflate: Some(7),
            ..config()
        };
        let metadata = plan_dataset(&config).unwrap();
        assert_eq!(metadata.fill_time, FillTime::Never);
        assert_eq!(metadata.alloc_time, AllocTime::Early);
        assert_eq!(metadata.filters, vec![Filter::Deflate { level: 7 }]);
    }

    #[test]
    fn lossy_precedes_deflate_in_a_chain() {
        // Only one compressor is allowed today, but the chain ordering is
        // fixed: rounding must happen before entropy coding.
        let config = RunConfig {
            chunk_shape: [5, 10, 15],
            lossy_bits: Some(12),
            ..config()
        };
        let metadata = plan_dataset(&config).unwrap();
        assert_eq!(metadata.filters, vec![Filter::BitRound { keep_bits: 12 }]);
    }

    #[test]
    fn planning_is_idempotent() {
        let config = RunConfig {
            chunk_shape: [1, 20, 30],
            deflate: Some(3),
            ..config()
        };
        assert_eq!(plan_dataset(&config).unwrap(), plan_dataset(&config).unwrap());
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        assert!(matches!(
            plan_dataset(&RunConfig {
                deflate: Some(5),
                ..config()
            }),
            Err(RunConfigError::CompressionRequiresChunking)
        ));
        assert!(matches!(
            plan_dataset(&RunConfig {
                chunk_shape: [1, 1, 1],
                deflate: Some(5),
                lossy_bits: Some(5),
                ..config()
            }),
            Err(RunConfigError::ConflictingCompression)
        ));
        assert!(matches!(
            plan_dataset(&RunConfig {
                chunk_shape: [1, 1, 1],
                subfile: 2,
                deflate: Some(5),
                ..config()
            }),
            Err(RunConfigError::CompressionRequiresChunking)
        ));
    }

    #[test]
    fn subfiling_overrides_chunking() {
        let config = RunConfig {
            chunk_shape: [5, 10, 15],
            subfile: 2,
            ..config()
        };
        assert_eq!(plan_dataset(&config).unwrap().layout, DatasetLayout::Contiguous);
    }
}
