//! Run configuration.
//!
//! A [`RunConfig`] is the validated, immutable description of one benchmark
//! run. It is parsed from a line-oriented `key value ...` script (terminated
//! by `DONE`) on one worker and broadcast to the rest, so every worker acts
//! on byte-identical parameters.

use std::io::BufRead;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use seismio_transport::{Communicator, TransportError};

/// How writes are issued relative to the other workers.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferMode {
    /// Each worker writes on its own schedule.
    #[default]
    Independent,
    /// All workers rendezvous before each write so transfers overlap.
    Collective,
}

/// Who creates the container and when.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreCreateMode {
    /// No creation phase: each worker ensures the dataset exists on first
    /// touch, without truncation or rendezvous.
    Off,
    /// All workers participate in creation before any data is written.
    #[default]
    CollectiveCreate,
    /// One leader creates and closes the container; everyone reopens it.
    LeaderThenReopen,
}

/// The validated description of a benchmark run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// The run name recorded in the output's attributes.
    pub name: String,
    /// The process grid: workers per axis.
    pub process_grid: [u64; 3],
    /// The extent of each worker's block per spatial axis.
    pub domain_block: [u64; 3],
    /// The chunk extent per spatial axis; `[0, 0, 0]` selects a contiguous
    /// layout.
    pub chunk_shape: [u64; 3],
    /// The number of time steps.
    pub time_steps: u64,
    /// The transfer discipline.
    pub transfer: TransferMode,
    /// The container-creation policy.
    pub precreate: PreCreateMode,
    /// Whether metadata operations are issued collectively.
    pub set_collective_metadata: bool,
    /// Whether the full extent is reserved before the first write.
    pub early_allocation: bool,
    /// Whether fill-value materialization is suppressed.
    pub never_fill: bool,
    /// Lossless compression level, if any (1-9).
    pub deflate: Option<u32>,
    /// Lossy mantissa bits kept, if any (0-23).
    pub lossy_bits: Option<u32>,
    /// The number of subfile groups; `0` writes one shared container.
    pub subfile: u64,
    /// The number of physical nodes, if known; `0` when unknown. Shapes the
    /// subfile group assignment so groups do not straddle nodes needlessly.
    pub n_nodes: u64,
    /// The fill-function library recorded for provenance; resolution is by
    /// name only.
    pub fill_library: Option<String>,
    /// The fill function resolved from the registry; the default fill is
    /// each worker's id.
    pub fill_function: Option<String>,
    /// Arguments passed to the fill function.
    pub fill_args: Vec<String>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            name: "seism-test".to_string(),
            process_grid: [1, 1, 1],
            domain_block: [1, 1, 1],
            chunk_shape: [0, 0, 0],
            time_steps: 1,
            transfer: TransferMode::default(),
            precreate: PreCreateMode::default(),
            set_collective_metadata: false,
            early_allocation: false,
            never_fill: false,
            deflate: None,
            lossy_bits: None,
            subfile: 0,
            n_nodes: 0,
            fill_library: None,
            fill_function: None,
            fill_args: Vec::new(),
        }
    }
}

/// A configuration error.
#[derive(Debug, Error)]
pub enum RunConfigError {
    /// An IO error while reading the script.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A script missing its `DONE` terminator.
    #[error("script ended without DONE")]
    UnterminatedScript,
    /// A key with missing or unparseable values.
    #[error("invalid value for {key}: {values:?}")]
    InvalidValue {
        /// The script key.
        key: String,
        /// The offending values.
        values: Vec<String>,
    },
    /// A required key absent from the script.
    #[error("missing required key: {0}")]
    MissingKey(&'static str),
    /// A zero extent on a required dimension.
    #[error("{0} extents must be nonzero")]
    ZeroExtent(&'static str),
    /// A process grid that does not match the worker count.
    #[error("process grid {process_grid:?} has {cells} cells but there are {workers} workers")]
    GridMismatch {
        /// The process grid.
        process_grid: [u64; 3],
        /// The grid cell count.
        cells: u64,
        /// The worker count.
        workers: u64,
    },
    /// A deflate level outside 1-9.
    #[error("deflate level {0} is not in 1..=9")]
    InvalidDeflateLevel(u32),
    /// A lossy bit count outside 0-23.
    #[error("lossy bit count {0} is not in 0..=23")]
    InvalidLossyBits(u32),
    /// Both compressors requested at once.
    #[error("deflate and lossy compression are mutually exclusive")]
    ConflictingCompression,
    /// Compression without a chunked layout. Subfiled runs are never
    /// chunked, so this also covers compression combined with subfiling.
    #[error("compression requires a chunked layout")]
    CompressionRequiresChunking,
    /// A chunk extent incompatible with the domain block.
    #[error("chunk shape {chunk_shape:?} has a zero extent")]
    InvalidChunkShape {
        /// The chunk shape.
        chunk_shape: [u64; 3],
    },
}

/// An error distributing the configuration to all workers.
#[derive(Debug, Error)]
pub enum ConfigBroadcastError {
    /// A transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The root worker holds no configuration to distribute.
    #[error("broadcast root has no configuration")]
    MissingAtRoot,
    /// An unencodable or unparseable configuration document.
    #[error("invalid configuration document: {0}")]
    InvalidDocument(#[from] serde_json::Error),
}

impl RunConfig {
    /// Parse a configuration script.
    ///
    /// The script is a sequence of whitespace-separated `key value ...`
    /// lines ending with `DONE`. `#` starts a comment, unrecognized keys are
    /// skipped, and boolean keys take an optional `true`/`false` argument,
    /// defaulting to `true` when bare.
    ///
    /// # Errors
    /// Returns a [`RunConfigError`] for malformed values or a script without
    /// `DONE`. The result is unvalidated; call [`RunConfig::validate`]
    /// against the worker count before use.
    pub fn from_script(reader: impl BufRead) -> Result<Self, RunConfigError> {
        let mut config = Self::default();
        let mut saw_processor = false;
        let mut saw_domain = false;
        let mut saw_time = false;
        for line in reader.lines() {
            let line = line?;
            let line = line.split('#').next().unwrap_or("");
            let mut tokens = line.split_whitespace();
            let Some(key) = tokens.next() else {
                continue;
            };
            let values: Vec<String> = tokens.map(str::to_string).collect();
            match key {
                "DONE" => {
                    if !saw_processor {
                        return Err(RunConfigError::MissingKey("processor"));
                    }
                    if !saw_domain {
                        return Err(RunConfigError::MissingKey("domain"));
                    }
                    if !saw_time {
                        return Err(RunConfigError::MissingKey("time"));
                    }
                    return Ok(config);
                }
                "name" => {
                    config.name = single(key, &values)?;
                }
                "processor" => {
                    config.process_grid = triple(key, &values)?;
                    saw_processor = true;
                }
                "domain" => {
                    config.domain_block = triple(key, &values)?;
                    saw_domain = true;
                }
                "chunk" => {
                    config.chunk_shape = triple(key, &values)?;
                }
                "time" => {
                    config.time_steps = scalar(key, &values)?;
                    saw_time = true;
                }
                "collective_write" => {
                    config.transfer = if boolean(key, &values)? {
                        TransferMode::Collective
                    } else {
                        TransferMode::Independent
                    };
                }
                "precreate" => {
                    config.precreate = if boolean(key, &values)? {
                        PreCreateMode::LeaderThenReopen
                    } else {
                        PreCreateMode::CollectiveCreate
                    };
                }
                "set_collective_metadata" => {
                    config.set_collective_metadata = boolean(key, &values)?;
                }
                "early_allocation" => {
                    config.early_allocation = boolean(key, &values)?;
                }
                "never_fill" => {
                    config.never_fill = boolean(key, &values)?;
                }
                "deflate" => {
                    // Level zero disables the filter.
                    let level: u32 = scalar(key, &values)?;
                    config.deflate = (level > 0).then_some(level);
                }
                "lossy" => {
                    config.lossy_bits = Some(scalar(key, &values)?);
                }
                "subfile" => {
                    config.subfile = scalar(key, &values)?;
                }
                "n_nodes" => {
                    config.n_nodes = scalar(key, &values)?;
                }
                "use_function_lib" => {
                    config.fill_library = Some(single(key, &values)?);
                }
                "use_function_name" => {
                    config.fill_function = Some(single(key, &values)?);
                }
                // The argument count is implied by the argument list.
                "use_function_argc" => {
                    let _: u64 = scalar(key, &values)?;
                }
                "use_function_argv" => {
                    config.fill_args = values;
                }
                // Unrecognized keys are skipped, not rejected.
                _ => {}
            }
        }
        Err(RunConfigError::UnterminatedScript)
    }

    /// True if a chunk shape was configured.
    #[must_use]
    pub fn is_chunked(&self) -> bool {
        self.chunk_shape != [0, 0, 0]
    }

    /// True if the planned layout is actually chunked: subfiling always
    /// plans a contiguous layout, overriding any configured chunk shape.
    #[must_use]
    pub fn chunked_layout(&self) -> bool {
        self.is_chunked() && self.subfile == 0
    }

    /// The number of workers the process grid calls for.
    #[must_use]
    pub fn worker_count(&self) -> u64 {
        self.process_grid.iter().product()
    }

    /// Validate the configuration against the actual worker count.
    ///
    /// # Errors
    /// Returns a [`RunConfigError`] if extents are zero, the grid does not
    /// match `workers`, compression parameters are out of range, or mutually
    /// exclusive options are combined.
    pub fn validate(&self, workers: u64) -> Result<(), RunConfigError> {
        if self.process_grid.contains(&0) {
            return Err(RunConfigError::ZeroExtent("processor"));
        }
        if self.domain_block.contains(&0) {
            return Err(RunConfigError::ZeroExtent("domain"));
        }
        if self.time_steps == 0 {
            return Err(RunConfigError::ZeroExtent("time"));
        }
        if self.worker_count() != workers {
            return Err(RunConfigError::GridMismatch {
                process_grid: self.process_grid,
                cells: self.worker_count(),
                workers,
            });
        }
        if self.is_chunked() && self.chunk_shape.contains(&0) {
            return Err(RunConfigError::InvalidChunkShape {
                chunk_shape: self.chunk_shape,
            });
        }
        if let Some(level) = self.deflate {
            if !(1..=9).contains(&level) {
                return Err(RunConfigError::InvalidDeflateLevel(level));
            }
        }
        if let Some(bits) = self.lossy_bits {
            if bits > 23 {
                return Err(RunConfigError::InvalidLossyBits(bits));
            }
        }
        if self.deflate.is_some() && self.lossy_bits.is_some() {
            return Err(RunConfigError::ConflictingCompression);
        }
        if (self.deflate.is_some() || self.lossy_bits.is_some()) && !self.chunked_layout() {
            return Err(RunConfigError::CompressionRequiresChunking);
        }
        Ok(())
    }

    /// Distribute the configuration from `root` to every worker.
    ///
    /// `config` must be `Some` on the root and is ignored elsewhere. Every
    /// worker returns the root's configuration.
    ///
    /// # Errors
    /// Returns a [`ConfigBroadcastError`] if the root holds no
    /// configuration or the transport fails.
    pub fn broadcast(
        communicator: &dyn Communicator,
        root: usize,
        config: Option<Self>,
    ) -> Result<Self, ConfigBroadcastError> {
        let mut document = if communicator.rank() == root {
            let config = config.ok_or(ConfigBroadcastError::MissingAtRoot)?;
            serde_json::to_vec(&config)?
        } else {
            Vec::new()
        };
        communicator.broadcast(root, &mut document)?;
        Ok(serde_json::from_slice(&document)?)
    }
}

fn parse<T: std::str::FromStr>(
    key: &str,
    values: &[String],
    index: usize,
) -> Result<T, RunConfigError> {
    values
        .get(index)
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| RunConfigError::InvalidValue {
            key: key.to_string(),
            values: values.to_vec(),
        })
}

fn scalar<T: std::str::FromStr>(key: &str, values: &[String]) -> Result<T, RunConfigError> {
    parse(key, values, 0)
}

fn single(key: &str, values: &[String]) -> Result<String, RunConfigError> {
    parse(key, values, 0)
}

fn triple(key: &str, values: &[String]) -> Result<[u64; 3], RunConfigError> {
    Ok([parse(key, values, 0)?, parse(key, values, 1)?, parse(key, values, 2)?])
}

fn boolean(key: &str, values: &[String]) -> Result<bool, RunConfigError> {
    if values.is_empty() {
        Ok(true)
    } else {
        parse(key, values, 0)
    }
}
