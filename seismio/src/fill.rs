//! Synthetic-data fill functions.
//!
//! Each worker fills its block through a [`FillFunction`] resolved by name
//! from a [`FillRegistry`]. The default fill writes the worker's own id into
//! every element, which is what the verifier checks against; the built-in
//! alternatives generate a gaussian bump over the global domain or replay
//! samples from a reference file.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use thiserror::Error;

use crate::config::RunConfig;

/// A fill error.
#[derive(Debug, Error)]
pub enum FillError {
    /// A fill function name with no registration.
    #[error("unknown fill function: {0}")]
    UnknownFunction(String),
    /// An argument list the function cannot use.
    #[error("invalid argument for fill function {function}: {message}")]
    InvalidArgument {
        /// The fill function name.
        function: &'static str,
        /// What was wrong.
        message: String,
    },
    /// An IO error reading a reference file.
    #[error(transparent)]
    IOError(#[from] std::io::Error),
    /// A reference file holding no complete samples.
    #[error("reference file {0} holds no complete f32 samples")]
    EmptyReference(String),
}

/// Where a block sits within the run, passed to every fill call.
#[derive(Clone, Debug)]
pub struct FillContext {
    /// The filling worker's id.
    pub worker_id: u64,
    /// The block's offset in the global array (time axis first).
    pub block_start: [u64; 4],
    /// The block's extent (time axis first).
    pub block_shape: [u64; 4],
    /// The global array shape (time axis first).
    pub global_shape: [u64; 4],
}

/// A synthetic-data generator.
pub trait FillFunction: Send + Sync {
    /// Fill `block`, the dense row-major contents of the region described by
    /// `context`.
    ///
    /// # Errors
    /// Returns a [`FillError`] if the block cannot be generated.
    fn fill(&self, context: &FillContext, block: &mut [f32]) -> Result<(), FillError>;
}

/// The default fill: every element is the worker's id.
#[derive(Debug, Default)]
pub struct WorkerIdFill;

impl FillFunction for WorkerIdFill {
    fn fill(&self, context: &FillContext, block: &mut [f32]) -> Result<(), FillError> {
        block.fill(context.worker_id as f32);
        Ok(())
    }
}

/// A gaussian bump centered in the global spatial domain.
///
/// Arguments: amplitude (default 1) and the standard deviation as a fraction
/// of the spatial extent (default 0.2).
#[derive(Debug)]
pub struct GaussianFill {
    amplitude: f32,
    sigma: f32,
}

impl GaussianFill {
    /// Construct from the script argument list.
    ///
    /// # Errors
    /// Returns [`FillError::InvalidArgument`] for unparseable or
    /// non-positive parameters.
    pub fn from_args(args: &[String]) -> Result<Self, FillError> {
        let parse = |index: usize, default: f32| -> Result<f32, FillError> {
            args.get(index).map_or(Ok(default), |value| {
                value.parse().map_err(|_| FillError::InvalidArgument {
                    function: "gaussian",
                    message: format!("expected a number, got {value}"),
                })
            })
        };
        let amplitude = parse(0, 1.0)?;
        let sigma = parse(1, 0.2)?;
        if sigma <= 0.0 {
            return Err(FillError::InvalidArgument {
                function: "gaussian",
                message: format!("sigma must be positive, got {sigma}"),
            });
        }
        Ok(Self { amplitude, sigma })
    }
}

impl FillFunction for GaussianFill {
    fn fill(&self, context: &FillContext, block: &mut [f32]) -> Result<(), FillError> {
        let [_, bi, bj, bk] = context.block_shape;
        let mut element = 0;
        for i in 0..bi {
            for j in 0..bj {
                for k in 0..bk {
                    let position = [
                        context.block_start[1] + i,
                        context.block_start[2] + j,
                        context.block_start[3] + k,
                    ];
                    // Squared distance from the domain center in coordinates
                    // normalized to the unit cube.
                    let distance2: f32 = (0..3)
                        .map(|axis| {
                            let extent = context.global_shape[axis + 1] as f32;
                            let centered = (position[axis] as f32 + 0.5) / extent - 0.5;
                            centered * centered
                        })
                        .sum();
                    block[element] =
                        self.amplitude * (-distance2 / (2.0 * self.sigma * self.sigma)).exp();
                    element += 1;
                }
            }
        }
        Ok(())
    }
}

/// Replays `f32` samples from a reference file, indexed by local block
/// position. A reference shorter than the block wraps around.
#[derive(Debug)]
pub struct ReplayFill {
    samples: Vec<f32>,
}

impl ReplayFill {
    /// Load the reference file named by the first argument.
    ///
    /// # Errors
    /// Returns a [`FillError`] if the path is missing, unreadable, or holds
    /// no complete samples.
    pub fn from_args(args: &[String]) -> Result<Self, FillError> {
        let path = args.first().ok_or(FillError::InvalidArgument {
            function: "replay",
            message: "expected a reference file path".to_string(),
        })?;
        let mut bytes = Vec::new();
        std::fs::File::open(path)?.read_to_end(&mut bytes)?;
        bytes.truncate(bytes.len() - bytes.len() % size_of::<f32>());
        if bytes.is_empty() {
            return Err(FillError::EmptyReference(path.clone()));
        }
        Ok(Self {
            samples: bytemuck::pod_collect_to_vec(&bytes),
        })
    }
}

impl FillFunction for ReplayFill {
    fn fill(&self, _context: &FillContext, block: &mut [f32]) -> Result<(), FillError> {
        for (element, value) in block.iter_mut().enumerate() {
            *value = self.samples[element % self.samples.len()];
        }
        Ok(())
    }
}

type FillFactory =
    Box<dyn Fn(&[String]) -> Result<Arc<dyn FillFunction>, FillError> + Send + Sync>;

/// A registry of fill functions resolvable by name.
pub struct FillRegistry {
    factories: HashMap<String, FillFactory>,
}

impl FillRegistry {
    /// A registry holding the built-in functions `gaussian` and `replay`.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("gaussian", |args| {
            Ok(Arc::new(GaussianFill::from_args(args)?))
        });
        registry.register("replay", |args| Ok(Arc::new(ReplayFill::from_args(args)?)));
        registry
    }

    /// Register (or replace) the factory for `name`.
    pub fn register(
        &mut self,
        name: &str,
        factory: impl Fn(&[String]) -> Result<Arc<dyn FillFunction>, FillError> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Resolve the fill function a configuration calls for.
    ///
    /// A configuration naming no function gets [`WorkerIdFill`].
    ///
    /// # Errors
    /// Returns a [`FillError`] if the named function is unregistered or
    /// rejects its arguments.
    pub fn resolve(&self, config: &RunConfig) -> Result<Arc<dyn FillFunction>, FillError> {
        let Some(name) = &config.fill_function else {
            return Ok(Arc::new(WorkerIdFill));
        };
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| FillError::UnknownFunction(name.clone()))?;
        factory(&config.fill_args)
    }
}
