use crate::distances::{CosineDistance, DistanceFunction, EuclideanDistance};
use crate::error::Result;
use crate::kernels::Kernels;
use crate::memory::Origin;
use crate::runtime::{DeviceId, DevicePtr, Runtime};

/// Method used to produce the initial centroids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitMethod {
    /// Use the centroids passed in by the caller as they are.
    Import,
    /// Random sample initialization (a.k.a. Forgy)
    ///
    /// Picks `k` distinct samples, drawn from a uniform shuffle of all sample indices, as initial centroids.
    Random,
    /// K-Means++ initialization
    ///
    /// Starts with one uniformly drawn sample as first centroid. Each following centroid is drawn with a
    /// probability proportional to a sample's (squared) distance to its nearest already chosen centroid,
    /// which leads to a tendency of selecting centroids far away from the existing ones.
    PlusPlus,
}

/// Distance metric used by the kernels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    /// Squared euclidean distance
    L2,
    /// Angular distance between (normalized) samples
    Cosine,
}
impl DistanceMetric {
    pub fn function(&self) -> &'static dyn DistanceFunction {
        match self {
            DistanceMetric::L2 => &EuclideanDistance,
            DistanceMetric::Cosine => &CosineDistance,
        }
    }
}

/// Dimensions and options of one run, as handed to the [`Kernels`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Problem {
    pub samples_size: u32,
    pub features_size: u16,
    pub clusters_size: u32,
    /// Amount of yinyang centroid groups, `0` disables grouping.
    pub yinyang_groups: u32,
    pub metric: DistanceMetric,
    pub fp16x2: bool,
    pub verbosity: i32,
}
impl Problem {
    /// Amount of `f32` values in the sample matrix.
    pub fn samples_len(&self) -> usize {
        self.samples_size as usize * self.features_size as usize
    }
    /// Amount of `f32` values in the centroid matrix.
    pub fn centroids_len(&self) -> usize {
        self.clusters_size as usize * self.features_size as usize
    }
}

/// Configuration options of a k-means run, such as the initialization method, the convergence
/// tolerance or the devices to use.
///
/// For a more detailed information about all possible options, have a look at [`KMeansConfigBuilder`].
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    pub(crate) init: InitMethod,
    pub(crate) tolerance: f32,
    pub(crate) yinyang_t: f32,
    pub(crate) metric: DistanceMetric,
    pub(crate) seed: u64,
    pub(crate) device_mask: u32,
    pub(crate) fp16x2: bool,
    pub(crate) verbosity: i32,
}
impl Default for KMeansConfig {
    fn default() -> Self {
        Self {
            init: InitMethod::PlusPlus,
            tolerance: 0.01,
            yinyang_t: 0.1,
            metric: DistanceMetric::L2,
            seed: 0,
            device_mask: 0,
            fp16x2: false,
            verbosity: 0,
        }
    }
}
impl KMeansConfig {
    /// Use the [`KMeansConfigBuilder`] to build a [`KMeansConfig`] instance.
    pub fn build() -> KMeansConfigBuilder {
        KMeansConfigBuilder { config: KMeansConfig::default() }
    }
}

pub struct KMeansConfigBuilder {
    config: KMeansConfig,
}
impl KMeansConfigBuilder {
    /// Set the centroid initialization method.
    /// ## Default
    /// [`InitMethod::PlusPlus`]
    pub fn init(mut self, init: InitMethod) -> Self {
        self.config.init = init; self
    }
    /// Set the fraction of samples which may still change their cluster in the last iteration, for
    /// the calculation to count as converged. Has to be within `[0, 1]`.
    /// ## Default
    /// `0.01`
    pub fn tolerance(mut self, tolerance: f32) -> Self {
        self.config.tolerance = tolerance; self
    }
    /// Set the fraction of `k` that is used as amount of yinyang centroid groups. Has to be within `[0, 0.5]`,
    /// `0` disables yinyang grouping.
    /// ## Default
    /// `0.1`
    pub fn yinyang_t(mut self, yinyang_t: f32) -> Self {
        self.config.yinyang_t = yinyang_t; self
    }
    pub fn metric(mut self, metric: DistanceMetric) -> Self {
        self.config.metric = metric; self
    }
    /// Set the seed of the random number generator used during initialization.
    /// Runs with the same seed (and inputs) produce the same results.
    pub fn seed(mut self, seed: u64) -> Self {
        self.config.seed = seed; self
    }
    /// Set the bitmask of devices to use. Bit `i` selects device `i`, `0` selects all installed devices.
    pub fn device_mask(mut self, device_mask: u32) -> Self {
        self.config.device_mask = device_mask; self
    }
    /// Request packed half-precision computations. Only supported on devices of architecture 6.0 or newer.
    pub fn fp16x2(mut self, fp16x2: bool) -> Self {
        self.config.fp16x2 = fp16x2; self
    }
    /// Set the verbosity. Values above `1` enable memory statistics, values above `2` pointer dumps.
    pub fn verbosity(mut self, verbosity: i32) -> Self {
        self.config.verbosity = verbosity; self
    }
    /// Return the internally built configuration structure.
    pub fn build(self) -> KMeansConfig { self.config }
}

/// The caller's input and output buffers.
pub enum KMeansData<'a> {
    /// Buffers in host memory.
    /// - **samples**: `samples_size * features_size` values [row-major] = [<sample0>,<sample1>,...]
    /// - **centroids**: `clusters_size * features_size` values; read for [`InitMethod::Import`], always written
    /// - **assignments**: `samples_size` values, written
    Host { samples: &'a [f32], centroids: &'a mut [f32], assignments: &'a mut [u32] },
    /// Buffers that already live in the memory of `device` (zero-copy mode). Same layout as [`KMeansData::Host`].
    Device { device: DeviceId, samples: DevicePtr<f32>, centroids: DevicePtr<f32>, assignments: DevicePtr<u32> },
}
impl<'a> KMeansData<'a> {
    pub fn host(samples: &'a [f32], centroids: &'a mut [f32], assignments: &'a mut [u32]) -> Self {
        KMeansData::Host { samples, centroids, assignments }
    }

    pub fn device(device: DeviceId, samples: DevicePtr<f32>, centroids: DevicePtr<f32>, assignments: DevicePtr<u32>) -> Self {
        KMeansData::Device { device, samples, centroids, assignments }
    }

    /// The device the caller's buffers live on, if any.
    pub fn designated_device(&self) -> Option<DeviceId> {
        match self {
            KMeansData::Host { .. } => None,
            KMeansData::Device { device, .. } => Some(*device),
        }
    }

    pub(crate) fn samples_origin(&self) -> Origin<'_, f32> {
        match self {
            KMeansData::Host { samples, .. } => Origin::Host(samples),
            KMeansData::Device { device, samples, .. } => Origin::Device { device: *device, ptr: *samples },
        }
    }

    pub(crate) fn centroids_origin(&self) -> Origin<'_, f32> {
        match self {
            KMeansData::Host { centroids, .. } => Origin::Host(centroids),
            KMeansData::Device { device, centroids, .. } => Origin::Device { device: *device, ptr: *centroids },
        }
    }
}

/// Entrypoint of this crate's API-Surface.
///
/// Binds the accelerator [`Runtime`] and the [`Kernels`] implementation that a k-means run should use.
/// The struct itself holds no state, so it can be reused for any amount of runs.
pub struct KMeans<'r, R: Runtime, K: Kernels> {
    pub(crate) runtime: &'r R,
    pub(crate) kernels: &'r K,
}
impl<'r, R: Runtime, K: Kernels> KMeans<'r, R, K> {
    pub fn new(runtime: &'r R, kernels: &'r K) -> Self {
        Self { runtime, kernels }
    }

    /// Yinyang k-means over all devices selected by the configuration.
    ///
    /// ## Arguments
    /// - **samples_size**: Amount of samples
    /// - **features_size**: Amount of dimensions each sample has
    /// - **clusters_size**: Amount of clusters to search for (`k`)
    /// - **data**: Input / output buffers, either in host memory or on one (designated) device
    /// - **config**: [`KMeansConfig`] instance, containing several configuration options for the calculation.
    ///
    /// ## Returns
    /// `Ok(())` once the final centroids and assignments have been written to **data**.
    ///
    /// ## Example
    /// ```rust
    /// use kmeans_gpu::*;
    ///
    /// let (samples_size, features_size, k) = (1000u32, 8u16, 5u32);
    /// let samples: Vec<f32> = (0..samples_size as usize * features_size as usize)
    ///     .map(|i| ((i * 7919) % 1000) as f32 / 1000.0)
    ///     .collect();
    /// let mut centroids = vec![0.0f32; k as usize * features_size as usize];
    /// let mut assignments = vec![0u32; samples_size as usize];
    ///
    /// let runtime = HostRuntime::new(2);
    /// let kernels = HostKernels::new();
    /// let conf = KMeansConfig::build().init(InitMethod::PlusPlus).tolerance(0.01).seed(3).build();
    /// KMeans::new(&runtime, &kernels)
    ///     .kmeans_yinyang(samples_size, features_size, k,
    ///         KMeansData::host(&samples, &mut centroids, &mut assignments), &conf)
    ///     .unwrap();
    /// assert!(assignments.iter().all(|&a| a < k));
    /// ```
    pub fn kmeans_yinyang(
        &self, samples_size: u32, features_size: u16, clusters_size: u32, data: KMeansData<'_>, config: &KMeansConfig,
    ) -> Result<()> {
        crate::variants::yinyang::calculate(self, samples_size, features_size, clusters_size, data, config)
    }
}
