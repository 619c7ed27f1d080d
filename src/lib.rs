//! # kmeans-gpu - API documentation
//!
//! kmeans-gpu orchestrates yinyang k-means clustering over multiple accelerator devices.
//!
//! ## Design target
//! The crate is the host side of a multi-device k-means: it decides which devices take part,
//! replicates the inputs over them, produces the initial centroids, drives the refinement and
//! delivers the results back to the caller. The actual number crunching sits behind the
//! [`Kernels`] trait, the device primitives (allocation, copies, peer access, streams) behind the
//! [`Runtime`] trait. [`HostRuntime`] and [`HostKernels`] implement both on the host, so the full
//! pipeline runs without any accelerator.
//!
//! ## Supported centroid initializations
//! - [`InitMethod::Import`]: caller-provided centroids
//! - [`InitMethod::Random`]: `k` distinct random samples
//! - [`InitMethod::PlusPlus`]: k-means++
//!
//! ## Data placement
//! Inputs and outputs either live in host memory ([`KMeansData::Host`]), or already reside on one
//! designated device ([`KMeansData::Device`]). In the latter case, the designated device's buffers
//! are used in place and never round-trip through the host.
//!
//! ## Example
//! ```rust
//! use kmeans_gpu::*;
//!
//! fn main() {
//!     let (samples_size, features_size, k) = (2000u32, 16u16, 8u32);
//!
//!     // Generate some random data
//!     let samples: Vec<f32> = (0..samples_size as usize * features_size as usize)
//!         .map(|i| ((i * 2654435761) % 10007) as f32 / 10007.0)
//!         .collect();
//!     let mut centroids = vec![0.0f32; k as usize * features_size as usize];
//!     let mut assignments = vec![0u32; samples_size as usize];
//!
//!     // Two simulated devices, k-means++ initialization
//!     let runtime = HostRuntime::new(2);
//!     let kernels = HostKernels::new();
//!     let conf = KMeansConfig::build()
//!         .init(InitMethod::PlusPlus)
//!         .tolerance(0.01)
//!         .yinyang_t(0.1)
//!         .seed(1337)
//!         .build();
//!     let result = KMeans::new(&runtime, &kernels).kmeans_yinyang(
//!         samples_size, features_size, k,
//!         KMeansData::host(&samples, &mut centroids, &mut assignments), &conf);
//!
//!     assert_eq!(ResultCode::of(&result), ResultCode::Success);
//!     println!("Centroids: {:?}", centroids);
//!     println!("Cluster-Assignments: {:?}", assignments);
//! }
//! ```
//!
//! ## Short API-Overview / Description
//! Entry-point of the library is the [`KMeans`] struct, which binds a [`Runtime`] and a [`Kernels`]
//! implementation. [`KMeans::kmeans_yinyang`] runs one complete calculation, configured by a
//! [`KMeansConfig`]. Calls do not mutate the [`KMeans`] instance, every run allocates (and frees)
//! its own device buffers.
//!
//! All failures are reported as [`KMeansError`]; callers that only need a flat status can map any
//! result to a [`ResultCode`].

#[macro_use] mod helpers;
mod error;
mod runtime;
mod devices;
mod memory;
mod distances;
mod convergence;
mod kernels;
mod validation;
mod inits;
mod variants;
mod results;
mod api;

pub use api::{DistanceMetric, InitMethod, KMeans, KMeansConfig, KMeansConfigBuilder, KMeansData, Problem};
pub use convergence::{reassignments_threshold, Convergence};
pub use devices::DevicePool;
pub use distances::{CosineDistance, DistanceFunction, EuclideanDistance};
pub use error::{KMeansError, Result, ResultCode};
pub use kernels::{HostKernels, Kernels, RefineBuffers};
pub use memory::{DeviceSlot, DistributedBuffer, Origin};
pub use runtime::{ComputeCapability, DeviceError, DeviceId, DevicePtr, DeviceRepr, HostRuntime, MemoryInfo, Runtime};
pub use variants::{YinyangBuffers, YinyangSizes};
