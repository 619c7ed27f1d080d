use super::{Kernels, RefineBuffers};
use crate::api::{DistanceMetric, Problem};
use crate::convergence::{reassignments_threshold, Convergence};
use crate::devices::{select_failed, DevicePool};
use crate::distances::{nearest, DistanceFunction};
use crate::error::{KMeansError, Result};
use crate::helpers::partition;
use crate::memory::DistributedBuffer;
use crate::runtime::{DeviceError, DeviceId, DevicePtr, DeviceRepr, Runtime};
use rayon::prelude::*;
use std::cell::RefCell;
use tracing::{debug, trace, warn};

const DEFAULT_MAX_ITERATIONS: usize = 1000;

/// [`Kernels`] that stage every device's partition to host memory and compute it with rayon.
///
/// The results are written back into the device buffers, exactly where device-resident kernels would
/// leave them. Computations always use `f32`, a requested fp16x2 mode only changes the storage
/// precision a device implementation would use.
pub struct HostKernels {
	convergence: Convergence,
	problem: RefCell<Option<Problem>>,
}

impl Default for HostKernels {
	fn default() -> Self {
		Self::new()
	}
}

impl HostKernels {
	/// Kernels that refine until the reassignment threshold is met, but at most for 1000 iterations.
	pub fn new() -> Self {
		Self::with_convergence(Convergence::ToleranceOrIterations { max_iterations: DEFAULT_MAX_ITERATIONS })
	}

	pub fn with_convergence(convergence: Convergence) -> Self {
		Self { convergence, problem: RefCell::new(None) }
	}

	fn check_setup(&self, problem: &Problem) -> Result<()> {
		match *self.problem.borrow() {
			Some(ref p) if p == problem => Ok(()),
			Some(_) => Err(KMeansError::runtime("kernels have been set up for a different problem")),
			None => Err(KMeansError::runtime("kernels have not been set up")),
		}
	}
}

impl Kernels for HostKernels {
	fn setup<R: Runtime>(&self, runtime: &R, problem: &Problem, pool: &DevicePool) -> Result<()> {
		if pool.is_empty() {
			return Err(KMeansError::runtime("kernel setup without devices"));
		}
		pool.for_each(runtime, |_, dev| {
			trace!("device #{}: kernel constants {:?}", dev, problem);
			Ok(())
		})?;
		if problem.fp16x2 {
			debug!("fp16x2 requested, host kernels compute in f32");
		}
		*self.problem.borrow_mut() = Some(*problem);
		Ok(())
	}

	fn plus_plus_step<R: Runtime>(
		&self, runtime: &R, problem: &Problem, centroids_so_far: u32, pool: &DevicePool,
		samples: &DistributedBuffer<'_, R, f32>, centroids: &DistributedBuffer<'_, R, f32>,
		dists: &mut DistributedBuffer<'_, R, f32>, sums: &mut DistributedBuffer<'_, R, f32>, host_dists: &mut [f32],
	) -> Result<f32> {
		self.check_setup(problem)?;
		let (n, f) = (problem.samples_size as usize, problem.features_size as usize);
		if centroids_so_far == 0 || centroids_so_far > problem.clusters_size {
			return Err(KMeansError::runtime(format!("k-means++ step with {} centroids", centroids_so_far)));
		}
		if host_dists.len() != n {
			return Err(KMeansError::runtime("host distance buffer does not match the amount of samples"));
		}
		let dist = problem.metric.function();
		let mut total = 0.0f64;
		for devi in 0..pool.len() {
			let dev = pool.get(devi);
			let (offset, length) = partition(n, devi, pool.len());
			if length == 0 {
				continue;
			}
			let part = fetch(runtime, dev, samples.ptr(devi).offset(offset * f), length * f)?;
			let chosen = fetch(runtime, dev, centroids.ptr(devi), centroids_so_far as usize * f)?;
			let local: Vec<f32> = part.par_chunks_exact(f).map(|s| nearest(s, &chosen, dist).1).collect();
			let partial: f32 = local.iter().sum();
			store(runtime, dev, dists.ptr(devi).offset(offset), &local)?;
			store(runtime, dev, sums.ptr(devi), &[partial])?;
			host_dists[offset..offset + length].copy_from_slice(&local);
			total += partial as f64;
		}
		Ok(total as f32)
	}

	fn yinyang<R: Runtime>(
		&self, runtime: &R, problem: &Problem, tolerance: f32, pool: &DevicePool, mut buffers: RefineBuffers<'_, '_, R>,
	) -> Result<()> {
		self.check_setup(problem)?;
		let (n, f, k) = (problem.samples_size as usize, problem.features_size as usize, problem.clusters_size as usize);
		let groups = problem.yinyang_groups as usize;
		let dist = problem.metric.function();
		let threshold = reassignments_threshold(tolerance, problem.samples_size);
		let mut logic = self.convergence.create_logic(threshold);

		let mut partitions = Vec::with_capacity(pool.len());
		for devi in 0..pool.len() {
			let (offset, length) = partition(n, devi, pool.len());
			partitions.push(fetch(runtime, pool.get(devi), buffers.samples.ptr(devi).offset(offset * f), length * f)?);
		}
		let canonical = pool.len() - 1;
		let mut centroids = fetch(runtime, pool.get(canonical), buffers.centroids.ptr(canonical), k * f)?;

		let groups_of: Vec<u32> = (0..k).map(|c| (c as u64 * groups as u64 / k as u64) as u32).collect();
		if let Some(yy) = buffers.yinyang.as_deref_mut() {
			broadcast(runtime, pool, &yy.group_assignments, &groups_of)?;
			// group centroids share memory with `passed`, they are dead once it gets written
			broadcast(runtime, pool, &yy.group_centroids, &group_centroids(&centroids, &groups_of, groups, f))?;
		}

		let mut assignments = vec![u32::MAX; n];
		let mut prev;
		let mut iteration = 0;
		let reassigned = loop {
			iteration += 1;
			let mut next = Vec::with_capacity(n);
			for (devi, samples) in partitions.iter().enumerate() {
				let dev = pool.get(devi);
				let local = fetch(runtime, dev, buffers.centroids.ptr(devi), k * f)?;
				let assigned: Vec<(u32, f32)> = samples
					.par_chunks_exact(f)
					.map(|s| {
						let (c, d) = nearest(s, &local, dist);
						(c as u32, d)
					})
					.collect();
				if let Some(yy) = buffers.yinyang.as_deref_mut() {
					let bounds = group_bounds(samples, &local, f, &groups_of, groups, &assigned, dist);
					store(runtime, dev, yy.bounds.ptr(devi), &bounds)?;
				}
				next.extend(assigned.iter().map(|&(c, _)| c));
			}

			let reassigned = next.iter().zip(assignments.iter()).filter(|(a, b)| a != b).count() as u32;
			prev = std::mem::replace(&mut assignments, next);
			debug!("iteration {}: {} reassignments", iteration, reassigned);
			if let Some(yy) = buffers.yinyang.as_deref_mut() {
				broadcast(runtime, pool, &yy.passed, &[reassigned])?;
			}
			if !logic.next(reassigned) {
				break reassigned;
			}

			let updated = update_centroids(&partitions, &assignments, &centroids, f, problem.metric)?;
			if let Some(yy) = buffers.yinyang.as_deref_mut() {
				let mut drifts = updated.clone();
				drifts.extend(centroids.chunks_exact(f).zip(updated.chunks_exact(f)).map(|(o, u)| dist.distance(o, u)));
				broadcast(runtime, pool, &yy.drifts, &drifts)?;
			}
			centroids = updated;
			broadcast(runtime, pool, buffers.centroids, &centroids)?;
		};
		if reassigned > threshold {
			warn!("stopped after {} iterations with {} reassignments (threshold {})", iteration, reassigned, threshold);
		} else {
			debug!("converged after {} iterations", iteration);
		}

		let counts = cluster_counts(&assignments, k)?;
		broadcast(runtime, pool, buffers.counts, &counts)?;
		broadcast(runtime, pool, buffers.prev_assignments, &prev)?;
		broadcast(runtime, pool, buffers.assignments, &assignments)?;
		Ok(())
	}
}

fn kernel_failure(e: DeviceError) -> KMeansError {
	KMeansError::runtime(format!("kernel memory access failed: {}", e))
}

fn fetch<R: Runtime, T: DeviceRepr>(runtime: &R, dev: DeviceId, src: DevicePtr<T>, len: usize) -> Result<Vec<T>> {
	runtime.set_device(dev).map_err(|e| select_failed(dev, e))?;
	let mut host = vec![T::zeroed(); len];
	runtime.copy_to_host(&mut host, src).map_err(kernel_failure)?;
	Ok(host)
}

fn store<R: Runtime, T: DeviceRepr>(runtime: &R, dev: DeviceId, dst: DevicePtr<T>, src: &[T]) -> Result<()> {
	runtime.set_device(dev).map_err(|e| select_failed(dev, e))?;
	runtime.copy_from_host_async(dst, src).map_err(kernel_failure)?;
	runtime.synchronize().map_err(kernel_failure)
}

fn broadcast<R: Runtime, T: DeviceRepr>(
	runtime: &R, pool: &DevicePool, buffer: &DistributedBuffer<'_, R, T>, src: &[T],
) -> Result<()> {
	for devi in 0..pool.len() {
		store(runtime, pool.get(devi), buffer.ptr(devi), src)?;
	}
	Ok(())
}

/// Mean of the centroids of every group.
fn group_centroids(centroids: &[f32], groups_of: &[u32], groups: usize, f: usize) -> Vec<f32> {
	let mut sums = vec![0.0f32; groups * f];
	let mut counts = vec![0usize; groups];
	for (centroid, &g) in centroids.chunks_exact(f).zip(groups_of.iter()) {
		let g = g as usize;
		counts[g] += 1;
		sums[g * f..(g + 1) * f].iter_mut().zip(centroid).for_each(|(s, c)| *s += c);
	}
	sums.chunks_exact_mut(f).zip(counts).filter(|(_, cnt)| *cnt > 0).for_each(|(s, cnt)| {
		s.iter_mut().for_each(|v| *v /= cnt as f32);
	});
	sums
}

/// Per sample `[upper, lower_0, .., lower_{groups-1}]`: the distance to the own centroid and the
/// distance to the nearest other centroid of every group.
fn group_bounds(
	samples: &[f32], centroids: &[f32], f: usize, groups_of: &[u32], groups: usize, assigned: &[(u32, f32)],
	dist: &dyn DistanceFunction,
) -> Vec<f32> {
	samples
		.par_chunks_exact(f)
		.zip(assigned.par_iter())
		.flat_map_iter(|(s, &(own, d))| {
			let mut row = vec![f32::INFINITY; groups + 1];
			row[0] = d;
			for (c, centroid) in centroids.chunks_exact(f).enumerate().filter(|&(c, _)| c as u32 != own) {
				let slot = &mut row[groups_of[c] as usize + 1];
				*slot = slot.min(dist.distance(s, centroid));
			}
			row
		})
		.collect()
}

fn cluster_counts(assignments: &[u32], k: usize) -> Result<Vec<u32>> {
	let mut counts = vec![0u32; k];
	for &a in assignments {
		match counts.get_mut(a as usize) {
			Some(cnt) => *cnt += 1,
			None => return Err(KMeansError::runtime(format!("assignment {} out of range", a))),
		}
	}
	Ok(counts)
}

/// Mean of the samples of every cluster. Empty clusters keep their previous centroid, cosine
/// centroids are normalized.
fn update_centroids(
	partitions: &[Vec<f32>], assignments: &[u32], old: &[f32], f: usize, metric: DistanceMetric,
) -> Result<Vec<f32>> {
	let k = old.len() / f;
	let mut sums = vec![0.0f32; old.len()];
	let counts = cluster_counts(assignments, k)?;
	for (s, &a) in partitions.iter().flat_map(|p| p.chunks_exact(f)).zip(assignments.iter()) {
		let a = a as usize;
		sums[a * f..(a + 1) * f].iter_mut().zip(s).for_each(|(c, v)| *c += v);
	}
	sums.par_chunks_exact_mut(f).zip(old.par_chunks_exact(f)).zip(counts.par_iter()).for_each(|((c, o), &cnt)| {
		if cnt == 0 {
			c.copy_from_slice(o);
			return;
		}
		c.iter_mut().for_each(|v| *v /= cnt as f32);
		if metric == DistanceMetric::Cosine {
			let norm = c.iter().map(|v| v * v).sum::<f32>().sqrt();
			if norm > 0.0 {
				c.iter_mut().for_each(|v| *v /= norm);
			}
		}
	});
	Ok(sums)
}
