use super::InitBuffers;
use crate::api::Problem;
use crate::devices::{select_failed, DevicePool};
use crate::error::{KMeansError, Result};
use crate::kernels::Kernels;
use crate::memory::DistributedBuffer;
use crate::runtime::Runtime;
use rand::prelude::*;
use tracing::{debug, error, info, trace};

/// Below this approximate rank, the prefix search simply scans from the start.
const LINEAR_SCAN_RANK: usize = 100;

pub(crate) fn calculate<R: Runtime, K: Kernels>(
	runtime: &R, kernels: &K, problem: &Problem, pool: &DevicePool, rnd: &mut dyn RngCore, buffers: InitBuffers<'_, '_, R>,
) -> Result<()> {
	let InitBuffers { samples, centroids, dists, sums } = buffers;
	let (n, f) = (problem.samples_size as usize, problem.features_size as usize);
	info!("performing kmeans++...");

	let first = pick_first(runtime, pool, samples, n, f, rnd)?;
	centroids.copy_from_async(pool, 0, samples, first * f, f)?;
	let mut host_dists = vec![0.0f32; n];
	if problem.verbosity > 2 {
		trace!("kmeans++: dump {} {} {:p}", n, f, host_dists.as_ptr());
		for devi in 0..pool.len() {
			trace!(
				"kmeans++: dev #{}: {:?} {:?} {:?} {:?}",
				pool.get(devi), samples.ptr(devi), centroids.ptr(devi), dists.ptr(devi), sums.ptr(devi)
			);
		}
	}

	for i in 1..problem.clusters_size {
		debug!("kmeans++ step {}", i);
		let dist_sum = kernels
			.plus_plus_step(runtime, problem, i, pool, samples, centroids, dists, sums, &mut host_dists)
			.map_err(|e| {
				debug!("kmeans++ step {} failed: {}", i, e);
				e
			})?;
		if dist_sum.is_nan() {
			error!("internal bug inside kmeans++: dist_sum is NaN in step {}", i);
			return Err(KMeansError::runtime("k-means++ distance sum is NaN"));
		}
		let choice = rnd.gen::<f64>();
		let j = match weighted_pick(&host_dists, choice, dist_sum as f64) {
			Some(j) if j < n => j,
			other => {
				error!("internal bug inside kmeans++: picked {:?} out of {} samples", other, n);
				return Err(KMeansError::runtime("k-means++ picked an out of range sample"));
			}
		};
		trace!("kmeans++ step {}: choice {} picked sample {}", i, choice, j);
		centroids.copy_from_async(pool, i as usize * f, samples, j * f, f)?;
	}
	info!("kmeans++ done");
	Ok(())
}

/// Uniformly draw the first centroid, redrawing samples that start with NaN.
fn pick_first<R: Runtime>(
	runtime: &R, pool: &DevicePool, samples: &DistributedBuffer<'_, R, f32>, n: usize, f: usize,
	rnd: &mut dyn RngCore,
) -> Result<usize> {
	let dev = pool.get(0);
	runtime.set_device(dev).map_err(|e| select_failed(dev, e))?;
	runtime.synchronize().map_err(|e| KMeansError::runtime(format!("failed to synchronize device {}: {}", dev, e)))?;
	for _ in 0..n {
		let idx = rnd.gen_range(0..n);
		let mut smoke = [0.0f32];
		runtime.copy_to_host(&mut smoke, samples.ptr(0).offset(idx * f)).map_err(KMeansError::MemoryCopy)?;
		if !smoke[0].is_nan() {
			return Ok(idx);
		}
		debug!("sample {} is NaN, drawing again", idx);
	}
	error!("failed to find a sample without NaN after {} draws", n);
	Err(KMeansError::runtime("no valid first centroid found"))
}

/// Smallest index whose inclusive prefix sum of **dists** reaches `choice * dist_sum`.
/// If the target is never reached, the last index is returned. `None` only for empty input.
///
/// Starts at the approximate rank `choice * dists.len()`: the prefix up to there is summed once,
/// then the search either continues forward or bisects the recorded prefix sums. The sums are
/// accumulated in index order, so the result is identical to a plain scan from the start.
pub(crate) fn weighted_pick(dists: &[f32], choice: f64, dist_sum: f64) -> Option<usize> {
	if dists.is_empty() {
		return None;
	}
	let target = choice * dist_sum;
	let approx = ((choice * dists.len() as f64) as usize).min(dists.len());
	if approx < LINEAR_SCAN_RANK {
		return Some(scan_forward(dists, 0, 0.0, target));
	}
	let prefix: Vec<f64> = dists[..approx]
		.iter()
		.scan(0.0f64, |sum, &d| {
			*sum += d as f64;
			Some(*sum)
		})
		.collect();
	let sum = prefix[approx - 1];
	if sum < target {
		return Some(scan_forward(dists, approx, sum, target));
	}
	// distances are non-negative, so the prefix sums are sorted
	Some(prefix.partition_point(|&p| p < target))
}

fn scan_forward(dists: &[f32], start: usize, mut sum: f64, target: f64) -> usize {
	for (j, &d) in dists.iter().enumerate().skip(start) {
		sum += d as f64;
		if sum >= target {
			return j;
		}
	}
	dists.len() - 1
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::api::DistanceMetric;
	use crate::helpers::testing::{init_logging, OracleKernels};
	use crate::memory::Origin;
	use crate::HostRuntime;

	fn naive_pick(dists: &[f32], target: f64) -> usize {
		let mut sum = 0.0;
		for (j, &d) in dists.iter().enumerate() {
			sum += d as f64;
			if sum >= target {
				return j;
			}
		}
		dists.len() - 1
	}

	#[test]
	fn weighted_pick_matches_naive_scan() {
		let mut rnd = StdRng::seed_from_u64(1337);
		for &len in &[1usize, 7, 99, 100, 101, 250, 1000] {
			let dists: Vec<f32> = (0..len).map(|_| rnd.gen_range(0..10) as f32).collect();
			let sum: f64 = dists.iter().map(|&d| d as f64).sum();
			for _ in 0..200 {
				let choice = rnd.gen::<f64>();
				assert_eq!(weighted_pick(&dists, choice, sum), Some(naive_pick(&dists, choice * sum)), "len {} choice {}", len, choice);
			}
		}
	}

	#[test]
	fn weighted_pick_edges() {
		assert_eq!(weighted_pick(&[], 0.5, 1.0), None);
		// the target is reached exactly at the end of a run of zeros
		let mut dists = vec![0.0f32; 300];
		dists[200] = 1.0;
		assert_eq!(weighted_pick(&dists, 0.9, 1.0), Some(200));
		// walk back over zeros ends on the first index reaching the target
		dists[10] = 1.0;
		assert_eq!(weighted_pick(&dists, 0.4, 2.0), Some(10));
		assert_eq!(weighted_pick(&dists, 0.8, 2.0), Some(200));
		// a target beyond the total picks the last index
		assert_eq!(weighted_pick(&[1.0, 1.0], 0.99, 5.0), Some(1));
	}

	#[test]
	fn weighted_pick_exact_on_prefix_boundaries() {
		let mut rnd = StdRng::seed_from_u64(42);
		for _ in 0..30 {
			// magnitudes spread over many binades
			let dists: Vec<f32> = (0..1000).map(|_| rnd.gen::<f32>() * 2f32.powi(rnd.gen_range(-60..60))).collect();
			let sum: f64 = dists.iter().map(|&d| d as f64).sum();
			let mut prefix = 0.0f64;
			for (j, &d) in dists.iter().enumerate() {
				prefix += d as f64;
				if j < 150 {
					continue;
				}
				let choice = prefix / sum;
				assert_eq!(weighted_pick(&dists, choice, sum), Some(naive_pick(&dists, choice * sum)), "boundary {}", j);
			}
		}
	}

	fn problem(n: u32, k: u32) -> Problem {
		Problem {
			samples_size: n, features_size: 1, clusters_size: k, yinyang_groups: 0,
			metric: DistanceMetric::L2, fp16x2: false, verbosity: 3,
		}
	}

	#[test]
	fn picks_the_only_weighted_sample() {
		init_logging();
		let runtime = HostRuntime::new(2);
		let pool = DevicePool::setup(&runtime, 0, None).unwrap();
		let data: Vec<f32> = (0..10).map(|i| i as f32).collect();
		let samples = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 10).unwrap();
		samples.distribute(&pool, Origin::Host(&data), 10).unwrap();
		let centroids = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 3).unwrap();
		let mut dists = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 10).unwrap();
		let mut sums = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 10).unwrap();

		// step i puts all weight on sample 7 + i
		let kernels = OracleKernels::new(|i: u32, host: &mut [f32]| {
			host.iter_mut().for_each(|d| *d = 0.0);
			host[7 + i as usize] = 1.0;
			1.0
		});
		let buffers = InitBuffers { samples: &samples, centroids: &centroids, dists: &mut dists, sums: &mut sums };
		calculate(&runtime, &kernels, &problem(10, 3), &pool, &mut StdRng::seed_from_u64(5), buffers).unwrap();
		assert_eq!(*kernels.calls.borrow(), vec![1, 2]);

		for devi in 0..2 {
			let mut host = [0.0f32; 3];
			runtime.set_device(pool.get(devi)).unwrap();
			centroids.download(devi, &mut host).unwrap();
			assert_eq!(&host[1..], &[8.0, 9.0]);
			assert!(host[0] >= 0.0 && host[0] < 10.0);
		}
	}

	fn plus_plus_centroids(seed: u64) -> Vec<f32> {
		let runtime = HostRuntime::new(2);
		let pool = DevicePool::setup(&runtime, 0, None).unwrap();
		let data: Vec<f32> = (0..300).map(|i| i as f32).collect();
		let samples = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 300).unwrap();
		samples.distribute(&pool, Origin::Host(&data), 300).unwrap();
		let centroids = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 4).unwrap();
		let mut dists = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 300).unwrap();
		let mut sums = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 300).unwrap();

		// sample j weighs j + 1
		let kernels = OracleKernels::new(|_: u32, host: &mut [f32]| {
			host.iter_mut().enumerate().for_each(|(j, d)| *d = (j + 1) as f32);
			host.iter().sum::<f32>()
		});
		let buffers = InitBuffers { samples: &samples, centroids: &centroids, dists: &mut dists, sums: &mut sums };
		calculate(&runtime, &kernels, &problem(300, 4), &pool, &mut StdRng::seed_from_u64(seed), buffers).unwrap();

		let mut host = vec![0.0f32; 4];
		runtime.set_device(pool.get(1)).unwrap();
		centroids.download(1, &mut host).unwrap();
		host
	}

	#[test]
	fn weighted_picks_follow_the_seed() {
		let weights: Vec<f32> = (1..=300).map(|w| w as f32).collect();
		let total: f64 = weights.iter().map(|&w| w as f64).sum();
		let mut rnd = StdRng::seed_from_u64(11);
		let mut expected = vec![rnd.gen_range(0..300usize) as f32];
		for _ in 1..4 {
			let choice = rnd.gen::<f64>();
			expected.push(naive_pick(&weights, choice * total) as f32);
		}

		let centroids = plus_plus_centroids(11);
		assert_eq!(centroids, expected);
		assert_eq!(centroids, plus_plus_centroids(11));
		assert_ne!(centroids, plus_plus_centroids(12));
	}

	#[test]
	fn nan_sum_is_an_error() {
		let runtime = HostRuntime::new(1);
		let pool = DevicePool::from_devices(vec![0]).unwrap();
		let samples = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 4).unwrap();
		samples.distribute(&pool, Origin::Host(&[1.0, 2.0, 3.0, 4.0][..]), 4).unwrap();
		let centroids = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 2).unwrap();
		let mut dists = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 4).unwrap();
		let mut sums = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 4).unwrap();
		let kernels = OracleKernels::new(|_: u32, _: &mut [f32]| f32::NAN);
		let buffers = InitBuffers { samples: &samples, centroids: &centroids, dists: &mut dists, sums: &mut sums };
		let res = calculate(&runtime, &kernels, &problem(4, 2), &pool, &mut StdRng::seed_from_u64(0), buffers);
		assert!(matches!(res, Err(KMeansError::Runtime(_))));
	}

	#[test]
	fn nan_samples_are_never_picked_first() {
		let runtime = HostRuntime::new(1);
		let pool = DevicePool::from_devices(vec![0]).unwrap();
		let samples = DistributedBuffer::<_, f32>::allocate(&runtime, &pool, 4).unwrap();
		samples.distribute(&pool, Origin::Host(&[f32::NAN, f32::NAN, 3.0, f32::NAN][..]), 4).unwrap();
		let mut picked = 0;
		for seed in 0..20 {
			match pick_first(&runtime, &pool, &samples, 4, 1, &mut StdRng::seed_from_u64(seed)) {
				Ok(idx) => {
					assert_eq!(idx, 2);
					picked += 1;
				}
				Err(e) => assert!(matches!(e, KMeansError::Runtime(_))),
			}
		}
		assert!(picked > 0);

		samples.distribute(&pool, Origin::Host(&[f32::NAN; 4][..]), 4).unwrap();
		let res = pick_first(&runtime, &pool, &samples, 4, 1, &mut StdRng::seed_from_u64(0));
		assert!(matches!(res, Err(KMeansError::Runtime(_))));
	}
}
