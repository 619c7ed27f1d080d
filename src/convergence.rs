/// Enum with possible convergence strategies.
/// These strategies specify when the refinement of the centroids stops.
///
/// Both strategies compare the amount of samples that changed their cluster during one iteration
/// against the reassignment threshold, see [`reassignments_threshold`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Convergence {
	/// Stop directly after the first iteration that reassigned at most `threshold` samples.
	Tolerance,
	/// Like [`Convergence::Tolerance`], but additionally stops after **max_iterations** iterations.
	/// ## Fields:
	/// - **max_iterations**: Upper bound for the amount of refinement iterations
	ToleranceOrIterations { max_iterations: usize },
}
impl Convergence {
	pub(crate) fn create_logic(&self, threshold: u32) -> Box<dyn ConvergenceLogic> {
		match *self {
			Convergence::Tolerance => Box::new(ToleranceLogic { threshold }),
			Convergence::ToleranceOrIterations { max_iterations } => Box::new(ToleranceOrIterationsLogic {
				threshold, max_iterations,
				iteration: 0
			}),
		}
	}
}

/// Maximum amount of reassigned samples for an iteration to count as converged:
/// `floor(tolerance * samples_size)`.
pub fn reassignments_threshold(tolerance: f32, samples_size: u32) -> u32 {
	(tolerance * samples_size as f32) as u32
}

pub(crate) trait ConvergenceLogic {
	/// Function that has to be called once an iteration of the refinement ended.
	/// ## Arguments
	/// - **reassigned**: Amount of samples that changed their cluster during the iteration
	/// ## Returns
	/// - **true** if the refinement should continue
	/// - **false** if it converged
	fn next(&mut self, reassigned: u32) -> bool;
}

pub(crate) struct ToleranceLogic {
	threshold: u32,
}
impl ConvergenceLogic for ToleranceLogic {
	fn next(&mut self, reassigned: u32) -> bool {
		reassigned > self.threshold
	}
}

pub(crate) struct ToleranceOrIterationsLogic {
	threshold: u32,
	max_iterations: usize,
	iteration: usize,
}
impl ConvergenceLogic for ToleranceOrIterationsLogic {
	fn next(&mut self, reassigned: u32) -> bool {
		self.iteration += 1;
		reassigned > self.threshold && self.iteration < self.max_iterations
	}
}
