//! The bounded output queue shared between a query's producer and its
//! consumer.
//!
//! The scheduler holds only a [`Weak`] reference: when the user drops the
//! [`QueueReceiver`], the queue disappears and the next liveness poll cancels
//! the query. That weak reference *is* the cancellation token.

use ndarray::Array3;
use parking_lot::{Condvar, Mutex};
use rasterloom_core::errors::Error;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How often a blocked consumer re-checks scheduler liveness.
const POLL_DISTANCE: Duration = Duration::from_millis(100);

struct QueueState {
	items: VecDeque<Result<Array3<f64>, Error>>,
	/// Terminal error; delivered after the queued items drain.
	poisoned: Option<Error>,
}

/// The scheduler-facing side of a query's output channel.
pub struct OutputQueue {
	capacity: usize,
	state: Mutex<QueueState>,
	available: Condvar,
}

impl OutputQueue {
	/// Create a queue and the user-facing receiver holding it alive.
	///
	/// `alive` is the engine's liveness flag, probed while a consumer blocks.
	pub fn new(capacity: usize, expected: usize, alive: Arc<AtomicBool>) -> (Weak<OutputQueue>, QueueReceiver) {
		let queue = Arc::new(OutputQueue {
			capacity: capacity.max(1),
			state: Mutex::new(QueueState {
				items: VecDeque::new(),
				poisoned: None,
			}),
			available: Condvar::new(),
		});
		let weak = Arc::downgrade(&queue);
		(
			weak,
			QueueReceiver {
				queue,
				expected,
				received: 0,
				alive,
			},
		)
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	pub fn len(&self) -> usize {
		self.state.lock().items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Slots the producer may still fill.
	pub fn free_space(&self) -> usize {
		self.capacity.saturating_sub(self.len())
	}

	/// Append one produced array. The producer's back-pressure window
	/// guarantees room; a full queue is a scheduling bug.
	pub fn push(&self, item: Array3<f64>) -> bool {
		let mut state = self.state.lock();
		if state.items.len() >= self.capacity {
			debug_assert!(false, "output queue overflow");
			return false;
		}
		state.items.push_back(Ok(item));
		self.available.notify_all();
		true
	}

	/// Terminally fail the query; consumers see the error once the already
	/// produced arrays have been taken.
	pub fn poison(&self, err: Error) {
		let mut state = self.state.lock();
		if state.poisoned.is_none() {
			state.poisoned = Some(err);
		}
		self.available.notify_all();
	}
}

/// The user-facing side of a query's output channel.
///
/// Arrays arrive in the order of the query's footprint list. Dropping the
/// receiver gracefully cancels the rest of the query.
pub struct QueueReceiver {
	queue: Arc<OutputQueue>,
	expected: usize,
	received: usize,
	alive: Arc<AtomicBool>,
}

impl QueueReceiver {
	/// How many arrays the query will produce in total.
	pub fn expected(&self) -> usize {
		self.expected
	}

	/// How many arrays were already taken.
	pub fn received(&self) -> usize {
		self.received
	}

	/// Arrays ready to be taken without blocking.
	pub fn ready(&self) -> usize {
		self.queue.len()
	}

	/// Take the next array without blocking.
	pub fn try_recv(&mut self) -> Option<anyhow::Result<Array3<f64>>> {
		let mut state = self.queue.state.lock();
		if let Some(item) = state.items.pop_front() {
			self.received += 1;
			return Some(item.map_err(Into::into));
		}
		if let Some(err) = &state.poisoned {
			return Some(Err(err.clone().into()));
		}
		None
	}

	/// Take the next array, blocking until it is produced.
	///
	/// While blocked, the scheduler's liveness is probed so that a crash
	/// surfaces as [`Error::SchedulerDead`] instead of a hang.
	pub fn recv(&mut self) -> anyhow::Result<Array3<f64>> {
		loop {
			{
				let mut state = self.queue.state.lock();
				if let Some(item) = state.items.pop_front() {
					self.received += 1;
					return item.map_err(Into::into);
				}
				if let Some(err) = &state.poisoned {
					return Err(err.clone().into());
				}
				if self.received >= self.expected {
					return Err(Error::InvalidParameter(format!(
						"query already delivered all {} arrays",
						self.expected
					))
					.into());
				}
				let deadline = Instant::now() + POLL_DISTANCE;
				let _ = self.queue.available.wait_until(&mut state, deadline);
				if let Some(item) = state.items.pop_front() {
					self.received += 1;
					return item.map_err(Into::into);
				}
				if let Some(err) = &state.poisoned {
					return Err(err.clone().into());
				}
			}
			if !self.alive.load(Ordering::Acquire) {
				return Err(Error::SchedulerDead("scheduler died while a query was waiting".to_string()).into());
			}
		}
	}
}

impl std::fmt::Debug for QueueReceiver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("QueueReceiver")
			.field("expected", &self.expected)
			.field("received", &self.received)
			.field("ready", &self.ready())
			.finish()
	}
}
