//! Rate-limited wrappers over synchronized actions.
//!
//! Both helpers operate at the caller layer, above the queue: once a
//! coalesced call is released it is a plain enqueue, with unchanged
//! scheduling semantics. The controller also reuses [`Throttle`] for the
//! reset pipeline, which must coalesce failure bursts into one trailing
//! recovery attempt.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Suffix resolving an action name to its throttled variant.
pub const THROTTLED_SUFFIX: &str = "Throttled";

/// Suffix resolving an action name to its debounced variant.
pub const DEBOUNCED_SUFFIX: &str = "Debounced";

/// Window applied to `<name>Throttled` action variants.
pub(crate) const THROTTLE_WINDOW: Duration = Duration::from_millis(100);

/// Gap applied to `<name>Debounced` action variants.
pub(crate) const DEBOUNCE_GAP: Duration = Duration::from_millis(100);

struct ThrottleState<T> {
	latest: Option<T>,
	window_open: bool,
}

/// Trailing-edge throttle: calls during an open window are coalesced, the
/// most recent payload fires when the window closes, and the next call
/// after a fire opens a fresh window.
pub struct Throttle<T> {
	window: Duration,
	run: Arc<dyn Fn(T) + Send + Sync>,
	state: Arc<Mutex<ThrottleState<T>>>,
}

impl<T: Send + 'static> Throttle<T> {
	pub fn new<F>(window: Duration, run: F) -> Self
	where
		F: Fn(T) + Send + Sync + 'static,
	{
		Self {
			window,
			run: Arc::new(run),
			state: Arc::new(Mutex::new(ThrottleState { latest: None, window_open: false })),
		}
	}

	/// Records the payload and, if no window is open, opens one.
	///
	/// Calls during the window replace the stored payload but do not
	/// extend the window.
	pub fn call(&self, payload: T) {
		{
			let mut state = self.state.lock();
			state.latest = Some(payload);
			if state.window_open {
				return;
			}
			state.window_open = true;
		}
		let state = Arc::clone(&self.state);
		let run = Arc::clone(&self.run);
		let window = self.window;
		tokio::spawn(async move {
			tokio::time::sleep(window).await;
			let payload = {
				let mut state = state.lock();
				state.window_open = false;
				state.latest.take()
			};
			if let Some(payload) = payload {
				run(payload);
			}
		});
	}
}

/// Debounce: each call cancels the previous pending one; the latest
/// payload fires after a full gap without further calls.
pub struct Debounce<T> {
	gap: Duration,
	run: Arc<dyn Fn(T) + Send + Sync>,
	pending: Arc<Mutex<Option<CancellationToken>>>,
}

impl<T: Send + 'static> Debounce<T> {
	pub fn new<F>(gap: Duration, run: F) -> Self
	where
		F: Fn(T) + Send + Sync + 'static,
	{
		Self {
			gap,
			run: Arc::new(run),
			pending: Arc::new(Mutex::new(None)),
		}
	}

	/// Schedules the payload, cancelling any previously pending call.
	pub fn call(&self, payload: T) {
		let token = CancellationToken::new();
		let previous = self.pending.lock().replace(token.clone());
		if let Some(previous) = previous {
			previous.cancel();
		}
		let run = Arc::clone(&self.run);
		let gap = self.gap;
		tokio::spawn(async move {
			tokio::select! {
				biased;
				_ = token.cancelled() => {}
				_ = tokio::time::sleep(gap) => run(payload),
			}
		});
	}
}

#[cfg(test)]
mod tests {
	use std::sync::Arc;
	use std::sync::atomic::{AtomicUsize, Ordering};
	use std::time::Duration;

	use parking_lot::Mutex;

	use super::{Debounce, Throttle};

	#[tokio::test(start_paused = true)]
	async fn throttle_fires_latest_payload_on_trailing_edge() {
		let fired = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&fired);
		let throttle = Throttle::new(Duration::from_millis(100), move |n: u32| sink.lock().push(n));

		throttle.call(1);
		throttle.call(2);
		throttle.call(3);
		assert!(fired.lock().is_empty(), "nothing fires before the window closes");

		tokio::time::sleep(Duration::from_millis(150)).await;
		assert_eq!(fired.lock().as_slice(), [3]);
	}

	#[tokio::test(start_paused = true)]
	async fn throttle_opens_a_fresh_window_after_fire() {
		let count = Arc::new(AtomicUsize::new(0));
		let sink = Arc::clone(&count);
		let throttle = Throttle::new(Duration::from_millis(100), move |()| {
			sink.fetch_add(1, Ordering::SeqCst);
		});

		throttle.call(());
		tokio::time::sleep(Duration::from_millis(150)).await;
		assert_eq!(count.load(Ordering::SeqCst), 1);

		throttle.call(());
		tokio::time::sleep(Duration::from_millis(150)).await;
		assert_eq!(count.load(Ordering::SeqCst), 2);
	}

	#[tokio::test(start_paused = true)]
	async fn debounce_keeps_only_the_latest_call() {
		let fired = Arc::new(Mutex::new(Vec::new()));
		let sink = Arc::clone(&fired);
		let debounce = Debounce::new(Duration::from_millis(100), move |n: u32| sink.lock().push(n));

		debounce.call(1);
		tokio::time::sleep(Duration::from_millis(50)).await;
		debounce.call(2);
		tokio::time::sleep(Duration::from_millis(50)).await;
		debounce.call(3);
		tokio::time::sleep(Duration::from_millis(150)).await;

		assert_eq!(fired.lock().as_slice(), [3]);
	}
}
