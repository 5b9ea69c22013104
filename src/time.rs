use std::time::{Duration, Instant};

/// Scheduler time, measured in timer ticks since boot.
///
/// One tick is `1 / timer_tick_hz` seconds and never coarser than one
/// millisecond.
pub type Ticks = u64;

/// Monotonic tick source for a runtime instance.
///
/// All deadlines in the wheel and all arrival timestamps in mailboxes are
/// expressed in this clock's tick domain. The clock itself is trivial; the
/// wheel is driven with explicit `now` values so tests can advance time by
/// hand.
#[derive(Debug)]
pub struct TickClock {
	epoch: Instant,
	tick: Duration,
}

impl TickClock {
	pub fn new(tick_hz: u32) -> Self {
		Self {
			epoch: Instant::now(),
			tick: Duration::from_secs(1) / tick_hz,
		}
	}

	/// Ticks elapsed since boot.
	pub fn now(&self) -> Ticks {
		let elapsed = self.epoch.elapsed();
		(elapsed.as_nanos() / self.tick.as_nanos()) as Ticks
	}

	/// Duration of one tick.
	pub fn tick_duration(&self) -> Duration {
		self.tick
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn tick_duration_matches_rate() {
		let clock = TickClock::new(1000);
		assert_eq!(clock.tick_duration(), Duration::from_millis(1));

		let clock = TickClock::new(4000);
		assert_eq!(clock.tick_duration(), Duration::from_micros(250));
	}

	#[test]
	fn clock_is_monotonic() {
		let clock = TickClock::new(1000);
		let a = clock.now();
		let b = clock.now();
		assert!(b >= a);
	}
}
