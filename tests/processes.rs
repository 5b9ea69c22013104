//! End-to-end scenarios against running dispatcher threads.
//!
//! These tests drive the public API only: boot a runtime, start the
//! dispatchers, spawn cooperative process bodies and watch the system settle
//! through `process_info`/`process_count`. Everything here is tolerant of
//! real scheduling noise - assertions wait for a condition instead of
//! assuming an interleaving.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use beamline::{
	Config, CoreMask, HIGH_PRIO, ProcessType, RecvStatus, Runtime, SpawnOptions, Trap,
};

const SETTLE: Duration = Duration::from_secs(10);

fn init_logging() {
	let _ = env_logger::builder().is_test(true).try_init();
}

fn runtime(cores: u32) -> Runtime {
	init_logging();
	let rt = Runtime::new(Config::with_cores(cores)).expect("boot failed");
	rt.start();
	rt
}

/// Polls until `pred` holds; panics after the settle budget.
fn wait_for(what: &str, mut pred: impl FnMut() -> bool) {
	let start = Instant::now();
	while !pred() {
		assert!(
			start.elapsed() < SETTLE,
			"timed out waiting for: {what}"
		);
		std::thread::sleep(Duration::from_millis(1));
	}
}

#[test]
fn processes_run_to_completion() {
	let rt = runtime(2);
	let done = Arc::new(AtomicU32::new(0));

	for _ in 0..64 {
		let done = done.clone();
		let mut steps = 0u32;
		rt.spawn(
			SpawnOptions::new(),
			Box::new(move |ctx| {
				steps += 1;
				if !ctx.consume(100) || steps >= 5 {
					done.fetch_add(1, Ordering::SeqCst);
					Trap::Exit(0)
				} else {
					Trap::Yield
				}
			}),
		)
		.unwrap();
	}

	wait_for("all processes to exit", || {
		done.load(Ordering::SeqCst) == 64 && rt.process_count() == 0
	});

	let scheduled: u64 = (0..2).map(|c| rt.stats(c).unwrap().total_scheduled).sum();
	assert!(scheduled >= 64);
	rt.shutdown();
}

#[test]
fn ping_pong_across_cores() {
	let rt = runtime(2);

	// The ponger echoes every message back to its sender until told to
	// stop.
	let ponger = rt
		.spawn(
			SpawnOptions::new().on_core(1),
			Box::new(move |ctx| match ctx.receive() {
				RecvStatus::Message(envelope) => {
					if envelope.payload.as_ref() == b"stop" {
						Trap::Exit(0)
					} else {
						let _ = ctx.send(envelope.sender, &envelope.payload);
						Trap::YieldIfContended
					}
				}
				RecvStatus::WouldBlock => Trap::Receive(None),
				RecvStatus::TimedOut => Trap::Exit(1),
			}),
		)
		.unwrap();

	let rounds = Arc::new(AtomicU32::new(0));
	let observed = rounds.clone();
	rt.spawn(
		SpawnOptions::new().on_core(0),
		Box::new(move |ctx| {
			let sent = observed.load(Ordering::SeqCst);
			if sent == 0 {
				observed.store(1, Ordering::SeqCst);
				ctx.send(ponger, b"ball").unwrap();
				return Trap::Receive(None);
			}

			match ctx.receive() {
				RecvStatus::Message(_) => {
					let n = observed.fetch_add(1, Ordering::SeqCst) + 1;
					if n > 100 {
						let _ = ctx.send(ponger, b"stop");
						Trap::Exit(0)
					} else {
						ctx.send(ponger, b"ball").unwrap();
						Trap::Receive(None)
					}
				}
				RecvStatus::WouldBlock => Trap::Receive(None),
				RecvStatus::TimedOut => Trap::Exit(1),
			}
		}),
	)
	.unwrap();

	wait_for("the rally to finish", || rt.process_count() == 0);
	assert!(rounds.load(Ordering::SeqCst) > 100);
	rt.shutdown();
}

#[test]
fn per_sender_order_is_preserved() {
	let rt = runtime(2);
	let received = Arc::new(AtomicU64::new(0));
	let in_order = Arc::new(AtomicU32::new(1));

	let sink_seen = received.clone();
	let sink_order = in_order.clone();
	let mut expected = 0u64;
	let sink = rt
		.spawn(
			SpawnOptions::new().on_core(0),
			Box::new(move |ctx| match ctx.receive() {
				RecvStatus::Message(envelope) => {
					let mut value = [0u8; 8];
					value.copy_from_slice(&envelope.payload);
					let value = u64::from_le_bytes(value);
					if value != expected {
						sink_order.store(0, Ordering::SeqCst);
					}
					expected += 1;
					sink_seen.store(expected, Ordering::SeqCst);
					if expected == 200 {
						Trap::Exit(0)
					} else {
						Trap::YieldIfContended
					}
				}
				RecvStatus::WouldBlock => Trap::Receive(None),
				RecvStatus::TimedOut => Trap::Exit(1),
			}),
		)
		.unwrap();

	let mut next = 0u64;
	rt.spawn(
		SpawnOptions::new().on_core(1),
		Box::new(move |ctx| {
			while next < 200 {
				ctx.send(sink, &next.to_le_bytes()).unwrap();
				next += 1;
				if !ctx.consume(10) {
					return Trap::Preempted;
				}
			}
			Trap::Exit(0)
		}),
	)
	.unwrap();

	wait_for("all 200 messages to arrive", || rt.process_count() == 0);
	assert_eq!(received.load(Ordering::SeqCst), 200);
	assert_eq!(in_order.load(Ordering::SeqCst), 1, "messages arrived out of order");
	rt.shutdown();
}

#[test]
fn receive_timeout_expires_in_real_time() {
	let rt = runtime(1);
	let outcome = Arc::new(AtomicU32::new(0));

	let flag = outcome.clone();
	rt.spawn(
		SpawnOptions::new(),
		Box::new(move |ctx| match ctx.receive() {
			RecvStatus::Message(_) => {
				flag.store(1, Ordering::SeqCst);
				Trap::Exit(0)
			}
			// 20 ticks = 20 ms at the default tick rate.
			RecvStatus::WouldBlock => Trap::Receive(Some(20)),
			RecvStatus::TimedOut => {
				flag.store(2, Ordering::SeqCst);
				Trap::Exit(0)
			}
		}),
	)
	.unwrap();

	wait_for("the receive to time out", || rt.process_count() == 0);
	assert_eq!(outcome.load(Ordering::SeqCst), 2);
	rt.shutdown();
}

#[test]
fn sleepers_are_woken_by_the_timer_core() {
	let rt = runtime(2);
	let woken = Arc::new(AtomicU32::new(0));

	for _ in 0..8 {
		let woken = woken.clone();
		let mut slept = false;
		rt.spawn(
			SpawnOptions::new(),
			Box::new(move |_| {
				if !slept {
					slept = true;
					Trap::Sleep(15)
				} else {
					woken.fetch_add(1, Ordering::SeqCst);
					Trap::Exit(0)
				}
			}),
		)
		.unwrap();
	}

	wait_for("all sleepers to wake", || woken.load(Ordering::SeqCst) == 8);
	rt.shutdown();
}

#[test]
fn spawn_tree_fans_out_from_a_process() {
	let rt = runtime(2);
	let leaves = Arc::new(AtomicU32::new(0));

	let counter = leaves.clone();
	rt.spawn(
		SpawnOptions::new(),
		Box::new(move |ctx| {
			for _ in 0..10 {
				let counter = counter.clone();
				ctx.spawn(
					SpawnOptions::new(),
					Box::new(move |_| {
						counter.fetch_add(1, Ordering::SeqCst);
						Trap::Exit(0)
					}),
				)
				.unwrap();
			}
			Trap::Exit(0)
		}),
	)
	.unwrap();

	wait_for("the whole tree to exit", || {
		leaves.load(Ordering::SeqCst) == 10 && rt.process_count() == 0
	});
	rt.shutdown();
}

#[test]
fn kill_collects_a_blocked_process() {
	let rt = runtime(1);

	let pid = rt
		.spawn(
			SpawnOptions::new(),
			Box::new(|ctx| match ctx.receive() {
				RecvStatus::Message(_) => Trap::Exit(0),
				RecvStatus::WouldBlock => Trap::Receive(None),
				RecvStatus::TimedOut => Trap::Exit(1),
			}),
		)
		.unwrap();

	// Let it park on its mailbox, then pull the plug.
	wait_for("the process to block", || {
		rt.process_info(pid)
			.map(|info| info.state == beamline::PcbState::Waiting)
			.unwrap_or(true)
	});
	rt.kill(pid).unwrap();

	wait_for("the kill to be collected", || rt.process_count() == 0);
	assert!(rt.process_info(pid).is_err());
	rt.shutdown();
}

#[test]
fn work_spreads_over_both_clusters() {
	let mut config = Config::with_cores(4);
	config.p_core_range = 0..2;
	init_logging();
	let rt = Runtime::new(config).unwrap();
	rt.start();

	let busy = rt.optimal_core(ProcessType::CpuIntensive);
	assert!(rt.cluster(busy).unwrap() == 0);
	let calm = rt.optimal_core(ProcessType::IoBound);
	assert!(rt.cluster(calm).unwrap() == 1);

	let done = Arc::new(AtomicU32::new(0));
	for i in 0..32 {
		let done = done.clone();
		let kind = if i % 2 == 0 {
			ProcessType::CpuIntensive
		} else {
			ProcessType::IoBound
		};
		rt.spawn(
			SpawnOptions::new().with_process_type(kind),
			Box::new(move |ctx| {
				if ctx.consume(50) {
					Trap::Yield
				} else {
					done.fetch_add(1, Ordering::SeqCst);
					Trap::Exit(0)
				}
			}),
		)
		.unwrap();
	}

	wait_for("the burst to drain", || rt.process_count() == 0);
	rt.shutdown();
}

#[test]
fn affinity_round_trips_and_truncates() {
	let rt = runtime(2);

	let pid = rt
		.spawn(
			SpawnOptions::new().with_priority(HIGH_PRIO),
			Box::new(|_| Trap::Receive(None)),
		)
		.unwrap();

	// Bits beyond the online cores are silently dropped.
	rt.set_affinity(pid, CoreMask::from_bits(0b1111_0001)).unwrap();
	assert_eq!(rt.get_affinity(pid).unwrap(), CoreMask::from_bits(0b01));

	// A mask with no online core is rejected outright.
	assert!(rt.set_affinity(pid, CoreMask::from_bits(0b100)).is_err());
	assert_eq!(rt.get_affinity(pid).unwrap(), CoreMask::from_bits(0b01));

	rt.kill(pid).unwrap();
	wait_for("the pinned process to die", || rt.process_count() == 0);
	rt.shutdown();
}

#[test]
fn suspend_holds_a_process_until_resume() {
	let rt = runtime(1);
	let progressed = Arc::new(AtomicU32::new(0));

	let counter = progressed.clone();
	let pid = rt
		.spawn(
			SpawnOptions::new(),
			Box::new(move |_| {
				counter.fetch_add(1, Ordering::SeqCst);
				Trap::Yield
			}),
		)
		.unwrap();

	wait_for("the process to make progress", || {
		progressed.load(Ordering::SeqCst) > 0
	});
	rt.suspend(pid).unwrap();

	wait_for("the suspension to take hold", || {
		rt.process_info(pid)
			.map(|info| info.state == beamline::PcbState::Suspended)
			.unwrap_or(false)
	});
	let frozen = progressed.load(Ordering::SeqCst);
	std::thread::sleep(Duration::from_millis(20));
	assert_eq!(progressed.load(Ordering::SeqCst), frozen);

	rt.resume(pid).unwrap();
	wait_for("the process to run again", || {
		progressed.load(Ordering::SeqCst) > frozen
	});

	rt.kill(pid).unwrap();
	wait_for("cleanup", || rt.process_count() == 0);
	rt.shutdown();
}
