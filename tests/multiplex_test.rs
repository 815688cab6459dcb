//! End-to-end multiplexing scenarios
//!
//! Drives the full wiring path: a simulated driving target, a multiplexer
//! launched against a duplicate target, and the even/odd demultiplexed
//! pair bound through `multiplex`.

use std::time::Duration;

use serde_json::json;

use procmux::config::ScriptedConfig;
use procmux::host::types::ProcessState;
use procmux::host::{Debugger, SimSpec};
use procmux::proxy::ScriptedProcess;
use procmux::wiring::{self, ScriptedClass, ScriptedHandle};
use procmux::ScriptedError;

fn host_with_driving_target(thread_ids: &[u64]) -> Debugger {
    let debugger = Debugger::new();
    debugger.create_target(
        "a.out",
        "x86_64-unknown-linux-gnu",
        SimSpec::with_thread_ids(thread_ids),
    );
    debugger.select_target(0);
    debugger
}

/// The launch stop lands asynchronously through the event pump
fn wait_until_stopped(process: &dyn ScriptedProcess) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while process.state() != ProcessState::Stopped {
        assert!(
            std::time::Instant::now() < deadline,
            "process did not reach a stopped state"
        );
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn even_and_odd_processes_partition_the_roster() {
    let debugger = host_with_driving_target(&[1, 2, 3, 4]);
    let mux = wiring::start_multiplexer(&debugger).unwrap();

    let (even, odd) = wiring::spawn_demultiplexed_pair(&debugger, &mux, 0).unwrap();
    assert!(even.is_bound());
    assert!(odd.is_bound());
    assert_eq!(mux.registered_pids(), vec![420, 421]);

    let even_tids: Vec<u64> = even.threads_info().keys().copied().collect();
    let odd_tids: Vec<u64> = odd.threads_info().keys().copied().collect();
    assert_eq!(even_tids, vec![2, 4]);
    assert_eq!(odd_tids, vec![1, 3]);

    // The two parity views partition the full roster with no overlap
    let full: Vec<u64> = mux.threads_info(None).keys().copied().collect();
    let mut merged = [even_tids, odd_tids].concat();
    merged.sort_unstable();
    assert_eq!(merged, full);

    mux.shutdown();
}

#[test]
fn resume_cycle_fans_out_running_then_stopped_edges() {
    let debugger = host_with_driving_target(&[1, 2, 3, 4]);
    let mux = wiring::start_multiplexer(&debugger).unwrap();
    let (even, odd) = wiring::spawn_demultiplexed_pair(&debugger, &mux, 0).unwrap();
    wait_until_stopped(&mux);

    let mux_rx = mux.subscribe_state();
    let even_rx = even.subscribe_state();
    let odd_rx = odd.subscribe_state();

    // launch_scripted_process already armed the first-launch flag, so this
    // resume passes straight through to the driving process.
    even.resume(true).unwrap();

    for rx in [&mux_rx, &even_rx, &odd_rx] {
        let mut history = Vec::new();
        while history.last() != Some(&ProcessState::Stopped) {
            history.push(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        // Every stop must be an edge, never a level
        for (i, state) in history.iter().enumerate() {
            if *state == ProcessState::Stopped {
                assert!(i > 0, "stop arrived without a preceding running state");
                assert_eq!(history[i - 1], ProcessState::Running);
            }
        }
    }

    // Roster survives the clear-then-repopulate refresh with the same ids
    assert_eq!(
        even.threads_info().keys().copied().collect::<Vec<u64>>(),
        vec![2, 4]
    );
    assert_eq!(
        odd.threads_info().keys().copied().collect::<Vec<u64>>(),
        vec![1, 3]
    );

    mux.shutdown();
}

#[test]
fn demuxed_resume_after_first_launch_requires_binding() {
    let debugger = host_with_driving_target(&[1, 2]);
    let mux = wiring::start_multiplexer(&debugger).unwrap();
    wait_until_stopped(&mux);

    // Launch a demultiplexed process without binding it
    let driving_target = debugger.target_at_index(0).unwrap();
    let target = wiring::duplicate_target(&debugger, &driving_target).unwrap();
    let config = ScriptedConfig::new()
        .with("driving_target_idx", json!(0))
        .with("parity", json!(1));
    let handle =
        wiring::launch_scripted_process(&debugger, target, ScriptedClass::Demultiplexed, &config)
            .unwrap();
    let ScriptedHandle::Demultiplexed(demux) = handle else {
        panic!("expected a demultiplexed process");
    };

    // First resume consumes the launch flag and passes through
    demux.resume(true).unwrap();
    // From now on the multiplexer-delegating path is mandatory
    assert!(matches!(
        demux.resume(true),
        Err(ScriptedError::MultiplexerNotSet { .. })
    ));

    wiring::multiplex(&mux, &demux);
    demux.resume(true).unwrap();

    mux.shutdown();
}

#[test]
fn passthrough_process_relays_memory_and_roster() {
    let debugger = host_with_driving_target(&[10, 11, 12]);
    let driving_target = debugger.target_at_index(0).unwrap();
    driving_target
        .launch(procmux::host::LaunchInfo::new().stop_at_entry(true))
        .unwrap();

    let target = wiring::duplicate_target(&debugger, &driving_target).unwrap();
    let config = ScriptedConfig::new().with("driving_target_idx", json!(0));
    let handle =
        wiring::launch_scripted_process(&debugger, target, ScriptedClass::Passthru, &config)
            .unwrap();
    let process = handle.as_process();

    assert_eq!(process.process_id(), 42);
    assert_eq!(
        process.threads_info().keys().copied().collect::<Vec<u64>>(),
        vec![10, 11, 12]
    );

    let payload = b"multiplexed";
    process.write_memory_at_address(0x1000_2000, payload).unwrap();
    let data = process
        .read_memory_at_address(0x1000_2000, payload.len())
        .unwrap();
    assert_eq!(data.bytes, payload);
    assert!(process
        .memory_region_containing_address(0x1000_2000)
        .is_some());
    assert!(process.memory_region_containing_address(0x1).is_none());
}
