//! Plugin lifecycle, calls, limits and cancellation against WAT guests.

mod common;

use common::{GUEST_WAT, NAP_WAT};
use plughost::*;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

fn guest() -> Plugin {
    Plugin::new_with_options(GUEST_WAT, [], PluginOptions::default()).unwrap()
}

fn guest_manifest() -> Manifest {
    Manifest::new([Wasm::data(GUEST_WAT)])
}

// ================================================================
// Construction
// ================================================================

#[test]
fn invalid_bytes_fail_to_load() {
    let err = Plugin::new_with_options(b"not a module", [], PluginOptions::default()).unwrap_err();
    assert!(matches!(err, Error::Load(ref msg) if !msg.is_empty()), "{err}");
}

#[test]
fn empty_manifest_fails_to_load() {
    let err = Plugin::new(&Manifest::default(), [], false).unwrap_err();
    match err {
        Error::Load(msg) => assert!(msg.contains("wasm source"), "{msg}"),
        other => panic!("expected Load, got {other:?}"),
    }
}

#[test]
fn hash_mismatch_fails_to_load() {
    let manifest = Manifest::new([Wasm::data(GUEST_WAT).with_hash("00")]);
    let err = Plugin::new(&manifest, [], false).unwrap_err();
    match err {
        Error::Load(msg) => assert!(msg.contains("hash mismatch"), "{msg}"),
        other => panic!("expected Load, got {other:?}"),
    }
}

#[test]
fn matching_hash_loads() {
    let wasm = Wasm::data(GUEST_WAT).with_hash(sha256_hex(GUEST_WAT.as_bytes()));
    let manifest = Manifest::new([wasm]);
    let mut plugin = Plugin::new(&manifest, [], false).unwrap();
    assert_eq!(plugin.call("count_vowels", "aaa").unwrap(), br#"{"count": 3}"#);
}

#[test]
fn wasi_can_be_linked() {
    let mut plugin = Plugin::new(&guest_manifest(), [], true).unwrap();
    assert_eq!(plugin.call("count_vowels", "wasi").unwrap(), br#"{"count": 2}"#);
}

#[test]
fn ids_are_distinct() {
    let a = guest();
    let b = guest();
    assert_ne!(a.id().unwrap(), b.id().unwrap());
}

// ================================================================
// Calls
// ================================================================

#[test]
fn count_vowels_hello_world() {
    let mut plugin = Plugin::new(&guest_manifest(), [], false).unwrap();
    let output = plugin.call("count_vowels", "Hello World").unwrap();
    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["count"], 3);
}

#[test]
fn count_vowels_multi_digit_and_empty() {
    let mut plugin = guest();
    assert_eq!(plugin.call("count_vowels", "aeiou".repeat(25)).unwrap(), br#"{"count": 125}"#);
    assert_eq!(plugin.call("count_vowels", "").unwrap(), br#"{"count": 0}"#);
}

#[test]
fn guest_error_becomes_execution_error() {
    let mut plugin = guest();
    match plugin.call("fail", "").unwrap_err() {
        Error::Execution { message, code } => {
            assert_eq!(message, "oops");
            assert_eq!(code, 1);
        }
        other => panic!("expected Execution, got {other:?}"),
    }
    // The failure does not stick to the next call.
    assert_eq!(plugin.call("log", "fine").unwrap(), b"fine");
}

#[test]
fn nonzero_exit_code_is_an_error() {
    let mut plugin = guest();
    assert!(matches!(
        plugin.call("nonzero", "").unwrap_err(),
        Error::Execution { code: 7, .. }
    ));
}

#[test]
fn missing_export() {
    let mut plugin = guest();
    assert!(plugin.function_exists("count_vowels").unwrap());
    assert!(!plugin.function_exists("nope").unwrap());
    match plugin.call("nope", "").unwrap_err() {
        Error::Execution { message, code } => {
            assert!(message.contains("nope"), "{message}");
            assert_eq!(code, -1);
        }
        other => panic!("expected Execution, got {other:?}"),
    }
}

#[test]
fn exports_with_parameters_are_rejected() {
    let mut plugin = guest();
    let err = plugin.call("takes_param", "").unwrap_err();
    assert!(err.to_string().contains("no parameters"), "{err}");
}

#[test]
fn interior_nul_in_name_is_rejected() {
    let mut plugin = guest();
    assert!(matches!(plugin.call("a\0b", "").unwrap_err(), Error::InvalidString(_)));
}

// ================================================================
// Config and vars
// ================================================================

#[test]
fn manifest_config_is_visible() {
    let manifest = guest_manifest().with_config_key("name", "world");
    let mut plugin = Plugin::new(&manifest, [], false).unwrap();
    assert_eq!(plugin.call("read_config", "").unwrap(), b"world");
}

#[test]
fn config_updates_merge_and_remove() {
    let manifest = guest_manifest().with_config_key("name", "world");
    let mut plugin = Plugin::new(&manifest, [], false).unwrap();

    let update = BTreeMap::from([("name".to_string(), Some("moon".to_string()))]);
    assert!(plugin.update_config(&update).unwrap());
    assert_eq!(plugin.call("read_config", "").unwrap(), b"moon");

    let removal = BTreeMap::from([("name".to_string(), None)]);
    assert!(plugin.update_config(&removal).unwrap());
    assert!(plugin.call("read_config", "").unwrap().is_empty());
}

#[test]
fn vars_persist_across_calls() {
    let mut plugin = guest();
    assert_eq!(plugin.call("counter", "").unwrap(), [1]);
    assert_eq!(plugin.call("counter", "").unwrap(), [2]);
    assert_eq!(plugin.call("counter", "").unwrap(), [3]);

    // Instances do not share vars.
    assert_eq!(guest().call("counter", "").unwrap(), [1]);
}

#[test]
fn var_store_limit_is_enforced() {
    let manifest = guest_manifest().with_memory_max_var_bytes(1);
    let mut plugin = Plugin::new(&manifest, [], false).unwrap();
    let err = plugin.call("counter", "").unwrap_err();
    assert!(err.to_string().contains("var store limit"), "{err}");
}

// ================================================================
// Limits
// ================================================================

#[test]
fn fuel_limit_stops_infinite_loop() {
    let options = PluginOptions::default().with_fuel_limit(1000);
    let mut plugin = Plugin::new_with_options(GUEST_WAT, [], options).unwrap();
    match plugin.call("spin", "").unwrap_err() {
        Error::Execution { message, .. } => assert!(message.contains("fuel"), "{message}"),
        other => panic!("expected Execution, got {other:?}"),
    }
}

#[test]
fn fuel_is_replenished_per_call() {
    let options = PluginOptions::default().with_fuel_limit(100_000);
    let mut plugin = Plugin::new_with_options(GUEST_WAT, [], options).unwrap();
    for _ in 0..5 {
        assert_eq!(plugin.call("count_vowels", "Hello World").unwrap(), br#"{"count": 3}"#);
    }
}

#[test]
fn timeout_stops_long_running_call() {
    let manifest = guest_manifest().with_timeout(Duration::from_millis(50));
    let mut plugin = Plugin::new(&manifest, [], false).unwrap();
    match plugin.call("spin", "").unwrap_err() {
        Error::Execution { message, .. } => assert!(message.contains("timeout"), "{message}"),
        other => panic!("expected Execution, got {other:?}"),
    }
    // The deadline is per call.
    assert_eq!(plugin.call("count_vowels", "e").unwrap(), br#"{"count": 1}"#);
}

#[test]
fn timeout_fires_once_a_blocking_host_call_returns() {
    let nap = Function::new("host_nap", [], [], UserData::new(()), |_, _, _, _| {
        std::thread::sleep(Duration::from_millis(300));
        Ok(())
    })
    .unwrap();
    let manifest = Manifest::new([Wasm::data(NAP_WAT)]).with_timeout(Duration::from_millis(100));
    let mut plugin = Plugin::new(&manifest, [nap], false).unwrap();

    let started = Instant::now();
    match plugin.call("nap", "").unwrap_err() {
        Error::Execution { message, .. } => assert!(message.contains("timeout"), "{message}"),
        other => panic!("expected Execution, got {other:?}"),
    }
    // The host call is not preempted; the deadline is noticed back in wasm.
    assert!(started.elapsed() >= Duration::from_millis(300));
}

// ================================================================
// Cancellation
// ================================================================

#[test]
fn already_cancelled_signal_skips_the_call() {
    let mut plugin = guest();
    let signal = CancelSignal::new();
    signal.cancel();
    assert!(matches!(
        plugin.call_with("counter", "", Some(&signal), None).unwrap_err(),
        Error::Cancelled
    ));
    // The guest never ran: the counter starts from scratch.
    assert_eq!(plugin.call("counter", "").unwrap(), [1]);
}

#[test]
fn signal_interrupts_running_call() {
    let mut plugin = guest();
    let signal = CancelSignal::new();
    std::thread::scope(|s| {
        let canceller = signal.clone();
        s.spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });
        let err = plugin.call_with("spin", "", Some(&signal), None).unwrap_err();
        assert!(matches!(err, Error::Cancelled), "{err:?}");
    });
    // A fresh call is unaffected by the earlier cancellation.
    assert_eq!(plugin.call("count_vowels", "oo").unwrap(), br#"{"count": 2}"#);
}

#[test]
fn cancel_handle_interrupts_running_call() {
    let mut plugin = guest();
    let handle = plugin.cancel_handle();
    std::thread::scope(|s| {
        s.spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            assert!(handle.cancel());
        });
        assert!(matches!(plugin.call("spin", "").unwrap_err(), Error::Cancelled));
    });
}

#[test]
fn cancel_between_calls_does_not_reach_the_next_call() {
    let manifest = guest_manifest().with_timeout(Duration::from_millis(200));
    let mut plugin = Plugin::new(&manifest, [], false).unwrap();

    assert!(plugin.cancel_handle().cancel());
    // Let the engine epoch advance while nothing is running.
    std::thread::sleep(Duration::from_millis(100));
    match plugin.call("spin", "").unwrap_err() {
        Error::Execution { message, .. } => assert!(message.contains("timeout"), "{message}"),
        other => panic!("expected Execution, got {other:?}"),
    }

    assert!(plugin.cancel_handle().cancel());
    std::thread::sleep(Duration::from_millis(50));
    let input = "a".repeat(1 << 20);
    assert_eq!(plugin.call("count_vowels", &input).unwrap(), br#"{"count": 1048576}"#);
}

#[test]
fn signal_without_cancel_lets_call_finish() {
    let mut plugin = guest();
    let signal = CancelSignal::new();
    assert_eq!(
        plugin.call_with("count_vowels", "a", Some(&signal), None).unwrap(),
        br#"{"count": 1}"#
    );
    // The observer was unregistered when the call returned.
    signal.cancel();
    assert_eq!(plugin.call("count_vowels", "a").unwrap(), br#"{"count": 1}"#);
}

// ================================================================
// Disposal
// ================================================================

#[test]
fn dispose_is_idempotent_and_final() {
    let mut plugin = guest();
    let handle = plugin.cancel_handle();
    plugin.dispose();
    plugin.dispose();
    assert!(plugin.is_disposed());

    assert!(matches!(plugin.call("count_vowels", "a").unwrap_err(), Error::Disposed));
    assert!(matches!(
        plugin.call_with("count_vowels", "a", None, None).unwrap_err(),
        Error::Disposed
    ));
    assert!(matches!(plugin.function_exists("count_vowels").unwrap_err(), Error::Disposed));
    assert!(matches!(plugin.update_config(&BTreeMap::new()).unwrap_err(), Error::Disposed));
    assert!(matches!(plugin.id().unwrap_err(), Error::Disposed));
    assert!(!handle.cancel());
}

#[test]
fn disposed_check_precedes_cancel_check() {
    let mut plugin = guest();
    plugin.dispose();
    let signal = CancelSignal::new();
    signal.cancel();
    assert!(matches!(
        plugin.call_with("spin", "", Some(&signal), None).unwrap_err(),
        Error::Disposed
    ));
}

#[test]
fn plugin_moves_between_threads() {
    let mut plugin = guest();
    let output = std::thread::spawn(move || plugin.call("count_vowels", "Hello World").unwrap())
        .join()
        .unwrap();
    assert_eq!(output, br#"{"count": 3}"#);
}
