// ABOUTME: Orchestrator policy hot-reload tests - atomic swap, bad-file safety
// ABOUTME: A failed reload must leave the previous snapshot fully intact
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Aegis Identity Platform

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![allow(missing_docs)]

use aegis_idp::mfa::orchestrator::PolicyStore;

#[test]
fn reload_swaps_the_snapshot_atomically() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(
        file.path(),
        "thresholds:\n  basic_mfa: 0.4\n  strong_mfa: 0.8\n",
    )
    .unwrap();

    let store = PolicyStore::from_file(file.path().to_path_buf()).unwrap();
    let before = store.snapshot();
    assert!((before.thresholds.basic_mfa - 0.4).abs() < f64::EPSILON);

    std::fs::write(
        file.path(),
        "thresholds:\n  basic_mfa: 0.1\n  strong_mfa: 0.2\nweights:\n  off_hours: 3.0\n",
    )
    .unwrap();
    store.reload().unwrap();

    let after = store.snapshot();
    assert!((after.thresholds.basic_mfa - 0.1).abs() < f64::EPSILON);
    assert!((after.weights["off_hours"] - 3.0).abs() < f64::EPSILON);

    // The snapshot captured before the reload never changes under the caller
    assert!((before.thresholds.basic_mfa - 0.4).abs() < f64::EPSILON);
}

#[test]
fn a_bad_file_leaves_the_previous_policy_standing() {
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), "thresholds:\n  basic_mfa: 0.4\n  strong_mfa: 0.8\n").unwrap();
    let store = PolicyStore::from_file(file.path().to_path_buf()).unwrap();

    std::fs::write(file.path(), "thresholds: [this is not a mapping").unwrap();
    assert!(store.reload().is_err());

    // Old snapshot still serves
    assert!((store.snapshot().thresholds.basic_mfa - 0.4).abs() < f64::EPSILON);
}

#[test]
fn missing_policy_file_fails_to_load() {
    assert!(PolicyStore::from_file("/nonexistent/policy.yaml".into()).is_err());
}
