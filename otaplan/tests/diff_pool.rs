/*
 * SPDX-FileCopyrightText: 2024-2025 Andrew Gunnerson
 * SPDX-License-Identifier: GPL-3.0-only
 */

#![cfg(unix)]

use std::{
    fs,
    path::Path,
    time::{Duration, Instant},
};

use assert_matches::assert_matches;

use otaplan::{
    config::Config,
    diff::{self, DiffFile, Difference},
};

fn shell_config(script: &str) -> Config {
    Config {
        worker_threads: 1,
        bsdiff_program: vec![
            "sh".to_owned(),
            "-c".to_owned(),
            script.to_owned(),
            "sh".to_owned(),
        ],
        ..Default::default()
    }
}

fn difference(name: &str, target: &[u8]) -> Difference {
    Difference::new(
        DiffFile::new(name, target.to_vec()),
        DiffFile::new(name, b"source".to_vec()),
        false,
    )
}

/// The fake diff program copies the target to the patch and records the order
/// in which targets were processed.
fn logging_config(log: &Path) -> Config {
    shell_config(&format!(
        "cat \"$2\" >> '{}'; cat \"$2\" > \"$3\"",
        log.display(),
    ))
}

#[test]
fn largest_target_first() {
    let temp_dir = tempfile::tempdir().unwrap();
    let log = temp_dir.path().join("order.log");
    let config = logging_config(&log);

    let mut diffs = vec![
        difference("small", b"b\n"),
        difference("large", b"aaaaaaaaa\n"),
        difference("medium", b"ccccc\n"),
    ];

    diff::compute_differences(&mut diffs, &config).unwrap();

    assert_eq!(fs::read(&log).unwrap(), b"aaaaaaaaa\nccccc\nb\n");
    for d in &diffs {
        assert_eq!(d.patch.as_deref(), Some(d.target.data.as_slice()));
    }
}

#[test]
fn every_difference_gets_a_patch_with_many_workers() {
    let temp_dir = tempfile::tempdir().unwrap();
    let log = temp_dir.path().join("order.log");
    let config = Config {
        worker_threads: 4,
        ..logging_config(&log)
    };

    let mut diffs = (0..10u8)
        .map(|i| difference(&format!("file{i}"), &vec![b'0' + i; usize::from(i) + 1]))
        .collect::<Vec<_>>();

    diff::compute_differences(&mut diffs, &config).unwrap();

    for d in &diffs {
        assert_eq!(d.patch.as_deref(), Some(d.target.data.as_slice()));
    }
}

#[test]
fn failures_leave_no_patch() {
    let config = shell_config("echo broken >&2; exit 3");
    let mut diffs = vec![difference("a", b"target")];

    diff::compute_differences(&mut diffs, &config).unwrap();
    assert_eq!(diffs[0].patch, None);

    assert_matches!(
        diffs[0].compute_patch(&config),
        Err(diff::Error::Failed { stderr, .. }) if stderr == "broken\n"
    );
}

#[test]
fn timed_out_process_is_stopped() {
    let config = Config {
        diff_timeout_secs: 1,
        terminate_grace_secs: 1,
        ..shell_config("exec sleep 30")
    };
    let mut diffs = vec![difference("a", b"target")];

    let start = Instant::now();
    diff::compute_differences(&mut diffs, &config).unwrap();

    assert!(start.elapsed() < Duration::from_secs(20));
    assert_eq!(diffs[0].patch, None);
    assert_matches!(
        diffs[0].compute_patch(&config),
        Err(diff::Error::Timeout { .. })
    );
}

#[test]
fn timeout_stops_child_processes() {
    // The shell forks sleep instead of replacing itself with it. The sleep
    // inherits the stderr pipe.
    let config = Config {
        diff_timeout_secs: 1,
        terminate_grace_secs: 1,
        ..shell_config("sleep 30; true")
    };
    let mut diffs = vec![difference("a", b"target")];

    let start = Instant::now();
    diff::compute_differences(&mut diffs, &config).unwrap();

    assert!(
        start.elapsed() < Duration::from_secs(10),
        "Pool returned after {:?}",
        start.elapsed(),
    );
    assert_eq!(diffs[0].patch, None);
}

#[test]
fn timeout_only_affects_its_own_pair() {
    let config = Config {
        worker_threads: 2,
        diff_timeout_secs: 1,
        terminate_grace_secs: 1,
        ..shell_config("if grep -q slow \"$2\"; then sleep 30; true; else cat \"$2\" > \"$3\"; fi")
    };
    let mut diffs = vec![
        difference("a", b"first\n"),
        difference("b", b"slow target\n"),
        difference("c", b"second\n"),
        difference("d", b"third one\n"),
        difference("e", b"4\n"),
    ];

    let start = Instant::now();
    diff::compute_differences(&mut diffs, &config).unwrap();
    assert!(start.elapsed() < Duration::from_secs(10));

    for d in &diffs {
        if d.target.name == "b" {
            assert_eq!(d.patch, None);
        } else {
            assert_eq!(
                d.patch.as_deref(),
                Some(d.target.data.as_slice()),
                "{}",
                d.target.name,
            );
        }
    }
}

#[test]
fn empty_list() {
    let mut diffs: Vec<Difference> = vec![];
    diff::compute_differences(&mut diffs, &Config::default()).unwrap();
}
