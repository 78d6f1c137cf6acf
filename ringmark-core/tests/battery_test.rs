//! End-to-end battery runs over the loopback cluster.

use ringmark_core::config::RunConfig;
use ringmark_core::orchestrator;
use ringmark_core::runtime::loopback::{run_on, LoopbackAccel};
use ringmark_core::runtime::Accelerator;
use ringmark_core::suite;
use ringmark_core::RingmarkError;

fn accel_factory() -> Box<dyn Accelerator> {
    Box::new(LoopbackAccel::new())
}

#[test]
fn standard_suite_passes_on_a_small_job() {
    let scratch = tempfile::tempdir().unwrap();
    let config = RunConfig {
        msg_size: 2048,
        file_size: 1024,
        passes: 2,
        quiet: true,
        stat_paths: vec![scratch.path().to_path_buf()],
        io_paths: vec![scratch.path().to_path_buf()],
        ..RunConfig::default()
    };

    let results = run_on(3, |comm| {
        orchestrator::run(&comm, config.clone(), &accel_factory)
    });
    for result in results {
        result.unwrap();
    }

    // Both I/O probes delete their transient files.
    assert_eq!(std::fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[test]
fn full_registry_runs_to_completion() {
    let scratch = tempfile::tempdir().unwrap();
    let config = RunConfig {
        msg_size: 512,
        file_size: 512,
        quiet: true,
        io_paths: vec![scratch.path().to_path_buf()],
        probe_list: Some(
            suite::REGISTRY
                .iter()
                .map(|probe| probe.name.to_string())
                .collect(),
        ),
        ..RunConfig::default()
    };

    let results = run_on(2, |comm| {
        orchestrator::run(&comm, config.clone(), &accel_factory)
    });
    for result in results {
        result.unwrap();
    }
}

#[test]
fn unreachable_stat_path_fails_the_run_on_every_rank() {
    let config = RunConfig {
        quiet: true,
        stat_paths: vec!["/ringmark-no-such-path/at-all".into()],
        probe_list: Some(vec!["stat_paths".to_string()]),
        ..RunConfig::default()
    };

    let results = run_on(2, |comm| {
        orchestrator::run(&comm, config.clone(), &accel_factory)
    });
    for result in results {
        assert!(matches!(result, Err(RingmarkError::Io(_))));
    }
}

#[test]
fn empty_probe_list_still_synchronizes_and_passes() {
    let config = RunConfig {
        quiet: true,
        probe_list: Some(vec!["not_a_probe".to_string()]),
        ..RunConfig::default()
    };

    let results = run_on(2, |comm| {
        orchestrator::run(&comm, config.clone(), &accel_factory)
    });
    for result in results {
        result.unwrap();
    }
}
