//! Probe registry and suite selection.
//!
//! Every probe lives in one shared registry; the canonical suites are named
//! lists over it. Job size picks the suite unless the user supplies an
//! explicit list, which overrides everything: unknown names are silently
//! skipped and the result is capped at [`MAX_SUITE_LEN`] entries.

use crate::accel;
use crate::config::{RunConfig, LARGE_JOB_MSG_SIZE, LARGE_JOB_THRESHOLD};
use crate::error::RingmarkResult;
use crate::hosts::HostTable;
use crate::probes;
use crate::runtime::{AccelFactory, Communicator, MASTER_RANK};
use crate::session::{DiagnosticSession, MsgLevel};
use crate::watchdog::Watchdog;

/// Everything a probe needs, threaded explicitly instead of living in
/// process-wide globals.
pub struct ProbeCtx<'a> {
    pub session: &'a DiagnosticSession,
    pub comm: &'a dyn Communicator,
    pub hosts: &'a HostTable,
    pub watchdog: &'a Watchdog,
    pub config: &'a RunConfig,
    pub accel_factory: &'a AccelFactory,
}

impl ProbeCtx<'_> {
    pub fn is_master(&self) -> bool {
        self.comm.rank() == MASTER_RANK
    }

    /// Master-rank progress line, suppressed in quiet mode.
    pub fn announce(&self, line: impl AsRef<str>) {
        if self.is_master() && self.session.msg_level() >= MsgLevel::Progress {
            println!("{}", line.as_ref());
        }
    }
}

pub type ProbeFn = fn(&ProbeCtx<'_>) -> RingmarkResult<()>;

pub struct Probe {
    pub name: &'static str,
    pub run: ProbeFn,
}

/// Upper bound on a selected suite.
pub const MAX_SUITE_LEN: usize = 64;

/// Every available probe, in canonical order.
pub const REGISTRY: &[Probe] = &[
    Probe {
        name: "hostname_exchange",
        run: probes::comm::hostname_exchange,
    },
    Probe {
        name: "stat_paths",
        run: probes::io::stat_paths,
    },
    Probe {
        name: "shared_file_io",
        run: probes::io::shared_file_io,
    },
    Probe {
        name: "n_to_n_io",
        run: probes::io::n_to_n_io,
    },
    Probe {
        name: "accel_handshake",
        run: accel::accel_handshake,
    },
    Probe {
        name: "small_all_to_all",
        run: probes::comm::small_all_to_all,
    },
    Probe {
        name: "small_allreduce_max",
        run: probes::comm::small_allreduce_max,
    },
    Probe {
        name: "alt_sendrecv_ring",
        run: probes::comm::alt_sendrecv_ring,
    },
    Probe {
        name: "root_bcast",
        run: probes::comm::root_bcast,
    },
    Probe {
        name: "large_sendrecv_ring",
        run: probes::comm::large_sendrecv_ring,
    },
    Probe {
        name: "rand_root_bcast",
        run: probes::comm::rand_root_bcast,
    },
    Probe {
        name: "all_to_root",
        run: probes::comm::all_to_root,
    },
    Probe {
        name: "large_all_to_all",
        run: probes::comm::large_all_to_all,
    },
    Probe {
        name: "hello_world",
        run: probes::comm::hello_world,
    },
];

/// Standard battery for jobs below the large-job threshold.
pub const SMALL_JOB: &[&str] = &[
    "hostname_exchange",
    "stat_paths",
    "shared_file_io",
    "accel_handshake",
    "small_all_to_all",
    "small_allreduce_max",
    "alt_sendrecv_ring",
    "root_bcast",
    "large_sendrecv_ring",
    "rand_root_bcast",
    "all_to_root",
    "large_all_to_all",
];

/// Reduced battery for large jobs: the all-pairs and all-to-root patterns
/// scale quadratically and are dropped.
pub const LARGE_JOB: &[&str] = &[
    "hostname_exchange",
    "stat_paths",
    "shared_file_io",
    "accel_handshake",
    "small_allreduce_max",
    "alt_sendrecv_ring",
    "root_bcast",
    "rand_root_bcast",
    "large_sendrecv_ring",
];

pub fn find(name: &str) -> Option<&'static Probe> {
    REGISTRY.iter().find(|probe| probe.name == name)
}

/// Resolve names against the registry in the order given, skipping unknown
/// names silently and capping the result.
pub fn build_suite<'n>(names: impl IntoIterator<Item = &'n str>) -> Vec<&'static Probe> {
    names
        .into_iter()
        .filter_map(find)
        .take(MAX_SUITE_LEN)
        .collect()
}

/// Pick the suite for this run. An explicit probe list wins; otherwise job
/// size decides, and a large job also forces the small message size and
/// quiet mode onto the configuration.
pub fn select(config: &mut RunConfig, num_ranks: usize) -> Vec<&'static Probe> {
    if let Some(list) = config.probe_list.clone() {
        return build_suite(list.iter().map(String::as_str));
    }
    if num_ranks >= LARGE_JOB_THRESHOLD {
        config.msg_size = LARGE_JOB_MSG_SIZE;
        config.quiet = true;
        config.verbose = false;
        build_suite(LARGE_JOB.iter().copied())
    } else {
        build_suite(SMALL_JOB.iter().copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(suite: &[&'static Probe]) -> Vec<&'static str> {
        suite.iter().map(|p| p.name).collect()
    }

    #[test]
    fn registry_names_are_unique() {
        for (i, a) in REGISTRY.iter().enumerate() {
            for b in &REGISTRY[i + 1..] {
                assert_ne!(a.name, b.name);
            }
        }
    }

    #[test]
    fn canonical_suites_resolve_fully() {
        assert_eq!(build_suite(SMALL_JOB.iter().copied()).len(), SMALL_JOB.len());
        assert_eq!(build_suite(LARGE_JOB.iter().copied()).len(), LARGE_JOB.len());
    }

    #[test]
    fn large_jobs_get_the_reduced_suite_and_quiet_mode() {
        let mut config = RunConfig::default();
        let suite = select(&mut config, 300);
        assert_eq!(names(&suite), LARGE_JOB.to_vec());
        assert!(config.quiet);
        assert!(!config.verbose);
        assert_eq!(config.msg_size, LARGE_JOB_MSG_SIZE);
    }

    #[test]
    fn small_jobs_get_the_standard_suite() {
        let mut config = RunConfig::default();
        let suite = select(&mut config, 4);
        assert_eq!(names(&suite), SMALL_JOB.to_vec());
        assert!(!config.quiet);
        assert_eq!(config.msg_size, crate::config::DEFAULT_MSG_SIZE);
    }

    #[test]
    fn explicit_list_overrides_job_size() {
        let mut config = RunConfig {
            probe_list: Some(vec![
                "root_bcast".to_string(),
                "hello_world".to_string(),
            ]),
            ..RunConfig::default()
        };
        let suite = select(&mut config, 300);
        assert_eq!(names(&suite), vec!["root_bcast", "hello_world"]);
        // Explicit selection leaves the configuration alone.
        assert!(!config.quiet);
    }

    #[test]
    fn unknown_names_are_skipped_silently() {
        let suite = build_suite(["no_such_probe", "hello_world", "also_missing"]);
        assert_eq!(names(&suite), vec!["hello_world"]);
    }

    #[test]
    fn suite_length_is_capped() {
        let many: Vec<&str> = std::iter::repeat("root_bcast").take(200).collect();
        assert_eq!(build_suite(many).len(), MAX_SUITE_LEN);
    }
}
