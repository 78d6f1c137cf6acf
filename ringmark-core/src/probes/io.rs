//! Filesystem probes: path stats, shared-file windowed I/O, per-rank I/O.

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::Instant;

use scopeguard::ScopeGuard;

use crate::config::TEST_FILE_NAME;
use crate::error::{RingmarkError, RingmarkResult};
use crate::hosts::local_hostname;
use crate::runtime::RankStat;
use crate::session::{site, CallSite};
use crate::stats::{self, bandwidth_mbs, StatUnit};
use crate::suite::ProbeCtx;

const SHARED_BARRIER: CallSite = site(15, 1, "shared io barrier");
const SHARED_OPEN: CallSite = site(15, 2, "shared file open");
const SHARED_WRITE: CallSite = site(15, 3, "shared file write_at");
const CHECK_WRITE_COUNT: CallSite = site(15, 4, "written byte count");
const SHARED_READ: CallSite = site(15, 5, "shared file read_at");
const CHECK_READ_COUNT: CallSite = site(15, 6, "read byte count");
const SHARED_CLOSE: CallSite = site(15, 7, "shared file close");
const N_TO_N_BARRIER: CallSite = site(16, 1, "n-to-n io barrier");

const FILL_BYTE: u8 = b'j';
const CLOBBER_BYTE: u8 = b'x';

/// Stat every requested path on every rank; a path any rank cannot reach
/// fails the probe there.
pub fn stat_paths(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    if ctx.config.stat_paths.is_empty() {
        ctx.announce("       zero paths requested via -s option. skipping test.");
        return Ok(());
    }
    for path in &ctx.config.stat_paths {
        ctx.announce(format!("       stating {}", path.display()));
        if let Err(err) = std::fs::metadata(path) {
            eprintln!(
                "   !!! rank {} ({}) unable to stat {}: {err}",
                ctx.comm.rank(),
                local_hostname(),
                path.display()
            );
            return Err(RingmarkError::Io(err));
        }
    }
    Ok(())
}

/// Windowed I/O through one job-shared file per requested path: every rank
/// writes and reads back its own `file_size` window, and the three
/// bandwidths are reduced across the job.
pub fn shared_file_io(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    if ctx.config.io_paths.is_empty() {
        ctx.announce("       zero paths requested via -w option. skipping test.");
        return Ok(());
    }

    let file_size = ctx.config.file_size;
    let rank = ctx.comm.rank();
    let buff = vec![FILL_BYTE; file_size];
    let offset = (rank * file_size) as u64;

    ctx.announce(format!("       file size (per rank process): {file_size} B"));

    for dir in &ctx.config.io_paths {
        let path = dir.join(TEST_FILE_NAME);
        ctx.announce(format!("   === writing to {}", dir.display()));

        ctx.session.guarded(SHARED_BARRIER, || ctx.comm.barrier());
        ctx.session.ensure_clean("shared_file_io")?;

        let effective_start = Instant::now();
        let handle = ctx
            .session
            .guarded(SHARED_OPEN, || ctx.comm.open_shared(&path));
        ctx.session.ensure_clean("shared_file_io")?;
        let mut handle = handle.expect("guarded success carries the handle");

        let write_start = Instant::now();
        let written = ctx
            .session
            .guarded(SHARED_WRITE, || handle.write_at(offset, &buff));
        let write_secs = write_start.elapsed().as_secs_f64();
        ctx.session.ensure_clean("shared_file_io")?;

        let written = written.expect("guarded success carries the count");
        ctx.session
            .check(CHECK_WRITE_COUNT, written == file_size, written as i32);
        ctx.session.ensure_clean("shared_file_io")?;

        let mut read_buff = vec![CLOBBER_BYTE; file_size];
        let read_start = Instant::now();
        let read = ctx
            .session
            .guarded(SHARED_READ, || handle.read_at(offset, &mut read_buff));
        let read_secs = read_start.elapsed().as_secs_f64();
        ctx.session.ensure_clean("shared_file_io")?;

        let read = read.expect("guarded success carries the count");
        ctx.session
            .check(CHECK_READ_COUNT, read == file_size, read as i32);
        ctx.session.ensure_clean("shared_file_io")?;

        ctx.session.guarded(SHARED_CLOSE, || handle.close());
        let effective_secs = effective_start.elapsed().as_secs_f64();
        ctx.session.ensure_clean("shared_file_io")?;

        report_bandwidths(
            ctx,
            file_size,
            effective_secs,
            write_secs,
            read_secs,
        )?;
    }
    Ok(())
}

/// Per-rank private-file I/O: write, seek back, clobber the buffer, read,
/// verify byte for byte, delete. The effective bandwidth excludes the seek
/// and clobber windows.
pub fn n_to_n_io(ctx: &ProbeCtx<'_>) -> RingmarkResult<()> {
    if ctx.config.io_paths.is_empty() {
        ctx.announce("       zero paths requested via -w option. skipping test.");
        return Ok(());
    }

    let file_size = ctx.config.file_size;
    let rank = ctx.comm.rank();
    let buff = vec![FILL_BYTE; file_size];

    ctx.announce(format!("       file size (per rank process): {file_size} B"));

    for dir in &ctx.config.io_paths {
        let path = dir.join(format!("{TEST_FILE_NAME}_{rank}"));
        ctx.announce(format!("   === writing to {}", dir.display()));

        ctx.session.guarded(N_TO_N_BARRIER, || ctx.comm.barrier());
        ctx.session.ensure_clean("n_to_n_io")?;

        let (effective_secs, write_secs, read_secs) =
            exercise_private_file(&path, &buff)?;

        report_bandwidths(
            ctx,
            file_size,
            effective_secs,
            write_secs,
            read_secs,
        )?;
    }
    Ok(())
}

/// One write/seek/clobber/read/verify cycle against `path`. The file is
/// deleted on success and failure alike.
fn exercise_private_file(path: &Path, buff: &[u8]) -> RingmarkResult<(f64, f64, f64)> {
    let open_start = Instant::now();
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    let cleanup = scopeguard::guard(path.to_path_buf(), |p| {
        let _ = std::fs::remove_file(&p);
    });

    let write_start = Instant::now();
    file.write_all(buff)?;
    let write_secs = write_start.elapsed().as_secs_f64();

    // Seek and clobber are timed so they can be subtracted from the
    // effective-bandwidth window.
    let seek_start = Instant::now();
    file.seek(SeekFrom::Start(0))?;
    let seek_secs = seek_start.elapsed().as_secs_f64();

    let clobber_start = Instant::now();
    let mut read_buff = vec![CLOBBER_BYTE; buff.len()];
    let clobber_secs = clobber_start.elapsed().as_secs_f64();

    let read_start = Instant::now();
    file.read_exact(&mut read_buff)?;
    let read_secs = read_start.elapsed().as_secs_f64();

    drop(file);
    let effective_secs =
        open_start.elapsed().as_secs_f64() - seek_secs - clobber_secs;

    std::fs::remove_file(ScopeGuard::into_inner(cleanup))?;

    if read_buff != buff {
        return Err(RingmarkError::CheckFailed {
            check: "characters read do not match characters written".to_string(),
        });
    }

    Ok((effective_secs, write_secs, read_secs))
}

fn report_bandwidths(
    ctx: &ProbeCtx<'_>,
    file_size: usize,
    effective_secs: f64,
    write_secs: f64,
    read_secs: f64,
) -> RingmarkResult<()> {
    let rank = ctx.comm.rank();
    let reports = [
        ("effective write bandwidth", effective_secs),
        ("pure write bandwidth", write_secs),
        ("pure read bandwidth", read_secs),
    ];
    for (label, secs) in reports {
        let stat = RankStat::new(bandwidth_mbs(file_size, secs), rank);
        stats::report(
            ctx.session,
            ctx.comm,
            ctx.hosts,
            stat,
            label,
            StatUnit::MbPerSec,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_file_cycle_verifies_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cycle");
        let buff = vec![FILL_BYTE; 4096];

        let (effective, write, read) = exercise_private_file(&path, &buff).unwrap();
        assert!(!path.exists());
        assert!(write >= 0.0 && read >= 0.0);
        // Subtracting the seek/clobber windows can push a tiny file's
        // effective time below zero; the bandwidth helper maps that to 0.
        let _ = effective;
    }

    #[test]
    fn open_failure_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing-dir").join("cycle");
        let buff = vec![FILL_BYTE; 16];
        assert!(exercise_private_file(&path, &buff).is_err());
        assert!(!path.exists());
    }
}
