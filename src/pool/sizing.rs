/*!
 * Pool Sizing
 *
 * Pool sizes come from a configuration string of the form
 * `"name=N,other=M,D"`: the entry whose name matches the running program
 * wins, otherwise the bare value `D` applies to every program.
 */

use libc::RLIM_INFINITY;
use nix::sys::resource::{getrlimit, Resource};
use tracing::debug;

/// Pool size for the running program
pub fn parse_pool_size(value: &str) -> usize {
    let program = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.file_name().map(|name| name.to_string_lossy().into_owned()));
    match program {
        Some(program) => parse_pool_size_for(value, &program),
        None => 0,
    }
}

/// Pool size for `program`
///
/// The first matching `name=N` entry wins; among bare values the last
/// positive one wins. Zero when nothing applies.
pub fn parse_pool_size_for(value: &str, program: &str) -> usize {
    let mut default = 0;
    for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.split_once('=') {
            Some((name, size)) if name.trim() == program => {
                return size.trim().parse().unwrap_or(0);
            }
            Some(_) => {}
            None => {
                if let Ok(size) = token.parse::<usize>() {
                    if size > 0 {
                        default = size;
                    }
                }
            }
        }
    }
    default
}

/// Clamp a pool size to what the process limits can sustain
///
/// Each pooled handle costs two descriptors (resource and lock file) and
/// typically one worker thread.
pub fn verify_pool_size(size: usize) -> usize {
    if size == 0 {
        return 0;
    }
    let (Ok((nofile, _)), Ok((nproc, _))) = (
        getrlimit(Resource::RLIMIT_NOFILE),
        getrlimit(Resource::RLIMIT_NPROC),
    ) else {
        return size;
    };
    let limit = |soft: u64| (soft != RLIM_INFINITY as u64).then_some(soft);
    clamp_pool_size(size, limit(nofile as u64), limit(nproc as u64))
}

/// Clamp against explicit soft limits; `None` means unlimited
pub fn clamp_pool_size(size: usize, nofile: Option<u64>, nproc: Option<u64>) -> usize {
    let mut clamped = size as u64;
    if let Some(nofile) = nofile {
        let file_limit = nofile / 2;
        if clamped > file_limit {
            debug!(size, nofile, "pool size limited by open file limit");
            clamped = file_limit;
        }
    }
    if let Some(nproc) = nproc {
        let proc_limit = nproc * 3 / 4;
        if clamped > proc_limit {
            debug!(size, nproc, "pool size limited by process limit");
            clamped = proc_limit;
        }
    }
    if clamped > 0 && clamped < size as u64 {
        clamped as usize
    } else {
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_entry_wins() {
        let value = "indexer=8,server=32,4";
        assert_eq!(parse_pool_size_for(value, "server"), 32);
        assert_eq!(parse_pool_size_for(value, "indexer"), 8);
        assert_eq!(parse_pool_size_for(value, "other"), 4);
    }

    #[test]
    fn test_defaults() {
        assert_eq!(parse_pool_size_for("", "server"), 0);
        assert_eq!(parse_pool_size_for("2,6", "server"), 6);
        assert_eq!(parse_pool_size_for("6,0,-1,bogus", "server"), 6);
        assert_eq!(parse_pool_size_for("server=x,5", "server"), 0);
        assert_eq!(parse_pool_size_for("server=3,server=9", "server"), 3);
    }

    #[test]
    fn test_clamp() {
        assert_eq!(clamp_pool_size(100, Some(64), None), 32);
        assert_eq!(clamp_pool_size(100, None, Some(40)), 30);
        assert_eq!(clamp_pool_size(100, Some(64), Some(20)), 15);
        assert_eq!(clamp_pool_size(10, Some(1024), Some(4096)), 10);
        assert_eq!(clamp_pool_size(10, None, None), 10);
        // a zero limit never zeroes the pool
        assert_eq!(clamp_pool_size(10, Some(1), None), 10);
        assert_eq!(verify_pool_size(0), 0);
        assert!(verify_pool_size(4) <= 4);
    }
}
