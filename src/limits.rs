// SPDX-License-Identifier: MIT
// Copyright 2025. Thomas Bertschinger

use log::*;

use std::io;
use std::mem::MaybeUninit;

/// Descriptors kept free on top of one per connection: stdio, the ring, log output.
pub const FD_MARGIN: u64 = 32;

fn getrlimit() -> io::Result<libc::rlimit> {
    let mut rlimit = MaybeUninit::<libc::rlimit>::uninit();
    // SAFETY: getrlimit only writes through the pointer, which is valid for one rlimit.
    let res = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: getrlimit succeeded, so it initialized the struct.
    Ok(unsafe { rlimit.assume_init() })
}

/// Raise the soft `RLIMIT_NOFILE` to at least `wanted`, capped at the hard limit. Returns the
/// soft limit in effect afterwards.
///
/// # Errors
///
/// Fails if the limit cannot be read or set.
pub fn raise_fd_limit(wanted: u64) -> io::Result<u64> {
    let mut rlimit = getrlimit()?;
    let current = rlimit.rlim_cur as u64;
    if current >= wanted {
        return Ok(current);
    }

    let target = wanted.min(rlimit.rlim_max as u64);
    rlimit.rlim_cur = target as libc::rlim_t;

    // SAFETY: `rlimit` is a valid, initialized rlimit struct.
    let res = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlimit) };
    if res != 0 {
        return Err(io::Error::last_os_error());
    }

    debug!("Raised open file limit from {current} to {target}");

    if target < wanted {
        warn!(
            "Open file limit is capped at {target}, below the {wanted} this run may need; \
             some connections may fail to launch"
        );
    }

    Ok(target)
}
