// Copyright (c) 2016-2017 Chef Software Inc. and/or applicable contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Traps shutdown signals into a latch the main loop can poll.
//!
//! Signals arrive on an arbitrary thread; the handler installed here only
//! stores into static atomics, which is the entire set of things that is
//! safe to do in a signal context. Everything else (turning the signal
//! into a shutdown request, logging duplicates) happens on whichever
//! thread calls `check_for_signal`.

use std::mem;
use std::ptr;
use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::{self, c_int};

use os::process::Signal;

static INIT: Once = Once::new();
// 0 means "no signal pending"; no trapped signal has signum 0.
static PENDING: AtomicUsize = AtomicUsize::new(0);
static DUPLICATES: AtomicUsize = AtomicUsize::new(0);

extern "C" fn handle_signal(signum: c_int) {
    let first = PENDING
        .compare_exchange(0, signum as usize, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();
    if !first {
        DUPLICATES.fetch_add(1, Ordering::SeqCst);
    }
}

/// Install handlers for SIGTERM, SIGINT and SIGHUP. Idempotent.
pub fn init() {
    INIT.call_once(|| unsafe {
        set_signal_handler(libc::SIGTERM);
        set_signal_handler(libc::SIGINT);
        set_signal_handler(libc::SIGHUP);
    });
}

unsafe fn set_signal_handler(signum: c_int) {
    let handler: extern "C" fn(c_int) = handle_signal;
    let mut action: libc::sigaction = mem::zeroed();
    action.sa_sigaction = handler as libc::sighandler_t;
    libc::sigemptyset(&mut action.sa_mask);
    action.sa_flags = libc::SA_RESTART;
    if libc::sigaction(signum, &action, ptr::null_mut()) != 0 {
        // This can only fail for an invalid signum, which would be a
        // programming error here.
        panic!("sigaction({}) failed", signum);
    }
}

/// Drain the pending-signal latch.
pub fn check_for_signal() -> Option<Signal> {
    match PENDING.swap(0, Ordering::SeqCst) as c_int {
        0 => None,
        signum => Signal::from_signum(signum),
    }
}

/// Number of signals that arrived while one was already pending, since the
/// last time anyone asked.
pub fn pending_duplicates() -> usize {
    DUPLICATES.swap(0, Ordering::SeqCst)
}
