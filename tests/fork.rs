#![cfg(unix)]

mod common;

use std::{sync::Arc, thread, time::Duration};

use common::CountingChunks;
use membase::Base;

/// Forks with the base lock held per the fork protocol and returns whether
/// the child managed to allocate and exited cleanly.
fn fork_and_alloc_in_child(base: &Base<CountingChunks>) -> bool {
    base.prefork();
    let pid = unsafe { libc::fork() };
    assert!(pid >= 0, "fork failed");

    if pid == 0 {
        unsafe { base.postfork_child() };
        let code = match base.alloc(4096) {
            Ok(region) if region.len() == 4096 => 0,
            _ => 1,
        };
        unsafe { libc::_exit(code) };
    }

    unsafe { base.postfork_parent() };

    let mut status = 0;
    let waited = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(pid, waited);

    libc::WIFEXITED(status) && libc::WEXITSTATUS(status) == 0
}

#[test]
fn both_processes_allocate_after_fork() {
    let base = Base::boot(CountingChunks::new()).unwrap();
    base.alloc(64).unwrap();

    assert!(fork_and_alloc_in_child(&base));

    // The parent is unaffected by the child's allocations.
    let region = base.alloc(64).unwrap();
    assert_eq!(64, region.len());
}

#[test]
fn fork_while_other_threads_allocate() {
    let base = Arc::new(Base::boot(CountingChunks::new()).unwrap());

    let workers: Vec<_> = (0..3)
        .map(|_| {
            let base = Arc::clone(&base);
            thread::spawn(move || {
                for _ in 0..2_000 {
                    base.alloc(128).unwrap();
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(1));
    for _ in 0..4 {
        assert!(fork_and_alloc_in_child(&base));
    }

    for worker in workers {
        worker.join().unwrap();
    }
    base.alloc(64).unwrap();
}
