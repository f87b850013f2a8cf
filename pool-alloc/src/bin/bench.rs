// Copyright 2026 the authors. See the 'Copyright and license' section of the
// README.md file at the top-level directory of this repository.
//
// Licensed under the Apache License, Version 2.0 (the LICENSE-APACHE file) or
// the MIT license (the LICENSE-MIT file) at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::mem;
use std::ptr::write_volatile;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time;

use pool_alloc::{InsertionPolicy, Pool, PoolBuilder, ReclamationPolicy};

type BenchItem = [u64; 3];

const BUFFER: usize = 64 * 1024;

macro_rules! time_block {
    ($block:expr) => {{
        // warm up
        $block;
        let start = time::Instant::now();
        $block;
        let dur = start.elapsed();
        (dur.as_secs() * 1_000_000_000) + u64::from(dur.subsec_nanos())
    }};
}

macro_rules! time_block_once {
    ($block:expr) => {{
        let start = time::Instant::now();
        $block;
        let dur = start.elapsed();
        (dur.as_secs() * 1_000_000_000) + u64::from(dur.subsec_nanos())
    }};
}

fn report(ops: usize, nthreads: usize, total_ns: u64) {
    // total_ns sums per-thread times, i.e. nthreads * mean, so the rate needs another
    // nthreads factor to not over-count the workload.
    println!(
        "{} Mops/s",
        ((nthreads * ops * 1_000) as f64) / (total_ns as f64)
    );
}

fn pairs_pool(insertion: InsertionPolicy) -> Arc<Pool<BenchItem>> {
    // deferred reclamation keeps the segment mapped between pairs; with eager, a pool
    // this idle would bounce its only segment on every free
    Arc::new(
        PoolBuilder::default()
            .insertion_policy(insertion)
            .reclamation_policy(ReclamationPolicy::Deferred)
            .build::<BenchItem>(),
    )
}

fn bench_alloc_free_pairs(insertion: InsertionPolicy, nthreads: usize, per_thread: usize) {
    let pool = pairs_pool(insertion);
    let b = Arc::new(Barrier::new(nthreads + 1));
    let mut threads = Vec::new();
    for _ in 0..nthreads {
        let pool = Arc::clone(&pool);
        let barrier = b.clone();
        threads.push(thread::spawn(move || {
            barrier.wait();
            time_block!(unsafe {
                for i in 0..per_thread {
                    let ptr = pool.allocate().unwrap();
                    write_volatile(ptr.as_ptr() as *mut u64, i as u64);
                    pool.free(ptr);
                }
            })
        }));
    }
    b.wait();
    let mut total = 0;
    for t in threads {
        total += t.join().unwrap();
    }
    report(nthreads * per_thread * 2, nthreads, total);
}

fn bench_buffered_pairs(insertion: InsertionPolicy, nthreads: usize, per_thread: usize) {
    let pool = pairs_pool(insertion);
    let b = Arc::new(Barrier::new(nthreads + 1));
    let mut threads = Vec::new();
    for _ in 0..nthreads {
        let pool = Arc::clone(&pool);
        let barrier = b.clone();
        threads.push(thread::spawn(move || {
            let mut ptrs = Vec::with_capacity(BUFFER);
            for _ in 0..BUFFER {
                ptrs.push(unsafe { pool.allocate().unwrap() });
            }

            barrier.wait();
            let t = time_block!(unsafe {
                for i in 0..per_thread {
                    let idx = i % ptrs.len();
                    let slot = ptrs.get_unchecked_mut(idx);
                    pool.free(*slot);
                    *slot = pool.allocate().unwrap();
                    write_volatile(slot.as_ptr() as *mut u8, i as u8);
                }
            });
            for ptr in ptrs {
                unsafe { pool.free(ptr) };
            }
            t
        }));
    }
    b.wait();
    let mut total = 0;
    for t in threads {
        total += t.join().unwrap();
    }
    report(nthreads * per_thread * 2, nthreads, total);
}

fn bench_fill_drain(insertion: InsertionPolicy, nthreads: usize, per_thread: usize) {
    // eager reclamation, so the drain also pays for unmapping every emptied segment
    let pool = Arc::new(
        PoolBuilder::default()
            .insertion_policy(insertion)
            .build::<BenchItem>(),
    );
    let b = Arc::new(Barrier::new(nthreads + 1));
    let mut threads = Vec::new();
    for _ in 0..nthreads {
        let pool = Arc::clone(&pool);
        let barrier = b.clone();
        threads.push(thread::spawn(move || {
            barrier.wait();
            let mut ptrs = Vec::with_capacity(per_thread);
            time_block_once!(unsafe {
                for i in 0..per_thread {
                    let ptr = pool.allocate().unwrap();
                    write_volatile(ptr.as_ptr() as *mut u64, i as u64);
                    ptrs.push(ptr);
                }
                for ptr in ptrs.drain(..) {
                    pool.free(ptr);
                }
            })
        }));
    }
    b.wait();
    let mut total = 0;
    for t in threads {
        total += t.join().unwrap();
    }
    report(nthreads * per_thread * 2, nthreads, total);
}

macro_rules! run_bench_inner {
    ($bench:tt, $nthreads:expr, $iters:expr) => {
        let iters = $iters;
        let nthreads = $nthreads;
        println!("warm-head insertion");
        $bench(InsertionPolicy::WarmHead, nthreads, iters);
        println!("fifo-tail insertion");
        $bench(InsertionPolicy::FifoTail, nthreads, iters);
    };
}

macro_rules! run_bench {
    (both $desc:expr, $bench:tt, $nthreads:expr, $iters:expr) => {
        println!("\n{} - {}", $desc, "single-threaded");
        run_bench_inner!($bench, 1, $iters);
        println!("\n{} - {} threads", $desc, $nthreads);
        run_bench_inner!($bench, $nthreads, $iters);
    };
}

fn main() {
    const ITERS: usize = 1_000_000;
    let nthreads = num_cpus::get();
    println!("object size: {} bytes", mem::size_of::<BenchItem>());

    run_bench!(both "alloc/free pairs", bench_alloc_free_pairs, nthreads, ITERS);
    run_bench!(both "buffered alloc/free pairs", bench_buffered_pairs, nthreads, ITERS);
    run_bench!(both "fill and drain", bench_fill_drain, nthreads, ITERS / 10);
}
