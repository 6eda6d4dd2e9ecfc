//! Demo app: recursive task-tree expansion with Specpool and Rayon.
//!
//! Every node of a uniform tree is one task; each task burns a little CPU
//! and forks its children as fresh tasks, so the workload is exactly the
//! dynamically-growing, short-task shape the pool is built for.
//!
//! To control the script, several environment variables are used:
//!
//! - `TREE_DEPTH` - depth of the task tree (default: 7).
//! - `TREE_FANOUT` - children forked per node (default: 4).
//! - `TREE_WORK` - spin-work units burned per node (default: randomized).
//! - `TREE_THREADS` - number of threads to use (default: number of hardware threads).
//! - `TREE_BACKEND` - backend to use (default: `specpool`).
//!
//! The backends include: `specpool` and `rayon`. To compile and run:
//!
//! ```sh
//! cargo run --example tree --release
//! ```
//!
//! A profiling scheme comparing both backends on a deep tree:
//!
//! ```sh
//! time TREE_DEPTH=9 TREE_FANOUT=4 TREE_THREADS=$(nproc) \
//!     TREE_BACKEND=specpool cargo run --example tree --release
//! time TREE_DEPTH=9 TREE_FANOUT=4 TREE_THREADS=$(nproc) \
//!     TREE_BACKEND=rayon cargo run --example tree --release
//! ```
use std::env;
use std::error::Error;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rand::{rng, Rng};
use rayon::ThreadPoolBuilder;
use specpool::ThreadPool;

/// Return the number of logical CPUs visible to this process.
#[inline]
fn hw_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Small deterministic CPU burn so a node is not free.
#[inline]
fn burn(units: usize) -> usize {
    let mut acc = 0usize;
    for i in 0..units {
        acc = acc.wrapping_add(i.wrapping_mul(0x9e37_79b9));
    }
    acc
}

/// Total number of nodes in a uniform tree of the given depth and fanout.
fn tree_size(depth: usize, fanout: usize) -> usize {
    let mut total = 1usize;
    let mut level = 1usize;
    for _ in 0..depth {
        level *= fanout;
        total += level;
    }
    total
}

// ────────────────────────────────────────────────────────────────────────────
// Specpool kernel
// ────────────────────────────────────────────────────────────────────────────
fn grow_specpool(
    pool: &Arc<ThreadPool>,
    depth: usize,
    fanout: usize,
    work: usize,
    nodes: &Arc<AtomicUsize>,
) {
    nodes.fetch_add(1, Ordering::Relaxed);
    std::hint::black_box(burn(work));
    if depth == 0 {
        return;
    }
    for _ in 0..fanout {
        let pool_ref = Arc::clone(pool);
        let nodes_ref = Arc::clone(nodes);
        pool.silent_async(move || {
            grow_specpool(&pool_ref, depth - 1, fanout, work, &nodes_ref);
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Rayon kernel
// ────────────────────────────────────────────────────────────────────────────
fn grow_rayon<'scope>(
    scope: &rayon::Scope<'scope>,
    depth: usize,
    fanout: usize,
    work: usize,
    nodes: &'scope AtomicUsize,
) {
    nodes.fetch_add(1, Ordering::Relaxed);
    std::hint::black_box(burn(work));
    if depth == 0 {
        return;
    }
    for _ in 0..fanout {
        scope.spawn(move |s| grow_rayon(s, depth - 1, fanout, work, nodes));
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    let depth = env::var("TREE_DEPTH")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(7);
    let fanout = env::var("TREE_FANOUT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let threads = env::var("TREE_THREADS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(hw_threads);
    let backend = env::var("TREE_BACKEND").unwrap_or_else(|_| "specpool".into());
    let work = env::var("TREE_WORK")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or_else(|| rng().random_range(64..256));

    let expected = tree_size(depth, fanout);
    let nodes = Arc::new(AtomicUsize::new(0));
    println!(
        "expanding a depth-{depth} fanout-{fanout} tree ({expected} nodes, \
         {work} work units each) on {threads} threads via {backend}"
    );

    let started = Instant::now();
    match backend.as_str() {
        "specpool" => {
            let pool = Arc::new(
                ThreadPool::try_named_spawn("tree", threads)
                    .unwrap_or_else(|e| panic!("Failed to start Specpool pool: {e}")),
            );
            let root_pool = Arc::clone(&pool);
            let root_nodes = Arc::clone(&nodes);
            pool.silent_async(move || {
                grow_specpool(&root_pool, depth, fanout, work, &root_nodes);
            });
            pool.wait_for_all().expect("main thread owns the pool");
        }
        "rayon" => {
            let pool = ThreadPoolBuilder::new().num_threads(threads).build()?;
            pool.install(|| {
                rayon::scope(|s| grow_rayon(s, depth, fanout, work, &nodes));
            });
        }
        _ => panic!("Unsupported backend: '{backend}'"),
    }
    let elapsed = started.elapsed();

    let visited = nodes.load(Ordering::Relaxed);
    assert_eq!(visited, expected, "every node must run exactly once");
    println!("{visited} tasks in {elapsed:.2?}");

    Ok(())
}
