//! Host-side scheduling through the public API.

use crossbeam_channel::bounded;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use veda_flow::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn executor(threads: usize) -> Executor {
    init_tracing();
    let config = Config::builder().num_threads(threads).build().unwrap();
    Executor::new(config).unwrap()
}

#[test]
fn test_random_dag_respects_every_edge() {
    let exec = executor(4);
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let n = 200;

    let clock = Arc::new(AtomicUsize::new(0));
    let stamps = Arc::new(Mutex::new(vec![(usize::MAX, usize::MAX); n]));
    let runs = Arc::new(Mutex::new(vec![0usize; n]));
    let mut graph = Graph::named("random");

    let nodes: Vec<NodeHandle> = (0..n)
        .map(|i| {
            let clock = clock.clone();
            let stamps = stamps.clone();
            let runs = runs.clone();
            graph.add_node(move || {
                let start = clock.fetch_add(1, Ordering::SeqCst);
                runs.lock()[i] += 1;
                let end = clock.fetch_add(1, Ordering::SeqCst);
                stamps.lock()[i] = (start, end);
            })
        })
        .collect();

    let mut edges = Vec::new();
    for to in 1..n {
        for _ in 0..rng.gen_range(0..4) {
            let from = rng.gen_range(0..to);
            graph.add_edge(nodes[from], nodes[to]).unwrap();
            edges.push((from, to));
        }
    }

    exec.run(&Arc::new(graph)).get().unwrap();

    assert!(runs.lock().iter().all(|&r| r == 1));
    let stamps = stamps.lock();
    for (from, to) in edges {
        assert!(
            stamps[from].1 < stamps[to].0,
            "edge {} -> {} violated",
            from,
            to
        );
    }
}

#[test]
fn test_graph_can_run_repeatedly() {
    let exec = executor(3);
    let count = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();

    let mut prev: Option<NodeHandle> = None;
    for _ in 0..10 {
        let c = count.clone();
        let node = graph.add_node(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        if let Some(p) = prev {
            graph.add_edge(p, node).unwrap();
        }
        prev = Some(node);
    }

    let graph = Arc::new(graph);
    for _ in 0..5 {
        exec.run(&graph).get().unwrap();
    }
    assert_eq!(count.load(Ordering::SeqCst), 50);
}

#[test]
fn test_concurrent_runs_share_workers() {
    let exec = executor(4);
    let total = Arc::new(AtomicUsize::new(0));

    let graphs: Vec<Arc<Graph>> = (0..8)
        .map(|_| {
            let mut g = Graph::new();
            let root = g.add_node(|| {});
            for _ in 0..32 {
                let t = total.clone();
                let leaf = g.add_node(move || {
                    t.fetch_add(1, Ordering::SeqCst);
                });
                g.add_edge(root, leaf).unwrap();
            }
            Arc::new(g)
        })
        .collect();

    let futures: Vec<RunFuture> = graphs.iter().map(|g| exec.run(g)).collect();
    for f in futures {
        f.get().unwrap();
    }
    assert_eq!(total.load(Ordering::SeqCst), 8 * 32);
}

#[test]
fn test_failure_propagates_and_blocks_successors() {
    let exec = executor(2);
    let sibling_ran = Arc::new(AtomicUsize::new(0));
    let successor_ran = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();

    let failing = graph.add_fallible_node(|| Err(Error::invalid_argument("bad input")));
    let sibling = {
        let s = sibling_ran.clone();
        graph.add_node(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
    };
    let after = {
        let s = successor_ran.clone();
        graph.add_node(move || {
            s.fetch_add(1, Ordering::SeqCst);
        })
    };
    graph.add_edge(failing, after).unwrap();
    graph.add_edge(sibling, after).unwrap();

    let result = exec.run(&Arc::new(graph)).get();
    assert_eq!(result, Err(Error::invalid_argument("bad input")));
    assert_eq!(sibling_ran.load(Ordering::SeqCst), 1);
    assert_eq!(successor_ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_panic_becomes_host_task_error() {
    init_tracing();
    let config = Config::builder()
        .num_threads(2)
        .panic_strategy(PanicStrategy::Isolate)
        .build()
        .unwrap();
    let exec = Executor::new(config).unwrap();
    let mut graph = Graph::new();
    let node = graph.add_node(|| panic!("exploded"));
    graph.name(node, "fuse").unwrap();

    match exec.run(&Arc::new(graph)).get() {
        Err(Error::HostTask { task, message }) => {
            assert_eq!(task, "fuse");
            assert_eq!(message, "exploded");
        }
        other => panic!("unexpected result: {:?}", other),
    }
    assert_eq!(exec.panic_count(), 1);
}

#[test]
fn test_cancel_skips_undispatched_nodes() {
    let exec = executor(2);
    let (started_tx, started_rx) = bounded(1);
    let (release_tx, release_rx) = bounded::<()>(1);
    let downstream = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();

    let gate = graph.add_node(move || {
        started_tx.send(()).unwrap();
        release_rx.recv().unwrap();
    });
    let after = {
        let d = downstream.clone();
        graph.add_node(move || {
            d.fetch_add(1, Ordering::SeqCst);
        })
    };
    graph.add_edge(gate, after).unwrap();

    let future = exec.run(&Arc::new(graph));
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    future.cancel();
    release_tx.send(()).unwrap();

    assert_eq!(future.get(), Err(Error::Cancelled));
    assert_eq!(downstream.load(Ordering::SeqCst), 0);
}

#[test]
fn test_condition_loop() {
    let exec = executor(2);
    let iterations = Arc::new(AtomicUsize::new(0));
    let finished = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();

    let init = graph.add_node(|| {});
    let check = {
        let it = iterations.clone();
        graph.add_condition(move || if it.load(Ordering::SeqCst) < 5 { 0 } else { 1 })
    };
    let body = {
        let it = iterations.clone();
        graph.add_node(move || {
            it.fetch_add(1, Ordering::SeqCst);
        })
    };
    let back = graph.add_condition(|| 0);
    let done = {
        let f = finished.clone();
        graph.add_node(move || {
            f.fetch_add(1, Ordering::SeqCst);
        })
    };

    graph.add_edge(init, check).unwrap();
    graph.precede(check, [body, done]).unwrap();
    graph.add_edge(body, back).unwrap();
    graph.add_edge(back, check).unwrap();

    let graph = Arc::new(graph);
    exec.run(&graph).get().unwrap();
    assert_eq!(iterations.load(Ordering::SeqCst), 5);
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert!(graph.dump_edges().contains("[weak]"));
}

#[test]
fn test_condition_out_of_range_ends_branch() {
    let exec = executor(1);
    let ran = Arc::new(AtomicUsize::new(0));
    let mut graph = Graph::new();

    let cond = graph.add_condition(|| 7);
    let target = {
        let r = ran.clone();
        graph.add_node(move || {
            r.fetch_add(1, Ordering::SeqCst);
        })
    };
    graph.add_edge(cond, target).unwrap();

    exec.run(&Arc::new(graph)).get().unwrap();
    assert_eq!(ran.load(Ordering::SeqCst), 0);
}

#[test]
fn test_wait_for_all() {
    let exec = executor(2);
    let count = Arc::new(AtomicUsize::new(0));

    for _ in 0..4 {
        let mut graph = Graph::new();
        let c = count.clone();
        graph.add_node(move || {
            std::thread::sleep(Duration::from_millis(2));
            c.fetch_add(1, Ordering::SeqCst);
        });
        let _ = exec.run(&Arc::new(graph));
    }

    exec.wait_for_all();
    assert_eq!(exec.active_runs(), 0);
    assert_eq!(count.load(Ordering::SeqCst), 4);
}

#[test]
fn test_edges_in_any_insertion_order() {
    let exec = executor(2);
    let log = Arc::new(Mutex::new(Vec::new()));
    let mut graph = Graph::new();

    let nodes: Vec<NodeHandle> = ["c", "a", "b"]
        .iter()
        .map(|&name| {
            let log = log.clone();
            let n = graph.add_node(move || log.lock().push(name));
            graph.name(n, name).unwrap();
            n
        })
        .collect();
    // b -> c declared before a -> b
    graph.add_edge(nodes[2], nodes[0]).unwrap();
    graph.succeed(nodes[2], [nodes[1]]).unwrap();

    exec.run(&Arc::new(graph)).get().unwrap();
    assert_eq!(*log.lock(), vec!["a", "b", "c"]);
}
