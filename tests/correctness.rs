//! End-to-end scenarios over the RAM-backed I/O layer: small shaped
//! graphs with known answers, a message flood, and parallel-vs-sequential
//! equivalence on a randomized graph.

use std::sync::Arc;

use gale::{
    test_utils::{
        random_directed, sequential_bfs, BfsProgram, CountingProgram, GraphBuilder,
    },
    EdgeDir, GraphConfig, GraphEngine, VertexId, VertexProgram,
};

fn config(num_threads: usize) -> GraphConfig {
    GraphConfig {
        num_threads,
        ..Default::default()
    }
}

fn run_bfs(
    builder: &GraphBuilder,
    start: &[VertexId],
    num_threads: usize,
) -> (GraphEngine<BfsProgram>, usize) {
    let (factory, index) = builder.build_fixture();
    let mut engine = GraphEngine::new(
        config(num_threads),
        Arc::new(factory),
        index,
        BfsProgram::new(EdgeDir::Out),
    )
    .expect("engine construction");
    engine.start(start).expect("start");
    let levels = engine.wait_for_completion().expect("completion");
    (engine, levels)
}

fn visited_levels(engine: &GraphEngine<BfsProgram>) -> Vec<Option<usize>> {
    engine
        .arena()
        .expect("arena is back after completion")
        .iter()
        .map(|v| v.state.level())
        .collect()
}

#[test]
fn bfs_on_a_directed_line() {
    let mut builder = GraphBuilder::directed(5);
    for v in 0..4 {
        builder.edge(v, v + 1);
    }
    let (engine, levels) = run_bfs(&builder, &[0], 2);
    let got = visited_levels(&engine);
    assert_eq!(got, vec![Some(0), Some(1), Some(2), Some(3), Some(4)]);
    // five visit levels, plus the empty level that detects termination
    assert_eq!(levels, 5);
}

#[test]
fn bfs_on_an_undirected_star() {
    let mut builder = GraphBuilder::undirected(100);
    for leaf in 1..100 {
        builder.edge(0, leaf);
    }
    let (engine, _) = run_bfs(&builder, &[50], 4);
    let got = visited_levels(&engine);
    assert_eq!(got.iter().filter(|l| l.is_some()).count(), 100);
    assert_eq!(got[50], Some(0));
    assert_eq!(got[0], Some(1));
    for leaf in 1..100 {
        if leaf != 50 {
            assert_eq!(got[leaf], Some(2), "leaf {}", leaf);
        }
    }
}

#[test]
fn bfs_stays_inside_its_component() {
    let mut builder = GraphBuilder::directed(6);
    for &(a, b) in &[(0, 1), (1, 2), (2, 0), (3, 4), (4, 5), (5, 3)] {
        builder.edge(a, b);
    }
    let (engine, _) = run_bfs(&builder, &[0], 2);
    let got = visited_levels(&engine);
    assert_eq!(got[..3], [Some(0), Some(1), Some(2)]);
    assert_eq!(got[3..], [None, None, None]);
    let visited = engine
        .arena()
        .unwrap()
        .par_count(|v| v.state.visited());
    assert_eq!(visited, 3);
}

#[test]
fn every_vertex_of_a_complete_graph_receives_its_messages() {
    let n = 10u64;
    let mut builder = GraphBuilder::directed(n as usize);
    for from in 0..n {
        for to in 0..n {
            if from != to {
                builder.edge(from, to);
            }
        }
    }
    let (factory, index) = builder.build_fixture();
    let mut engine = GraphEngine::new(config(4), Arc::new(factory), index, CountingProgram)
        .expect("engine construction");
    engine.start_all().expect("start_all");
    let levels = engine.wait_for_completion().expect("completion");
    // sends produce no activations, so one level suffices
    assert_eq!(levels, 1);
    for v in engine.arena().unwrap().iter() {
        assert_eq!(v.state.received(), 9, "vertex {}", v.id());
    }
}

#[test]
fn random_graph_bfs_matches_the_sequential_reference() {
    let builder = random_directed(20_000, 8, 0xfeed);
    let expected = sequential_bfs(&builder, &[0]);
    let (engine, _) = run_bfs(&builder, &[0], 4);
    let got = visited_levels(&engine);
    assert_eq!(got.len(), expected.len());
    let mut mismatches = 0;
    for (v, (g, e)) in got.iter().zip(&expected).enumerate() {
        if g != e {
            mismatches += 1;
            if mismatches < 5 {
                eprintln!("vertex {}: engine {:?}, reference {:?}", v, g, e);
            }
        }
    }
    assert_eq!(mismatches, 0);
    let reachable = expected.iter().filter(|l| l.is_some()).count();
    let visited = engine.arena().unwrap().par_count(|v| v.state.visited());
    assert_eq!(visited, reachable);
}

#[test]
fn worker_count_does_not_change_the_result() {
    let builder = random_directed(5_000, 6, 42);
    let (one, _) = run_bfs(&builder, &[0], 1);
    let (eight, _) = run_bfs(&builder, &[0], 8);
    assert_eq!(visited_levels(&one), visited_levels(&eight));
}

#[test]
fn custom_scheduler_still_visits_everything() {
    let builder = random_directed(2_000, 5, 7);
    let (factory, index) = builder.build_fixture();
    let mut engine = GraphEngine::new(
        config(4),
        Arc::new(factory),
        index,
        BfsProgram::new(EdgeDir::Out),
    )
    .expect("engine construction");
    engine.set_scheduler(Arc::new(|ids: &mut Vec<VertexId>| {
        ids.sort_unstable_by(|a, b| b.cmp(a))
    }));
    engine.start(&[0]).expect("start");
    engine.wait_for_completion().expect("completion");
    let expected = sequential_bfs(&builder, &[0]);
    let visited = engine.arena().unwrap().par_count(|v| v.state.visited());
    assert_eq!(visited, expected.iter().filter(|l| l.is_some()).count());
}

#[test]
fn start_rejects_vertices_outside_the_graph() {
    let builder = GraphBuilder::directed(3);
    let (factory, index) = builder.build_fixture();
    let mut engine = GraphEngine::new(
        config(2),
        Arc::new(factory),
        index,
        BfsProgram::new(EdgeDir::Out),
    )
    .expect("engine construction");
    assert!(engine.start(&[7]).is_err());
}

/// a program that completes immediately without activating anything
struct Inert;

impl VertexProgram for Inert {
    type State = ();

    fn pre_run(&self, _ctx: &mut gale::EngineContext<'_, ()>, _v: &gale::Vertex<()>) -> bool {
        false
    }

    fn run(
        &self,
        _ctx: &mut gale::EngineContext<'_, ()>,
        _v: &gale::Vertex<()>,
        _page: &gale::PageVertex,
    ) -> bool {
        true
    }
}

#[test]
fn a_level_without_activations_terminates_the_engine() {
    let builder = random_directed(500, 4, 3);
    let (factory, index) = builder.build_fixture();
    let mut engine =
        GraphEngine::new(config(4), Arc::new(factory), index, Inert).expect("engine construction");
    engine.start_all().expect("start_all");
    let levels = engine.wait_for_completion().expect("completion");
    assert_eq!(levels, 1);
}
