use std::collections::HashMap;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rnn_rs::exec::{self, SampleBatch, SumCriterion};
use rnn_rs::graph::{CloneSet, ExportScope, Recurrence, TemplateGraph, TensorId};
use rnn_rs::memory::{self, alloc, liveness, InstanceKey, LiveInterval, Phase};
use rnn_rs::{Shape, Tensor};

const STEPS: usize = 3;
const FEATURES: usize = 2;

/// y_t = tanh(x_t + y_{t-1}), last y exported.
fn chain_set(name: &str, rng: &mut StdRng) -> Result<(CloneSet, TensorId, TensorId)> {
    let mut builder = TemplateGraph::builder(name);
    let x = builder.input("x");
    let state = builder.input("state");
    let sum = builder.add("sum", x, state);
    let y = builder.tanh("y", sum);
    let template = builder.finish()?;

    let mut set = CloneSet::unroll(
        name,
        template,
        vec![Recurrence {
            output: y,
            input: state,
            lag: 1,
            state_features: FEATURES,
        }],
        STEPS,
        rng,
    )?;
    set.export(y, ExportScope::LastClone)?;
    Ok((set, x, y))
}

fn pair(seed: u64) -> Result<([CloneSet; 2], TensorId, TensorId)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let (first, _, y_first) = chain_set("enc", &mut rng)?;
    let (second, _, y_second) = chain_set("dec", &mut rng)?;
    Ok(([first, second], y_first, y_second))
}

fn batch_for(sets: &[CloneSet], rows: usize, seed: u64) -> Result<SampleBatch> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut batch = SampleBatch::new();
    for (graph, set) in sets.iter().enumerate() {
        for step in 0..set.steps() {
            for &input in &set.feed_inputs() {
                batch.feed(
                    graph,
                    step,
                    input,
                    Tensor::randn(Shape::new([rows, FEATURES]), 1.0, &mut rng),
                )?;
            }
        }
    }
    Ok(batch)
}

#[test]
fn trace_walks_graphs_forward_in_order_and_backward_in_reverse() -> Result<()> {
    let (mut sets, _, _) = pair(21)?;
    let batch = batch_for(&sets, 1, 210)?;
    let trace = exec::run(&mut sets, &batch, &SumCriterion, true)?;

    let phases: Vec<(Phase, u16)> = trace
        .events
        .iter()
        .map(|event| (event.phase, event.graph))
        .collect();

    // Every node yields one forward and one backward event.
    let forward_len = phases
        .iter()
        .take_while(|(phase, _)| *phase == Phase::Forward)
        .count();
    assert_eq!(forward_len * 2, phases.len());
    assert!(phases[forward_len..]
        .iter()
        .all(|(phase, _)| *phase == Phase::Backward));

    let forward: Vec<u16> = phases[..forward_len].iter().map(|&(_, g)| g).collect();
    assert_eq!(forward[0], 0);
    assert_eq!(*forward.last().unwrap(), 1);
    assert!(forward.windows(2).all(|w| w[0] <= w[1]));

    let backward: Vec<u16> = phases[forward_len..].iter().map(|&(_, g)| g).collect();
    assert_eq!(backward[0], 1);
    assert_eq!(*backward.last().unwrap(), 0);
    assert!(backward.windows(2).all(|w| w[0] >= w[1]));
    Ok(())
}

#[test]
fn combined_assignment_stays_disjoint_and_reuses_across_graphs() -> Result<()> {
    let (mut sets, _, _) = pair(22)?;
    let batch = batch_for(&sets, 1, 211)?;
    let trace = exec::run(&mut sets, &batch, &SumCriterion, true)?;

    let pinned = memory::pinned_keys(&sets);
    let intervals = liveness::analyze(&trace, &pinned)?;
    assert!(intervals.iter().any(|iv| iv.key.graph == 0));
    assert!(intervals.iter().any(|iv| iv.key.graph == 1));

    let assignment = alloc::assign(&intervals)?;
    let by_key: HashMap<InstanceKey, LiveInterval> =
        intervals.iter().map(|iv| (iv.key, *iv)).collect();

    let mut occupants: HashMap<usize, Vec<InstanceKey>> = HashMap::new();
    for (&instance, &slot) in &assignment.by_instance {
        occupants.entry(slot).or_default().push(instance);
    }
    let mut cross_graph_slot = false;
    for (slot, keys) in &occupants {
        for (i, a) in keys.iter().enumerate() {
            let a = by_key[a];
            assert!(assignment.slots[*slot].capacity >= a.elements);
            for b in &keys[i + 1..] {
                let b = by_key[b];
                assert!(
                    a.death < b.birth || b.death < a.birth,
                    "slot {slot} holds overlapping intervals {a:?} and {b:?}"
                );
            }
        }
        if keys.iter().any(|k| k.graph == 0) && keys.iter().any(|k| k.graph == 1) {
            cross_graph_slot = true;
        }
    }
    // A graph-0 intermediate that dies in forward frees its slot before
    // graph 1 starts producing, so at least one slot serves both graphs.
    assert!(cross_graph_slot);
    Ok(())
}

#[test]
fn optimizing_two_graphs_rewrites_each_set_correctly() -> Result<()> {
    let (mut optimized, y_first, y_second) = pair(23)?;
    let (mut reference, _, _) = pair(23)?;

    let calibration = batch_for(&optimized, 1, 212)?;
    let report = memory::optimize(&mut optimized, &calibration)?;
    assert!(report.shared_bytes > 0);

    // One assignment covers both sets.
    let fingerprint = optimized[0].applied_fingerprint();
    assert!(fingerprint.is_some());
    assert_eq!(optimized[1].applied_fingerprint(), fingerprint);

    let batch = batch_for(&optimized, 2, 213)?;
    exec::run(&mut optimized, &batch, &SumCriterion, false)?;
    exec::run(&mut reference, &batch, &SumCriterion, false)?;

    let last = (STEPS - 1) as u32;
    assert_eq!(
        optimized[0].value_of(last, y_first)?.data(),
        reference[0].value_of(last, y_first)?.data()
    );
    assert_eq!(
        optimized[1].value_of(last, y_second)?.data(),
        reference[1].value_of(last, y_second)?.data()
    );
    Ok(())
}
