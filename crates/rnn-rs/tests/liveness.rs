use std::collections::HashSet;

use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rnn_rs::exec::{self, SampleBatch, SumCriterion};
use rnn_rs::graph::{
    CloneSet, ExportScope, NodeId, Place, Recurrence, TemplateGraph, TensorId, TensorKind,
};
use rnn_rs::memory::{self, liveness, trace::Phase, InstanceKey, LiveInterval, TraceEvent};
use rnn_rs::{OptimizerError, Shape, Tensor};

const FEATURES: usize = 2;
const STEPS: usize = 5;
const LAG: usize = 3;

/// y_t = x_t + x_t, z_t = y_t + y_{t-LAG}, last z exported.
fn skip_connection_set(rng: &mut StdRng) -> Result<(CloneSet, TensorId, TensorId, TensorId)> {
    let mut builder = TemplateGraph::builder("skip");
    let x = builder.input("x");
    let state = builder.input("state");
    let y = builder.add("y", x, x);
    let z = builder.add("z", y, state);
    let template = builder.finish()?;

    let mut set = CloneSet::unroll(
        "skip",
        template,
        vec![Recurrence {
            output: y,
            input: state,
            lag: LAG,
            state_features: FEATURES,
        }],
        STEPS,
        rng,
    )?;
    set.export(z, ExportScope::LastClone)?;
    Ok((set, x, y, z))
}

fn traced_intervals() -> Result<(Vec<LiveInterval>, TensorId, TensorId, TensorId)> {
    let mut rng = StdRng::seed_from_u64(11);
    let (set, x, y, z) = skip_connection_set(&mut rng)?;

    let mut batch = SampleBatch::new();
    for step in 0..STEPS {
        batch.feed(
            0,
            step,
            x,
            Tensor::from_vec(Shape::new([1, FEATURES]), vec![1.0; FEATURES])?,
        )?;
    }

    let mut sets = [set];
    let trace = exec::run(&mut sets, &batch, &SumCriterion, true)?;
    let pinned = memory::pinned_keys(&sets);
    let intervals = liveness::analyze(&trace, &pinned)?;
    Ok((intervals, x, y, z))
}

fn find(intervals: &[LiveInterval], key: InstanceKey) -> Option<LiveInterval> {
    intervals.iter().copied().find(|iv| iv.key == key)
}

#[test]
fn skip_connection_extends_the_source_lifetime() -> Result<()> {
    let (intervals, _, y, _) = traced_intervals()?;

    // Forward events: clone t emits y at index 2t, z at 2t + 1. Clone LAG
    // re-reads y of clone 0 through the recurrence, so y(0) must stay live
    // until that event.
    let key = InstanceKey {
        graph: 0,
        place: Place::Step { clone: 0, tensor: y },
        kind: TensorKind::Value,
    };
    let interval = find(&intervals, key).expect("y(0) is traced");
    assert_eq!(interval.birth, 0);
    assert_eq!(interval.death, 2 * LAG + 1);
    assert_eq!(interval.elements, FEATURES);

    // y(1) is read by clone LAG + 1 one event pair later.
    let key = InstanceKey {
        graph: 0,
        place: Place::Step { clone: 1, tensor: y },
        kind: TensorKind::Value,
    };
    let interval = find(&intervals, key).expect("y(1) is traced");
    assert_eq!(interval.death, 2 * (LAG + 1) + 1);
    Ok(())
}

#[test]
fn pinned_instances_never_enter_the_interval_set() -> Result<()> {
    let (intervals, x, _, z) = traced_intervals()?;

    for interval in &intervals {
        assert!(
            !matches!(interval.key.place, Place::Initial { .. }),
            "initial state leaked into liveness: {:?}",
            interval.key
        );
        if let Place::Step { clone, tensor } = interval.key.place {
            assert_ne!(tensor, x, "feed leaked into liveness");
            assert!(
                !(tensor == z && clone == (STEPS - 1) as u32),
                "exported output leaked into liveness"
            );
        }
    }

    // Non-exported z clones are ordinary instances and must be present.
    let key = InstanceKey {
        graph: 0,
        place: Place::Step { clone: 0, tensor: z },
        kind: TensorKind::Value,
    };
    assert!(find(&intervals, key).is_some());
    Ok(())
}

#[test]
fn intervals_are_sorted_and_grad_lifetimes_sit_in_backward() -> Result<()> {
    let (intervals, _, y, _) = traced_intervals()?;

    let mut last_birth = 0usize;
    for interval in &intervals {
        assert!(interval.birth >= last_birth);
        last_birth = interval.birth;
        assert!(interval.death >= interval.birth);
        assert_eq!(interval.bytes, interval.elements * 4);
    }

    let forward_events = 2 * STEPS;
    let key = InstanceKey {
        graph: 0,
        place: Place::Step { clone: 0, tensor: y },
        kind: TensorKind::Grad,
    };
    let interval = find(&intervals, key).expect("y(0) grad is traced");
    assert!(interval.birth >= forward_events);
    Ok(())
}

#[test]
fn reading_an_unwritten_instance_is_an_inconsistency() {
    let key = InstanceKey {
        graph: 0,
        place: Place::Step {
            clone: 0,
            tensor: TensorId(0),
        },
        kind: TensorKind::Value,
    };
    let mut trace = memory::ExecutionTrace::default();
    trace.push(TraceEvent {
        graph: 0,
        clone: 0,
        node: NodeId(0),
        phase: Phase::Forward,
        reads: vec![key],
        writes: vec![],
    });

    let err = liveness::analyze(&trace, &HashSet::new()).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OptimizerError>(),
        Some(OptimizerError::Inconsistency(_))
    ));
}
