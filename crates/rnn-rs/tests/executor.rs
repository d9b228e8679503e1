use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rnn_rs::exec::{self, SampleBatch, SumCriterion};
use rnn_rs::graph::{CloneSet, ExportScope, Place, Recurrence, Role, TemplateGraph};
use rnn_rs::{Shape, Tensor};

#[test]
fn linear_step_matches_hand_computed_gradients() -> Result<()> {
    let mut builder = TemplateGraph::builder("proj");
    let x = builder.input("x");
    let y = builder.linear("proj", Role::Generic, x, 2, 2);
    let template = builder.finish()?;

    let mut rng = StdRng::seed_from_u64(1);
    let mut set = CloneSet::unroll("proj", template, vec![], 1, &mut rng)?;
    set.export(y, ExportScope::LastClone)?;

    let node = set.template().nodes()[0].id;
    let params = set.linear_params(node)?;
    params.weight.value_storage().write(&[1.0, 2.0, 3.0, 4.0]);
    params.bias.value_storage().write(&[0.5, -0.5]);

    let mut batch = SampleBatch::new();
    batch.feed(0, 0, x, Tensor::from_vec(Shape::new([1, 2]), vec![1.0, 2.0])?)?;

    let mut sets = [set];
    exec::run(&mut sets, &batch, &SumCriterion, false)?;

    let out = sets[0].value_of(0, y)?;
    assert_eq!(out.data(), &[7.5, 9.5]);

    let (dx, _) = sets[0].grad_data(Place::Step { clone: 0, tensor: x })?;
    assert_eq!(dx, vec![3.0, 7.0]);
    assert_eq!(params.weight.read_grad()?, vec![1.0, 1.0, 2.0, 2.0]);
    assert_eq!(params.bias.read_grad()?, vec![1.0, 1.0]);
    Ok(())
}

#[test]
fn recurrence_accumulates_gradients_across_clones() -> Result<()> {
    // y_t = x_t + y_{t-1}, zero initial state, every y exported.
    let mut builder = TemplateGraph::builder("chain");
    let x = builder.input("x");
    let state = builder.input("state");
    let y = builder.add("y", x, state);
    let template = builder.finish()?;

    let mut rng = StdRng::seed_from_u64(2);
    let mut set = CloneSet::unroll(
        "chain",
        template,
        vec![Recurrence {
            output: y,
            input: state,
            lag: 1,
            state_features: 1,
        }],
        3,
        &mut rng,
    )?;
    set.export(y, ExportScope::EveryClone)?;

    let mut batch = SampleBatch::new();
    for step in 0..3 {
        batch.feed(0, step, x, Tensor::from_vec(Shape::new([1, 1]), vec![1.0])?)?;
    }

    let mut sets = [set];
    exec::run(&mut sets, &batch, &SumCriterion, false)?;

    // Running sum forward.
    assert_eq!(sets[0].value_of(0, y)?.data(), &[1.0]);
    assert_eq!(sets[0].value_of(1, y)?.data(), &[2.0]);
    assert_eq!(sets[0].value_of(2, y)?.data(), &[3.0]);

    // Each x_t influences every later export exactly once.
    for (clone, expected) in [(0u32, 3.0), (1, 2.0), (2, 1.0)] {
        let (dx, _) = sets[0].grad_data(Place::Step { clone, tensor: x })?;
        assert_eq!(dx, vec![expected]);
    }

    // One run shapes every produced instance, recurrence targets included.
    assert!(sets[0].is_calibrated());
    Ok(())
}

#[test]
fn missing_feed_is_reported() -> Result<()> {
    let mut builder = TemplateGraph::builder("proj");
    let x = builder.input("x");
    let y = builder.linear("proj", Role::Generic, x, 2, 2);
    let template = builder.finish()?;

    let mut rng = StdRng::seed_from_u64(3);
    let mut set = CloneSet::unroll("proj", template, vec![], 2, &mut rng)?;
    set.export(y, ExportScope::LastClone)?;

    let mut batch = SampleBatch::new();
    batch.feed(0, 0, x, Tensor::from_vec(Shape::new([1, 2]), vec![1.0, 2.0])?)?;

    let mut sets = [set];
    let err = exec::run(&mut sets, &batch, &SumCriterion, false).unwrap_err();
    assert!(err.to_string().contains("missing feed"));
    Ok(())
}
