use anyhow::Result;
use rand::rngs::StdRng;
use rand::SeedableRng;

use rnn_rs::graph::{
    CloneSet, OpKind, Place, Recurrence, Role, TemplateGraph, TensorId,
};
use rnn_rs::model::{LstmCell, LstmConfig};
use rnn_rs::OptimizerError;

fn is_structural(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<OptimizerError>(),
        Some(OptimizerError::Structural(_))
    )
}

fn skip_template() -> Result<(TemplateGraph, TensorId, TensorId, TensorId)> {
    let mut builder = TemplateGraph::builder("skip");
    let x = builder.input("x");
    let state = builder.input("state");
    let y = builder.add("y", x, state);
    Ok((builder.finish()?, x, state, y))
}

#[test]
fn empty_template_is_rejected() {
    let err = TemplateGraph::builder("empty").finish().unwrap_err();
    assert!(is_structural(&err));
}

#[test]
fn unknown_tensor_reference_is_rejected() {
    let mut builder = TemplateGraph::builder("bad");
    let x = builder.input("x");
    builder.add("y", x, TensorId(99));
    let err = builder.finish().unwrap_err();
    assert!(is_structural(&err));
}

#[test]
fn unroll_rejects_invalid_windows_and_recurrences() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(1);

    let (template, _, _, _) = skip_template()?;
    let err = CloneSet::unroll("s", template, vec![], 0, &mut rng).unwrap_err();
    assert!(is_structural(&err));

    let (template, _, state2, y2) = skip_template()?;
    let err = CloneSet::unroll(
        "s",
        template,
        vec![Recurrence {
            output: y2,
            input: state2,
            lag: 0,
            state_features: 2,
        }],
        3,
        &mut rng,
    )
    .unwrap_err();
    assert!(is_structural(&err));

    // A produced tensor cannot be a recurrence target.
    let (template, _, _, y3) = skip_template()?;
    let err = CloneSet::unroll(
        "s",
        template,
        vec![Recurrence {
            output: y3,
            input: y3,
            lag: 1,
            state_features: 2,
        }],
        3,
        &mut rng,
    )
    .unwrap_err();
    assert!(is_structural(&err));

    // A recurrence source must be produced inside the template.
    let (template, x4, state4, _) = skip_template()?;
    let err = CloneSet::unroll(
        "s",
        template,
        vec![Recurrence {
            output: x4,
            input: state4,
            lag: 1,
            state_features: 2,
        }],
        3,
        &mut rng,
    )
    .unwrap_err();
    assert!(is_structural(&err));

    Ok(())
}

#[test]
fn recurrence_resolution_crosses_clones() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(2);
    let (template, x, state, y) = skip_template()?;
    let set = CloneSet::unroll(
        "s",
        template,
        vec![Recurrence {
            output: y,
            input: state,
            lag: 3,
            state_features: 2,
        }],
        5,
        &mut rng,
    )?;

    // Clones with enough history read a lagged output; earlier ones read a
    // dedicated initial-state tensor.
    assert_eq!(
        set.resolve(4, state)?,
        Place::Step { clone: 1, tensor: y }
    );
    assert_eq!(
        set.resolve(2, state)?,
        Place::Initial { tensor: state, slot: 2 }
    );
    assert_eq!(set.resolve(2, x)?, Place::Step { clone: 2, tensor: x });
    assert_eq!(set.feed_inputs(), vec![x]);
    Ok(())
}

#[test]
fn lstm_gate_slices_are_positional() -> Result<()> {
    let cell = LstmCell::build(LstmConfig {
        input_size: 3,
        hidden_size: 4,
        layers: 1,
    })?;
    let narrows: Vec<(usize, usize, String)> = cell
        .template
        .nodes()
        .iter()
        .filter_map(|node| match &node.op {
            OpKind::Narrow(spec) => Some((
                spec.offset,
                spec.len,
                cell.template.tensor_name(node.output()).to_string(),
            )),
            _ => None,
        })
        .collect();
    assert_eq!(
        narrows,
        vec![
            (0, 4, "layer0.gate.input".to_string()),
            (4, 4, "layer0.gate.forget".to_string()),
            (8, 4, "layer0.gate.output".to_string()),
            (12, 4, "layer0.gate.candidate".to_string()),
        ]
    );

    let roles: Vec<Role> = cell
        .template
        .nodes()
        .iter()
        .filter(|node| matches!(node.op, OpKind::Linear(_)))
        .map(|node| node.role)
        .collect();
    assert_eq!(roles, vec![Role::InputProjection, Role::HiddenProjection]);
    Ok(())
}

#[test]
fn unrolled_lstm_shares_parameters_across_clones() -> Result<()> {
    let mut rng = StdRng::seed_from_u64(3);
    let set = LstmCell::unrolled(
        LstmConfig {
            input_size: 3,
            hidden_size: 4,
            layers: 2,
        },
        5,
        &mut rng,
    )?;

    let feeds = set.feed_inputs();
    assert_eq!(feeds.len(), 1);
    assert_eq!(set.template().tensor_name(feeds[0]), "x");

    // Parameter count is per template node, independent of the step count.
    let params = set.parameters();
    assert_eq!(params.len(), 8);
    assert_eq!(params[0].shape().dims(), &[3, 16]);
    assert_eq!(params[1].shape().dims(), &[16]);
    assert_eq!(params[2].shape().dims(), &[4, 16]);
    assert_eq!(params[4].shape().dims(), &[4, 16]);

    let mut keys: Vec<_> = params.iter().map(|p| p.key()).collect();
    keys.sort_by_key(|k| k.0);
    keys.dedup();
    assert_eq!(keys.len(), 8);
    Ok(())
}
