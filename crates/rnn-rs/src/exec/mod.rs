//! Reference executor: forward and backward over unrolled clone sets.
//!
//! Execution order is deterministic and total: forward walks sets in index
//! order, clones in step order, nodes in template order; backward walks the
//! exact reverse. The calibration runner records this order as an
//! [`ExecutionTrace`]; training runs skip recording.

use std::collections::{BTreeMap, HashSet};

use anyhow::{anyhow, bail, ensure, Result};

use crate::graph::{CloneSet, OpKind, Place, TensorId, TensorKind};
use crate::memory::trace::{ExecutionTrace, InstanceKey, Phase, TraceEvent};
use crate::ops;
use crate::tensor::Tensor;

/// Seeds the gradient of an exported tensor from its forward value.
pub trait Criterion {
    fn seed(&self, values: &[f32], grad: &mut [f32]) -> Result<()>;
}

/// Treats the loss as the plain sum of every exported element, giving a
/// gradient of ones. Used by calibration, where only the trace matters.
pub struct SumCriterion;

impl Criterion for SumCriterion {
    fn seed(&self, _values: &[f32], grad: &mut [f32]) -> Result<()> {
        grad.fill(1.0);
        Ok(())
    }
}

/// Caller-provided feed tensors, keyed by (set index, clone index, input).
/// All feeds must agree on the leading batch dimension.
#[derive(Debug, Default)]
pub struct SampleBatch {
    feeds: BTreeMap<(usize, usize, TensorId), Tensor>,
    rows: Option<usize>,
}

impl SampleBatch {
    pub fn new() -> Self {
        SampleBatch::default()
    }

    pub fn feed(&mut self, set: usize, step: usize, tensor: TensorId, data: Tensor) -> Result<()> {
        match self.rows {
            Some(rows) => ensure!(
                data.rows() == rows,
                "feed has {} rows but the batch is {} rows wide",
                data.rows(),
                rows
            ),
            None => self.rows = Some(data.rows()),
        }
        self.feeds.insert((set, step, tensor), data);
        Ok(())
    }

    pub fn get(&self, set: usize, step: usize, tensor: TensorId) -> Option<&Tensor> {
        self.feeds.get(&(set, step, tensor))
    }

    pub fn rows(&self) -> Result<usize> {
        self.rows
            .ok_or_else(|| anyhow!("sample batch contains no feeds"))
    }

    /// Copies the batch down to its first `rows` rows.
    pub fn shrunk(&self, rows: usize) -> Result<SampleBatch> {
        let mut out = SampleBatch::new();
        for (&(set, step, tensor), data) in &self.feeds {
            out.feed(set, step, tensor, data.first_rows(rows)?)?;
        }
        Ok(out)
    }
}

struct GradTracker {
    ready: HashSet<InstanceKey>,
}

impl GradTracker {
    fn new() -> Self {
        GradTracker {
            ready: HashSet::new(),
        }
    }

    /// Returns the gradient buffer for `key`, zeroing it on first touch so
    /// aliased storage never leaks a previous occupant's values.
    fn prepare(
        &mut self,
        set: &mut CloneSet,
        key: InstanceKey,
        place: Place,
    ) -> Result<(crate::tensor::Storage, usize, bool)> {
        let (storage, len) = set.bind_grad(place)?;
        let first = self.ready.insert(key);
        if first {
            storage.fill_prefix(len, 0.0);
        }
        Ok((storage, len, first))
    }
}

fn value_key(graph: u16, place: Place) -> InstanceKey {
    InstanceKey {
        graph,
        place,
        kind: TensorKind::Value,
    }
}

fn grad_key(graph: u16, place: Place) -> InstanceKey {
    InstanceKey {
        graph,
        place,
        kind: TensorKind::Grad,
    }
}

/// Runs forward and backward over every set and returns the trace when
/// `record` is set. Parameter gradients accumulate into their fixed buffers
/// and never appear in the trace.
pub fn run(
    sets: &mut [CloneSet],
    batch: &SampleBatch,
    criterion: &dyn Criterion,
    record: bool,
) -> Result<ExecutionTrace> {
    ensure!(!sets.is_empty(), "nothing to execute");
    let rows = batch.rows()?;
    let mut trace = ExecutionTrace::default();

    // Forward.
    for (gi, set) in sets.iter_mut().enumerate() {
        let graph = gi as u16;
        if set.rows() != rows {
            set.set_rows(rows)?;
        }
        let feed_inputs = set.feed_inputs();
        for clone in 0..set.steps() as u32 {
            for &input in &feed_inputs {
                let data = batch.get(gi, clone as usize, input).ok_or_else(|| {
                    anyhow!(
                        "missing feed for input '{}' at set {} step {}",
                        set.template().tensor_name(input),
                        gi,
                        clone
                    )
                })?;
                set.write_value(
                    Place::Step {
                        clone,
                        tensor: input,
                    },
                    data.shape().clone(),
                    data.data(),
                )?;
            }
            forward_clone(set, graph, clone, record, &mut trace)?;
        }
    }

    // Seed exported gradients.
    let mut grads = GradTracker::new();
    for (gi, set) in sets.iter_mut().enumerate() {
        let graph = gi as u16;
        for place in set.export_places() {
            let key = grad_key(graph, place);
            let (storage, len, _) = grads.prepare(set, key, place)?;
            let (values, _) = set.value_data(place)?;
            let mut seeded = vec![0.0; len];
            criterion.seed(&values, &mut seeded)?;
            storage.write(&seeded);
        }
    }

    // Backward, in exact reverse of the forward order.
    for gi in (0..sets.len()).rev() {
        let graph = gi as u16;
        let set = &mut sets[gi];
        for clone in (0..set.steps() as u32).rev() {
            backward_clone(set, graph, clone, &mut grads, record, &mut trace)?;
        }
    }

    Ok(trace)
}

fn forward_clone(
    set: &mut CloneSet,
    graph: u16,
    clone: u32,
    record: bool,
    trace: &mut ExecutionTrace,
) -> Result<()> {
    let nodes: Vec<_> = set.template().nodes().to_vec();
    for node in &nodes {
        let mut reads = Vec::with_capacity(node.inputs.len());
        let mut in_data = Vec::with_capacity(node.inputs.len());
        let mut in_shapes = Vec::with_capacity(node.inputs.len());
        for &input in &node.inputs {
            let place = set.resolve(clone, input)?;
            let (data, shape) = set.value_data(place)?;
            reads.push(value_key(graph, place));
            in_data.push(data);
            in_shapes.push(shape);
        }

        let out_shape = ops::infer_output_shape(&node.op, &in_shapes)?;
        let out_len = out_shape.num_elements();
        let mut out = vec![0.0; out_len];
        match &node.op {
            OpKind::Linear(spec) => {
                let params = set.linear_params(node.id)?;
                let w = params.weight.read_value()?;
                let b = params.bias.read_value()?;
                ops::linear_forward(
                    &in_data[0],
                    in_shapes[0].rows(),
                    spec.in_features,
                    spec.out_features,
                    &w,
                    &b,
                    &mut out,
                );
            }
            OpKind::Add => ops::add_forward(&in_data[0], &in_data[1], &mut out),
            OpKind::Mul => ops::mul_forward(&in_data[0], &in_data[1], &mut out),
            OpKind::Sigmoid => ops::sigmoid_forward(&in_data[0], &mut out),
            OpKind::Tanh => ops::tanh_forward(&in_data[0], &mut out),
            OpKind::Narrow(spec) => ops::narrow_forward(
                &in_data[0],
                in_shapes[0].rows(),
                in_shapes[0].dims()[1],
                spec,
                &mut out,
            ),
        }

        let out_place = Place::Step {
            clone,
            tensor: node.output(),
        };
        let storage = set.bind_value(out_place, out_shape)?;
        storage.write(&out);

        if record {
            trace.push(TraceEvent {
                graph,
                clone,
                node: node.id,
                phase: Phase::Forward,
                reads,
                writes: vec![(value_key(graph, out_place), out_len)],
            });
        }
    }
    Ok(())
}

fn backward_clone(
    set: &mut CloneSet,
    graph: u16,
    clone: u32,
    grads: &mut GradTracker,
    record: bool,
    trace: &mut ExecutionTrace,
) -> Result<()> {
    let nodes: Vec<_> = set.template().nodes().to_vec();
    for node in nodes.iter().rev() {
        let out_place = Place::Step {
            clone,
            tensor: node.output(),
        };
        let out_key = grad_key(graph, out_place);
        let mut writes = Vec::new();
        let (_, out_len, first) = grads.prepare(set, out_key, out_place)?;
        if first {
            // No downstream consumer seeded this gradient; it stays zero but
            // still propagates so the trace covers every instance.
            writes.push((out_key, out_len));
        }
        let (dy, _) = set.grad_data(out_place)?;
        let mut reads = vec![out_key];

        let in_places: Vec<Place> = node
            .inputs
            .iter()
            .map(|&input| set.resolve(clone, input))
            .collect::<Result<_>>()?;

        match &node.op {
            OpKind::Linear(spec) => {
                let x_place = in_places[0];
                let (x, x_shape) = set.value_data(x_place)?;
                reads.push(value_key(graph, x_place));
                let rows = x_shape.rows();

                let params = set.linear_params(node.id)?;
                let w = params.weight.read_value()?;
                let mut dx = vec![0.0; x.len()];
                let mut dw = vec![0.0; w.len()];
                let mut db = vec![0.0; spec.out_features];
                ops::linear_backward(
                    &x,
                    rows,
                    spec.in_features,
                    spec.out_features,
                    &w,
                    &dy,
                    &mut dx,
                    &mut dw,
                    &mut db,
                );
                params.weight.grad_storage().accumulate(&dw)?;
                params.bias.grad_storage().accumulate(&db)?;

                let dx_key = grad_key(graph, x_place);
                let (storage, len, _) = grads.prepare(set, dx_key, x_place)?;
                storage.accumulate(&dx)?;
                writes.push((dx_key, len));
            }
            OpKind::Add => {
                for &place in &in_places {
                    let key = grad_key(graph, place);
                    let (storage, len, _) = grads.prepare(set, key, place)?;
                    let mut dx = vec![0.0; len];
                    ops::add_backward(&dy, &mut dx);
                    storage.accumulate(&dx)?;
                    writes.push((key, len));
                }
            }
            OpKind::Mul => {
                for (idx, &place) in in_places.iter().enumerate() {
                    let other_place = in_places[1 - idx];
                    let (other, _) = set.value_data(other_place)?;
                    reads.push(value_key(graph, other_place));
                    let key = grad_key(graph, place);
                    let (storage, len, _) = grads.prepare(set, key, place)?;
                    let mut dx = vec![0.0; len];
                    ops::mul_backward(&dy, &other, &mut dx);
                    storage.accumulate(&dx)?;
                    writes.push((key, len));
                }
            }
            OpKind::Sigmoid | OpKind::Tanh => {
                let (y, _) = set.value_data(out_place)?;
                reads.push(value_key(graph, out_place));
                let place = in_places[0];
                let key = grad_key(graph, place);
                let (storage, len, _) = grads.prepare(set, key, place)?;
                let mut dx = vec![0.0; len];
                if matches!(node.op, OpKind::Sigmoid) {
                    ops::sigmoid_backward(&dy, &y, &mut dx);
                } else {
                    ops::tanh_backward(&dy, &y, &mut dx);
                }
                storage.accumulate(&dx)?;
                writes.push((key, len));
            }
            OpKind::Narrow(spec) => {
                let place = in_places[0];
                let shape = set.shape_of(place)?;
                if shape.rank() != 2 {
                    bail!("narrow backward expects a rank-2 source");
                }
                let key = grad_key(graph, place);
                let (storage, len, _) = grads.prepare(set, key, place)?;
                let mut dx = vec![0.0; len];
                ops::narrow_backward(&dy, shape.rows(), shape.dims()[1], spec, &mut dx);
                storage.accumulate(&dx)?;
                writes.push((key, len));
            }
        }

        if record {
            trace.push(TraceEvent {
                graph,
                clone,
                node: node.id,
                phase: Phase::Backward,
                reads,
                writes,
            });
        }
    }
    Ok(())
}
