//! Clone sets: a template graph replicated across sequential steps.
//!
//! Every clone shares the template's parameters by reference but owns its own
//! intermediate tensor instances. The clone set is the structure the memory
//! optimizer mutates in place: after the aliasing applier commits, instances
//! with disjoint lifetimes hold handles to the same [`Storage`].

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, ensure, Result};
use rand::Rng;
use serde::Serialize;

use crate::error::structural;
use crate::tensor::{Shape, Storage, Tensor};

use super::node::{NodeId, OpKind, TensorId};
use super::template::TemplateGraph;

/// A lagged cross-clone connection: clone `t` reads `output` of clone
/// `t - lag` through the external input `input`. Clones with too little
/// history bind to a pinned initial-state tensor instead.
#[derive(Debug, Clone, Serialize)]
pub struct Recurrence {
    pub output: TensorId,
    pub input: TensorId,
    pub lag: usize,
    /// Feature width of the carried state, used to size initial tensors.
    pub state_features: usize,
}

/// Which clones of an exported tensor are visible to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExportScope {
    LastClone,
    EveryClone,
}

/// A tensor read by a consumer outside the traced window (the caller or the
/// loss). Exported instances are pinned and never aliased.
#[derive(Debug, Clone, Serialize)]
pub struct Export {
    pub tensor: TensorId,
    pub scope: ExportScope,
}

/// Addresses one tensor instance inside a clone set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Place {
    /// A tensor position inside clone `clone`.
    Step { clone: u32, tensor: TensorId },
    /// An initial-state tensor standing in for missing recurrence history;
    /// `slot` is the clone index that binds it.
    Initial { tensor: TensorId, slot: u32 },
}

/// Distinguishes a tensor's forward value buffer from its gradient buffer.
/// The two have independent lifetimes and independent slot assignments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum TensorKind {
    Value,
    Grad,
}

/// A learned weight or bias shared identically by every clone of a template
/// node. Storage and the gradient-accumulation buffer are fixed for the
/// lifetime of the model and excluded from buffer aliasing.
#[derive(Debug)]
pub struct Parameter {
    name: String,
    key: ParamKey,
    shape: Shape,
    value: Storage,
    grad: Storage,
}

/// Stable parameter identity derived from the parameter path name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamKey(pub u128);

fn param_key(name: &str) -> Result<ParamKey> {
    ensure!(name.is_ascii(), "param name must be ASCII, got '{name}'");
    let hash = blake3::hash(name.as_bytes());
    let raw: [u8; 16] = hash.as_bytes()[0..16]
        .try_into()
        .expect("blake3 hash prefix length mismatch");
    Ok(ParamKey(u128::from_le_bytes(raw)))
}

impl Parameter {
    fn new(name: &str, shape: Shape, init: Vec<f32>) -> Result<Arc<Self>> {
        ensure!(
            init.len() == shape.num_elements(),
            "parameter '{}' init length {} does not match shape {:?}",
            name,
            init.len(),
            shape.dims()
        );
        let grad = Storage::zeros(init.len());
        Ok(Arc::new(Parameter {
            name: name.to_string(),
            key: param_key(name)?,
            shape,
            value: Storage::from_vec(init),
            grad,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> ParamKey {
        self.key
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn value_storage(&self) -> &Storage {
        &self.value
    }

    pub fn grad_storage(&self) -> &Storage {
        &self.grad
    }

    pub fn read_value(&self) -> Result<Vec<f32>> {
        self.value.read(self.shape.num_elements())
    }

    pub fn read_grad(&self) -> Result<Vec<f32>> {
        self.grad.read(self.shape.num_elements())
    }

    pub fn zero_grad(&self) {
        self.grad.fill_prefix(self.shape.num_elements(), 0.0);
    }
}

/// Weight and bias pair owned by one parameter-bearing template node.
#[derive(Debug, Clone)]
pub struct LinearParams {
    pub weight: Arc<Parameter>,
    pub bias: Arc<Parameter>,
}

/// Batch-width configuration re-applied whenever the leading batch dimension
/// changes. Orthogonal to the sharing decision: lifetimes depend on topology,
/// not on row count.
#[derive(Debug, Clone, Copy, Default)]
pub struct BroadcastConfig {
    rows: usize,
}

impl BroadcastConfig {
    pub fn rows(&self) -> usize {
        self.rows
    }
}

/// Per-instance storage bookkeeping: shape discovered at calibration, plus
/// independently aliasable value and gradient buffers.
#[derive(Debug, Clone, Default)]
pub struct TensorSlot {
    pub shape: Option<Shape>,
    pub value: Option<Storage>,
    pub grad: Option<Storage>,
}

#[derive(Debug, Clone)]
struct CloneInstance {
    tensors: Vec<TensorSlot>,
}

/// T structurally identical instances of a template graph with shared
/// parameters and per-clone intermediates.
#[derive(Debug)]
pub struct CloneSet {
    name: String,
    template: TemplateGraph,
    recurrences: Vec<Recurrence>,
    exports: Vec<Export>,
    steps: usize,
    params: BTreeMap<u32, LinearParams>,
    clones: Vec<CloneInstance>,
    initial: BTreeMap<(u32, u32), TensorSlot>,
    broadcast: BroadcastConfig,
    applied_fingerprint: Option<u64>,
}

impl CloneSet {
    /// Replicates `template` across `steps` clones. Parameter-bearing nodes
    /// get freshly initialized parameters shared by every clone; recurrences
    /// are validated against the template's wiring.
    pub fn unroll(
        name: &str,
        template: TemplateGraph,
        recurrences: Vec<Recurrence>,
        steps: usize,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        if steps == 0 {
            return Err(structural(format!(
                "clone set '{name}' requires at least one step"
            )));
        }
        for rec in &recurrences {
            if !template.is_external(rec.input) {
                return Err(structural(format!(
                    "recurrence input '{}' is not an external input of template '{}'",
                    template.tensor_name(rec.input),
                    template.name()
                )));
            }
            if template.producer(rec.output).is_none() {
                return Err(structural(format!(
                    "recurrence output '{}' has no producer in template '{}'",
                    template.tensor_name(rec.output),
                    template.name()
                )));
            }
            if rec.lag == 0 {
                return Err(structural("recurrence lag must be at least one step"));
            }
        }

        let mut params = BTreeMap::new();
        for node in template.nodes() {
            if let OpKind::Linear(spec) = &node.op {
                let path = node
                    .name
                    .as_deref()
                    .ok_or_else(|| structural("parameter-bearing node is missing a name"))?;
                let weight_shape = Shape::new([spec.in_features, spec.out_features]);
                let weight_init =
                    Tensor::randn(weight_shape.clone(), 0.08, rng).data().to_vec();
                let weight =
                    Parameter::new(&format!("{name}.{path}.weight"), weight_shape, weight_init)?;
                let bias = Parameter::new(
                    &format!("{name}.{path}.bias"),
                    Shape::new([spec.out_features]),
                    vec![0.0; spec.out_features],
                )?;
                params.insert(node.id.0, LinearParams { weight, bias });
            }
        }

        let clones = (0..steps)
            .map(|_| CloneInstance {
                tensors: vec![TensorSlot::default(); template.tensor_count()],
            })
            .collect();

        let mut initial = BTreeMap::new();
        for rec in &recurrences {
            for slot in 0..rec.lag.min(steps) {
                initial.insert((rec.input.0, slot as u32), TensorSlot::default());
            }
        }

        Ok(CloneSet {
            name: name.to_string(),
            template,
            recurrences,
            exports: Vec::new(),
            steps,
            params,
            clones,
            initial,
            broadcast: BroadcastConfig::default(),
            applied_fingerprint: None,
        })
    }

    /// Marks a tensor as read by a consumer outside the traced window.
    pub fn export(&mut self, tensor: TensorId, scope: ExportScope) -> Result<()> {
        if self.template.producer(tensor).is_none() {
            return Err(structural(format!(
                "exported tensor '{}' has no producer",
                self.template.tensor_name(tensor)
            )));
        }
        self.exports.push(Export { tensor, scope });
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &TemplateGraph {
        &self.template
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn recurrences(&self) -> &[Recurrence] {
        &self.recurrences
    }

    pub fn exports(&self) -> &[Export] {
        &self.exports
    }

    pub fn rows(&self) -> usize {
        self.broadcast.rows()
    }

    /// External inputs fed by the caller (everything that is not a
    /// recurrence target).
    pub fn feed_inputs(&self) -> Vec<TensorId> {
        self.template
            .inputs()
            .iter()
            .copied()
            .filter(|id| !self.recurrences.iter().any(|rec| rec.input == *id))
            .collect()
    }

    /// All shared parameters, in node order (weight before bias).
    pub fn parameters(&self) -> Vec<Arc<Parameter>> {
        let mut out = Vec::with_capacity(self.params.len() * 2);
        for pair in self.params.values() {
            out.push(Arc::clone(&pair.weight));
            out.push(Arc::clone(&pair.bias));
        }
        out
    }

    pub fn linear_params(&self, node: NodeId) -> Result<LinearParams> {
        self.params
            .get(&node.0)
            .cloned()
            .ok_or_else(|| anyhow!("node {:?} carries no parameters", node))
    }

    pub fn zero_param_grads(&self) {
        for pair in self.params.values() {
            pair.weight.zero_grad();
            pair.bias.zero_grad();
        }
    }

    /// Re-applies the batch-width configuration: records the new row count
    /// and rebinds zeroed initial-state tensors at that width.
    pub fn set_rows(&mut self, rows: usize) -> Result<()> {
        ensure!(rows > 0, "batch must contain at least one row");
        self.broadcast.rows = rows;
        for rec in self.recurrences.clone() {
            for slot in 0..rec.lag.min(self.steps) {
                let shape = Shape::new([rows, rec.state_features]);
                let place = Place::Initial {
                    tensor: rec.input,
                    slot: slot as u32,
                };
                let storage = self.bind_value(place, shape.clone())?;
                storage.fill_prefix(shape.num_elements(), 0.0);
            }
        }
        Ok(())
    }

    /// Resolves the instance a clone actually reads for one of its declared
    /// input positions: its own instance, a lagged clone's output, or a
    /// pinned initial-state tensor.
    pub fn resolve(&self, clone: u32, tensor: TensorId) -> Result<Place> {
        ensure!(
            (clone as usize) < self.steps,
            "clone index {} out of range for {} steps",
            clone,
            self.steps
        );
        if self.template.producer(tensor).is_some() {
            return Ok(Place::Step { clone, tensor });
        }
        if let Some(rec) = self.recurrences.iter().find(|rec| rec.input == tensor) {
            if (clone as usize) >= rec.lag {
                return Ok(Place::Step {
                    clone: clone - rec.lag as u32,
                    tensor: rec.output,
                });
            }
            return Ok(Place::Initial {
                tensor,
                slot: clone,
            });
        }
        Ok(Place::Step { clone, tensor })
    }

    fn slot(&self, place: Place) -> Result<&TensorSlot> {
        match place {
            Place::Step { clone, tensor } => self
                .clones
                .get(clone as usize)
                .and_then(|instance| instance.tensors.get(tensor.0 as usize))
                .ok_or_else(|| anyhow!("instance {:?} out of range", place)),
            Place::Initial { tensor, slot } => self
                .initial
                .get(&(tensor.0, slot))
                .ok_or_else(|| anyhow!("initial instance {:?} not registered", place)),
        }
    }

    fn slot_mut(&mut self, place: Place) -> Result<&mut TensorSlot> {
        match place {
            Place::Step { clone, tensor } => self
                .clones
                .get_mut(clone as usize)
                .and_then(|instance| instance.tensors.get_mut(tensor.0 as usize))
                .ok_or_else(|| anyhow!("instance {:?} out of range", place)),
            Place::Initial { tensor, slot } => self
                .initial
                .get_mut(&(tensor.0, slot))
                .ok_or_else(|| anyhow!("initial instance {:?} not registered", place)),
        }
    }

    /// Records the instance's shape and returns its value storage, allocating
    /// an owned buffer when the instance has none. Aliased storages are kept
    /// and grown in place.
    pub fn bind_value(&mut self, place: Place, shape: Shape) -> Result<Storage> {
        let len = shape.num_elements();
        let slot = self.slot_mut(place)?;
        slot.shape = Some(shape);
        let storage = slot.value.get_or_insert_with(|| Storage::zeros(len));
        storage.ensure_len(len);
        Ok(storage.clone())
    }

    /// Returns the instance's gradient storage and element count; the shape
    /// must already be known from the forward pass.
    pub fn bind_grad(&mut self, place: Place) -> Result<(Storage, usize)> {
        let slot = self.slot_mut(place)?;
        let len = slot
            .shape
            .as_ref()
            .map(Shape::num_elements)
            .ok_or_else(|| anyhow!("gradient requested for unshaped instance {:?}", place))?;
        let storage = slot.grad.get_or_insert_with(|| Storage::zeros(len));
        storage.ensure_len(len);
        Ok((storage.clone(), len))
    }

    /// Overwrites an instance's value with caller-provided data.
    pub fn write_value(&mut self, place: Place, shape: Shape, data: &[f32]) -> Result<()> {
        ensure!(
            data.len() == shape.num_elements(),
            "feed data length {} does not match shape {:?}",
            data.len(),
            shape.dims()
        );
        let storage = self.bind_value(place, shape)?;
        storage.write(data);
        Ok(())
    }

    pub fn shape_of(&self, place: Place) -> Result<Shape> {
        self.slot(place)?
            .shape
            .clone()
            .ok_or_else(|| anyhow!("instance {:?} has no calibrated shape", place))
    }

    pub fn value_data(&self, place: Place) -> Result<(Vec<f32>, Shape)> {
        let slot = self.slot(place)?;
        let shape = slot
            .shape
            .clone()
            .ok_or_else(|| anyhow!("instance {:?} has no calibrated shape", place))?;
        let storage = slot
            .value
            .as_ref()
            .ok_or_else(|| anyhow!("instance {:?} has no value storage", place))?;
        Ok((storage.read(shape.num_elements())?, shape))
    }

    pub fn grad_data(&self, place: Place) -> Result<(Vec<f32>, Shape)> {
        let slot = self.slot(place)?;
        let shape = slot
            .shape
            .clone()
            .ok_or_else(|| anyhow!("instance {:?} has no calibrated shape", place))?;
        let storage = slot
            .grad
            .as_ref()
            .ok_or_else(|| anyhow!("instance {:?} has no gradient storage", place))?;
        Ok((storage.read(shape.num_elements())?, shape))
    }

    /// Copies one clone's tensor value out as a host tensor.
    pub fn value_of(&self, clone: u32, tensor: TensorId) -> Result<Tensor> {
        let (data, shape) = self.value_data(Place::Step { clone, tensor })?;
        Tensor::from_vec(shape, data)
    }

    /// The concrete instances covered by the export list.
    pub fn export_places(&self) -> Vec<Place> {
        let mut places = Vec::new();
        for export in &self.exports {
            let clones: Vec<u32> = match export.scope {
                ExportScope::LastClone => vec![(self.steps - 1) as u32],
                ExportScope::EveryClone => (0..self.steps as u32).collect(),
            };
            for clone in clones {
                places.push(Place::Step {
                    clone,
                    tensor: export.tensor,
                });
            }
        }
        places
    }

    /// True once every produced tensor instance has a calibrated shape.
    /// External input positions are skipped: recurrence targets are never
    /// bound in place (reads resolve to the producing clone or an initial
    /// tensor) and feeds are rebound on every run.
    pub fn is_calibrated(&self) -> bool {
        self.clones.iter().all(|instance| {
            instance.tensors.iter().enumerate().all(|(idx, slot)| {
                self.template.is_external(TensorId(idx as u32)) || slot.shape.is_some()
            })
        })
    }

    pub fn applied_fingerprint(&self) -> Option<u64> {
        self.applied_fingerprint
    }

    pub(crate) fn set_applied_fingerprint(&mut self, fingerprint: u64) {
        self.applied_fingerprint = Some(fingerprint);
    }

    /// Rewrites one instance's buffer to shared slot storage. Used only by
    /// the aliasing applier after the full assignment has been validated.
    pub(crate) fn set_storage(
        &mut self,
        place: Place,
        kind: TensorKind,
        storage: Storage,
    ) -> Result<()> {
        let slot = self.slot_mut(place)?;
        match kind {
            TensorKind::Value => slot.value = Some(storage),
            TensorKind::Grad => slot.grad = Some(storage),
        }
        Ok(())
    }
}
