//! Stacked LSTM cell expressed as a template graph.
//!
//! Each layer projects its input and previous hidden state into one fused
//! `4H`-wide tensor and slices the gates out positionally, in the fixed
//! column order: input gate, forget gate, output gate, candidate. Both the
//! hidden and the cell state recur with a lag of one step.

use anyhow::Result;
use rand::Rng;

use crate::graph::{CloneSet, ExportScope, Recurrence, Role, TemplateGraph, TensorId};

#[derive(Debug, Clone, Copy)]
pub struct LstmConfig {
    pub input_size: usize,
    pub hidden_size: usize,
    pub layers: usize,
}

/// A built stacked-LSTM template plus the wiring a clone set needs.
pub struct LstmCell {
    pub template: TemplateGraph,
    pub recurrences: Vec<Recurrence>,
    /// The external sequence input of layer 0.
    pub input: TensorId,
    /// The top layer's hidden state.
    pub output: TensorId,
}

impl LstmCell {
    pub fn build(config: LstmConfig) -> Result<LstmCell> {
        let hidden = config.hidden_size;
        let mut builder = TemplateGraph::builder("lstm");
        let input = builder.input("x");

        let mut recurrences = Vec::with_capacity(config.layers * 2);
        let mut layer_input = input;
        let mut in_features = config.input_size;
        let mut top = input;

        for layer in 0..config.layers {
            let h_prev = builder.input(&format!("layer{layer}.h_prev"));
            let c_prev = builder.input(&format!("layer{layer}.c_prev"));

            let i2h = builder.linear(
                &format!("layer{layer}.i2h"),
                Role::InputProjection,
                layer_input,
                in_features,
                4 * hidden,
            );
            let h2h = builder.linear(
                &format!("layer{layer}.h2h"),
                Role::HiddenProjection,
                h_prev,
                hidden,
                4 * hidden,
            );
            let fused = builder.add(&format!("layer{layer}.fused"), i2h, h2h);

            let i_pre = builder.narrow(&format!("layer{layer}.gate.input"), fused, 0, hidden);
            let f_pre = builder.narrow(&format!("layer{layer}.gate.forget"), fused, hidden, hidden);
            let o_pre =
                builder.narrow(&format!("layer{layer}.gate.output"), fused, 2 * hidden, hidden);
            let g_pre = builder.narrow(
                &format!("layer{layer}.gate.candidate"),
                fused,
                3 * hidden,
                hidden,
            );

            let i = builder.sigmoid(&format!("layer{layer}.i"), i_pre);
            let f = builder.sigmoid(&format!("layer{layer}.f"), f_pre);
            let o = builder.sigmoid(&format!("layer{layer}.o"), o_pre);
            let g = builder.tanh(&format!("layer{layer}.g"), g_pre);

            let fc = builder.mul(&format!("layer{layer}.fc"), f, c_prev);
            let ig = builder.mul(&format!("layer{layer}.ig"), i, g);
            let c = builder.add(&format!("layer{layer}.c"), fc, ig);
            let ct = builder.tanh(&format!("layer{layer}.ct"), c);
            let h = builder.mul(&format!("layer{layer}.h"), o, ct);

            recurrences.push(Recurrence {
                output: h,
                input: h_prev,
                lag: 1,
                state_features: hidden,
            });
            recurrences.push(Recurrence {
                output: c,
                input: c_prev,
                lag: 1,
                state_features: hidden,
            });

            layer_input = h;
            in_features = hidden;
            top = h;
        }

        Ok(LstmCell {
            template: builder.finish()?,
            recurrences,
            input,
            output: top,
        })
    }

    /// Unrolls the cell across `steps` clones and exports the top hidden
    /// state of the final clone.
    pub fn unrolled(config: LstmConfig, steps: usize, rng: &mut impl Rng) -> Result<CloneSet> {
        let cell = LstmCell::build(config)?;
        let output = cell.output;
        let mut set = CloneSet::unroll("lstm", cell.template, cell.recurrences, steps, rng)?;
        set.export(output, ExportScope::LastClone)?;
        Ok(set)
    }
}
