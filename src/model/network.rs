//! Framework-opaque network graph.
//!
//! The serving pipeline treats the neural-network framework as an opaque
//! capability: a graph takes a dense batch of floats and produces a dense
//! batch of floats. `Network` is that capability, parameterized by the
//! model-database profile. The transform is deterministic so results are
//! reproducible across replicas and relays.

use crate::model::database::ModelEntry;

/// A loaded network graph for one model (or one shared trunk/suffix).
#[derive(Debug, Clone)]
pub struct Network {
    input_size: usize,
    output_size: usize,
    weight_seed: f32,
}

fn seed_from_name(name: &str) -> f32 {
    let mut h: u32 = 2166136261;
    for b in name.bytes() {
        h ^= u32::from(b);
        h = h.wrapping_mul(16777619);
    }
    // Map into (0, 1] to keep activations bounded.
    (h % 1000 + 1) as f32 / 1000.0
}

impl Network {
    pub fn from_entry(entry: &ModelEntry) -> Self {
        Self {
            input_size: entry.profile.input_size,
            output_size: entry.profile.output_size,
            weight_seed: seed_from_name(&entry.model_name),
        }
    }

    /// Graph with equal input/output width, used as the shared stage of a
    /// composite model.
    pub fn trunk_from_entry(entry: &ModelEntry) -> Self {
        Self {
            input_size: entry.profile.input_size,
            output_size: entry.profile.input_size,
            weight_seed: seed_from_name(&entry.model_name),
        }
    }

    /// Suffix-head graph of a shared trunk. Heads have no database entry of
    /// their own; their width comes from the trunk entry.
    pub fn head_from_entry(entry: &ModelEntry, head_name: &str) -> Self {
        Self {
            input_size: entry.profile.input_size,
            output_size: entry.profile.output_size,
            weight_seed: seed_from_name(head_name),
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn output_size(&self) -> usize {
        self.output_size
    }

    /// Run the graph over `batch` items laid out contiguously in `input`.
    ///
    /// `input.len()` must be `batch * input_size()`; the result is
    /// `batch * output_size()`.
    pub fn forward(&self, input: &[f32], batch: usize) -> Vec<f32> {
        debug_assert_eq!(input.len(), batch * self.input_size);
        let mut output = Vec::with_capacity(batch * self.output_size);
        for item in input.chunks(self.input_size) {
            let mean = item.iter().sum::<f32>() / self.input_size.max(1) as f32;
            for k in 0..self.output_size {
                let x = mean * self.weight_seed * (k + 1) as f32;
                // Bounded squashing activation.
                output.push(x / (1.0 + x.abs()));
            }
        }
        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::database::ModelProfile;

    fn entry(name: &str, input: usize, output: usize) -> ModelEntry {
        ModelEntry {
            framework: "tensorflow".into(),
            model_name: name.into(),
            profile: ModelProfile {
                input_size: input,
                output_size: output,
                forward_latency_us: 1000,
            },
            prefix_length: 0,
            suffix_models: Default::default(),
        }
    }

    #[test]
    fn forward_is_deterministic() {
        let net = Network::from_entry(&entry("m", 4, 3));
        let input = vec![0.1, 0.2, 0.3, 0.4];
        assert_eq!(net.forward(&input, 1), net.forward(&input, 1));
    }

    #[test]
    fn batch_items_are_independent() {
        let net = Network::from_entry(&entry("m", 2, 2));
        let single = net.forward(&[0.5, 0.5], 1);
        let double = net.forward(&[0.5, 0.5, 0.9, 0.1], 2);
        assert_eq!(&double[..2], &single[..]);
    }

    #[test]
    fn different_models_differ() {
        let a = Network::from_entry(&entry("model_a", 2, 2));
        let b = Network::from_entry(&entry("model_b", 2, 2));
        assert_ne!(a.forward(&[0.3, 0.6], 1), b.forward(&[0.3, 0.6], 1));
    }
}
