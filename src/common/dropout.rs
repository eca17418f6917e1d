// Copyright 2019 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tch::nn::ModuleT;
use tch::Tensor;

/// Dropout with a probability fixed at model construction.
/// Sharded attention keeps the probability of the full layer, so the layer carries no shape.
#[derive(Debug, Clone, Copy)]
pub struct Dropout {
    probability: f64,
}

impl Dropout {
    pub fn new(probability: f64) -> Dropout {
        Dropout { probability }
    }

    /// Dropout probability from an optional configuration field
    pub fn from_config(probability: Option<f64>, default: f64) -> Dropout {
        Dropout::new(probability.unwrap_or(default))
    }
}

impl ModuleT for Dropout {
    fn forward_t(&self, input: &Tensor, train: bool) -> Tensor {
        if !train || self.probability == 0.0 {
            input.shallow_clone()
        } else {
            input.dropout(self.probability, train)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind};

    #[test]
    fn inference_is_the_identity() {
        let input = Tensor::ones([4, 8], (Kind::Float, Device::Cpu));
        let dropout = Dropout::from_config(Some(0.5), 0.1);
        assert!(input.apply_t(&dropout, false).equal(&input));
        assert!(input.apply_t(&Dropout::new(0.0), true).equal(&input));
    }
}
