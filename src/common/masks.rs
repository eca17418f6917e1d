// Copyright 2021 Guillaume Becquin
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use tch::{Device, Kind, Tensor};

/// Value added to the attention scores of padding positions
pub(crate) const PADDING_MASK_VALUE: f64 = -10000.0;

/// Turns a `(batch, key_length)` padding mask (1 for tokens to attend, 0 for padding) into an
/// additive mask of shape `(batch, 1, 1, key_length)` broadcasting over heads and queries.
pub(crate) fn additive_attention_mask(
    attention_mask: &Tensor,
    batch_size: i64,
    kind: Kind,
) -> Tensor {
    let attention_mask = attention_mask
        .view([batch_size, -1])
        .unsqueeze(1)
        .unsqueeze(1)
        .to_kind(kind);
    (1.0 - attention_mask) * PADDING_MASK_VALUE
}

/// Positions `past_length..past_length + sequence_length`, shaped `(1, sequence_length)`
pub(crate) fn incremental_position_ids(
    past_length: i64,
    sequence_length: i64,
    device: Device,
) -> Tensor {
    Tensor::arange_start(past_length, past_length + sequence_length, (Kind::Int64, device))
        .unsqueeze(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn padding_positions_are_masked() {
        let mask = Tensor::from_slice(&[1i64, 1, 0, 1, 0, 0]).view([2, 3]);
        let additive = additive_attention_mask(&mask, 2, Kind::Float);
        assert_eq!(additive.size(), [2, 1, 1, 3]);
        let expected = Tensor::from_slice(&[0f32, 0., -10000., 0., -10000., -10000.])
            .view([2, 1, 1, 3]);
        assert!(additive.allclose(&expected, 1e-6, 1e-6, false));
    }

    #[test]
    fn positions_continue_after_the_cache() {
        let positions = incremental_position_ids(5, 3, Device::Cpu);
        assert_eq!(positions.size(), [1, 3]);
        assert_eq!(Vec::<i64>::try_from(positions.view([-1])).ok(), Some(vec![5, 6, 7]));
    }
}
