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

use crate::TensorParallelError;
use tch::nn::Embedding;
use tch::{Device, Tensor};

/// Token embeddings of a model input with its batch and sequence dimensions
pub(crate) struct InputEmbeddings {
    pub(crate) embeddings: Tensor,
    pub(crate) batch_size: i64,
    pub(crate) sequence_length: i64,
    pub(crate) device: Device,
}

/// Resolves the input of a decoder from either token ids (looked up in `embeddings_matrix`)
/// or pre-computed embeddings. Exactly one of the two must be given.
pub(crate) fn embed_inputs(
    input_ids: Option<&Tensor>,
    input_embeds: Option<&Tensor>,
    embeddings_matrix: &Embedding,
) -> Result<InputEmbeddings, TensorParallelError> {
    let (embeddings, device) = match (input_ids, input_embeds) {
        (Some(input_ids), None) => (input_ids.apply(embeddings_matrix), input_ids.device()),
        (None, Some(input_embeds)) => (input_embeds.shallow_clone(), input_embeds.device()),
        (Some(_), Some(_)) => {
            return Err(TensorParallelError::ValueError(
                "Only one of input ids or input embeddings may be set".into(),
            ));
        }
        (None, None) => {
            return Err(TensorParallelError::ValueError(
                "At least one of input ids or input embeddings must be set".into(),
            ));
        }
    };
    match embeddings.size().as_slice() {
        &[batch_size, sequence_length, _] => Ok(InputEmbeddings {
            embeddings,
            batch_size,
            sequence_length,
            device,
        }),
        shape => Err(TensorParallelError::ValueError(format!(
            "Expected inputs of shape (batch size, sequence length), got embeddings of shape {:?}",
            shape
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{nn, Kind};

    #[test]
    fn exactly_one_input_is_required() -> Result<(), TensorParallelError> {
        let vs = nn::VarStore::new(Device::Cpu);
        let wte = nn::embedding(vs.root() / "wte", 10, 4, Default::default());
        let input_ids = Tensor::from_slice(&[1i64, 2, 3]).view([1, 3]);
        let input_embeds = Tensor::zeros([2, 5, 4], (Kind::Float, Device::Cpu));

        let from_ids = embed_inputs(Some(&input_ids), None, &wte)?;
        assert_eq!((from_ids.batch_size, from_ids.sequence_length), (1, 3));
        let from_embeds = embed_inputs(None, Some(&input_embeds), &wte)?;
        assert_eq!((from_embeds.batch_size, from_embeds.sequence_length), (2, 5));

        assert!(embed_inputs(Some(&input_ids), Some(&input_embeds), &wte).is_err());
        assert!(embed_inputs(None, None, &wte).is_err());
        Ok(())
    }
}
