// Copyright 2021 The Eleuther AI and HuggingFace Inc. team. All rights reserved.
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

//! Blocked local attention helpers.
//!
//! The block length search and the window slicing are written without data-dependent control
//! flow (masked reductions, `arange` + `index_select` + `permute`), so that they record into a
//! static graph when traced for export.

use crate::TensorParallelError;
use tch::{Device, Kind, Tensor};
use tracing::trace;

/// Largest block length dividing the sequence length, kept on device.
///
/// Candidates are `[1, window_size)`. Remainders are computed for every candidate at once,
/// candidates with a non-zero remainder are masked to 0 and the maximum of the masked set is
/// the block length.
///
/// # Arguments
///
/// * `sequence_length` - 0-dimensional integer tensor holding the sequence length
/// * `window_size` - exclusive upper bound of the block length
///
/// # Returns
///
/// * `(block_length, num_blocks)` as 0-dimensional `Int64` tensors
pub fn block_length_and_num_blocks_tensors(
    sequence_length: &Tensor,
    window_size: i64,
) -> Result<(Tensor, Tensor), TensorParallelError> {
    if window_size <= 1 {
        return Err(TensorParallelError::NoValidWindowError {
            sequence_length: sequence_length.int64_value(&[]),
            window_size,
        });
    }
    let sequence_length = sequence_length.to_kind(Kind::Int64);
    let candidates = Tensor::arange_start(1, window_size, (Kind::Int64, sequence_length.device()));
    let remainders = sequence_length.remainder_tensor(&candidates);
    let divisors = &candidates * remainders.eq(0).to_kind(Kind::Int64);
    let largest_divisor = divisors.max();
    let num_blocks = sequence_length.floor_divide(&largest_divisor);
    Ok((largest_divisor, num_blocks))
}

/// Splits a sequence into blocks for local attention.
///
/// Returns the largest block length in `[1, window_size)` dividing `sequence_length`, and the
/// resulting number of blocks.
///
/// # Errors
///
/// * `NoValidWindowError` if no candidate divides the sequence length (`window_size <= 1`)
/// * `ValueError` if the sequence length is not positive
///
/// # Example
///
/// ```
/// use rust_tensor_parallel::gpt_neo::get_block_length_and_num_blocks;
/// # fn main() -> Result<(), rust_tensor_parallel::TensorParallelError> {
/// assert_eq!(get_block_length_and_num_blocks(12, 10)?, (6, 2));
/// assert_eq!(get_block_length_and_num_blocks(7, 5)?, (1, 7));
/// # Ok(())
/// # }
/// ```
pub fn get_block_length_and_num_blocks(
    sequence_length: i64,
    window_size: i64,
) -> Result<(i64, i64), TensorParallelError> {
    if sequence_length < 1 {
        return Err(TensorParallelError::ValueError(format!(
            "Sequence length must be positive, got {}",
            sequence_length
        )));
    }
    let sequence_length_tensor =
        Tensor::scalar_tensor(sequence_length, (Kind::Int64, Device::Cpu));
    let (block_length, num_blocks) =
        block_length_and_num_blocks_tensors(&sequence_length_tensor, window_size)?;
    let block_length = block_length.int64_value(&[]);
    if block_length < 1 {
        return Err(TensorParallelError::NoValidWindowError {
            sequence_length,
            window_size,
        });
    }
    let num_blocks = num_blocks.int64_value(&[]);
    trace!(
        sequence_length,
        window_size,
        block_length,
        num_blocks,
        "resolved local attention blocks"
    );
    Ok((block_length, num_blocks))
}

/// Sliding windows of `size` elements taken every `step` elements along `dimension`.
///
/// Produces the same result as `Tensor::unfold`: the windowed dimension holds
/// `floor((extent - size) / step) + 1` windows and a new trailing dimension of length `size`
/// holds the window content. Built from indexing and permutation operations only.
/// When `size` exceeds the extent, the windowed dimension has length 0.
///
/// # Arguments
///
/// * `input` - tensor to slice
/// * `dimension` - dimension to slide along (negative values index from the end)
/// * `size` - window length
/// * `step` - distance between the starts of two consecutive windows
pub fn unfold(
    input: &Tensor,
    dimension: i64,
    size: i64,
    step: i64,
) -> Result<Tensor, TensorParallelError> {
    if size < 1 || step < 1 {
        return Err(TensorParallelError::ValueError(format!(
            "Window size and step must be positive, got size {} and step {}",
            size, step
        )));
    }
    let shape = input.size();
    let rank = shape.len() as i64;
    let dimension = if dimension < 0 {
        dimension + rank
    } else {
        dimension
    };
    if dimension < 0 || dimension >= rank {
        return Err(TensorParallelError::ValueError(format!(
            "Dimension out of range for a tensor of rank {}",
            rank
        )));
    }
    let dim = dimension as usize;
    let extent = shape[dim];
    let num_windows = if size > extent {
        0
    } else {
        (extent - size) / step + 1
    };

    let device = input.device();
    let low_indices = Tensor::arange_start_step(0, num_windows * step, step, (Kind::Int64, device));
    let indices =
        Tensor::arange(size, (Kind::Int64, device)).unsqueeze(0) + low_indices.unsqueeze(1);

    let mut sliced_shape = shape.clone();
    sliced_shape.splice(dim..=dim, [num_windows, size]);
    let sliced = input
        .index_select(dimension, &indices.view([-1]))
        .reshape(sliced_shape.as_slice());

    let mut permutation = (0..=rank).collect::<Vec<i64>>();
    let window_dim = permutation.remove(dim + 1);
    permutation.push(window_dim);

    Ok(sliced.permute(permutation.as_slice()))
}

/// Reshapes the sequence dimension (dim 1) of a `(batch, sequence[, hidden])` tensor into
/// `(dim_factor_1, dim_factor_2)`.
pub fn split_sequence_length_dim_to(
    input_tensor: &Tensor,
    dim_factor_1: i64,
    dim_factor_2: i64,
    hidden_size: i64,
) -> Result<Tensor, TensorParallelError> {
    let batch_size = input_tensor.size()[0];
    let mut split_dim_shape = Vec::from([batch_size, dim_factor_1, dim_factor_2]);

    Ok(match input_tensor.size().len() {
        3 => {
            split_dim_shape.push(hidden_size);
            input_tensor.reshape(split_dim_shape.as_slice())
        }
        2 => input_tensor.reshape(split_dim_shape.as_slice()),
        _ => {
            return Err(TensorParallelError::ValueError(format!(
                "Invalid tensor rank, expected 2 or 3, got {}",
                input_tensor.size().len()
            )));
        }
    })
}

/// Gathers, for every block of `block_length` positions, the block itself preceded by the
/// `window_size` positions before it. The sequence (dim 1) is left-padded with `window_size`
/// zeros so that the first blocks look back into padding.
///
/// # Returns
///
/// * `(batch, num_blocks, window_size + block_length)` for a 2-dimensional input
/// * `(batch, num_blocks, window_size + block_length, hidden)` for a 3-dimensional input if
///   `is_key_value`, `(batch, num_blocks, hidden, window_size + block_length)` otherwise
pub fn look_back(
    input_tensor: &Tensor,
    block_length: i64,
    window_size: i64,
    is_key_value: bool,
) -> Result<Tensor, TensorParallelError> {
    let padding_size = match input_tensor.size().len() {
        3 => [0, 0, window_size, 0].to_vec(),
        2 => [window_size, 0].to_vec(),
        _ => {
            return Err(TensorParallelError::ValueError(format!(
                "Invalid tensor rank, expected 2 or 3, got {}",
                input_tensor.size().len()
            )));
        }
    };

    let padded_tensor = input_tensor.pad(padding_size.as_slice(), "constant", 0f64);
    let padded_tensor = unfold(&padded_tensor, 1, window_size + block_length, block_length)?;
    Ok(if is_key_value {
        padded_tensor.transpose(-2, -1)
    } else {
        padded_tensor
    })
}

/// Boolean mask for blocked local attention, of shape
/// `(batch, num_blocks, 1, block_length, window_size + block_length)`.
///
/// A query position attends to a key position if the key is not in the future, lies strictly
/// less than `window_size` positions in the past, is not padding introduced by `look_back`
/// and is not masked by `attention_mask` (`(batch, sequence)`, 1 for tokens to attend).
pub fn create_local_attention_mask(
    batch_size: i64,
    seq_length: i64,
    window_size: i64,
    device: Device,
    attention_mask: Option<&Tensor>,
) -> Result<Tensor, TensorParallelError> {
    let (block_length, num_blocks) = get_block_length_and_num_blocks(seq_length, window_size)?;
    let indices = Tensor::arange(seq_length, (Kind::Int64, device)).repeat([batch_size, 1]);

    let query_indices = split_sequence_length_dim_to(&indices, num_blocks, block_length, -1)?;
    let key_indices = look_back(&indices, block_length, window_size, false)?;

    let causal_mask = query_indices
        .unsqueeze(-1)
        .ge_tensor(&key_indices.unsqueeze(-2));

    let attention_mask = match attention_mask {
        Some(mask) => mask.to_kind(Kind::Int64).view([batch_size, seq_length]),
        None => Tensor::ones([batch_size, seq_length], (Kind::Int64, device)),
    };
    let attention_mask = look_back(&attention_mask, block_length, window_size, false)?
        .unsqueeze(-2)
        .to_kind(Kind::Bool);

    let relative_position = key_indices.unsqueeze(-2) - query_indices.unsqueeze(-1);
    let visible = relative_position.gt(-window_size);

    Ok(causal_mask
        .logical_and(&attention_mask)
        .logical_and(&visible)
        .unsqueeze(-3))
}
