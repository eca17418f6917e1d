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

use rust_tokenizers::tokenizer::{Gpt2Tokenizer, Tokenizer, TruncationStrategy};
use rust_tokenizers::vocab::Vocab;

/// # Tokenizer used to build dummy export inputs
/// Only the unknown token, the number of special tokens added around a sequence and plain
/// batch encoding are required.
pub trait ExportTokenizer {
    /// String value of the unknown token
    fn unk_token(&self) -> &str;

    /// Number of special tokens added when encoding a single sequence or a pair of sequences
    fn num_special_tokens_to_add(&self, is_pair: bool) -> i64;

    /// Encodes every text to its token ids, special tokens included
    fn encode_batch(&self, texts: &[String]) -> Vec<Vec<i64>>;
}

impl ExportTokenizer for Gpt2Tokenizer {
    fn unk_token(&self) -> &str {
        self.vocab().get_unknown_value()
    }

    fn num_special_tokens_to_add(&self, _is_pair: bool) -> i64 {
        // GPT2 inputs are not wrapped with special tokens
        0
    }

    fn encode_batch(&self, texts: &[String]) -> Vec<Vec<i64>> {
        self.encode_list(texts, usize::MAX, &TruncationStrategy::DoNotTruncate, 0)
            .into_iter()
            .map(|tokenized_input| tokenized_input.token_ids)
            .collect()
    }
}
