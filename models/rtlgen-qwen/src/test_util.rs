use std::sync::Arc;

use tokenizers::Tokenizer;

/// A byte-level BPE tokenizer with six tokens. `é` is split across `Ã` (2) and `©` (3),
/// and `<|im_end|>` (5) is a special token.
pub(crate) const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [
        {
            "id": 5,
            "content": "<|im_end|>",
            "single_word": false,
            "lstrip": false,
            "rstrip": false,
            "normalized": false,
            "special": true
        }
    ],
    "normalizer": null,
    "pre_tokenizer": null,
    "post_processor": null,
    "decoder": {
        "type": "ByteLevel",
        "add_prefix_space": false,
        "trim_offsets": false,
        "use_regex": false
    },
    "model": {
        "type": "BPE",
        "dropout": null,
        "unk_token": null,
        "continuing_subword_prefix": null,
        "end_of_word_suffix": null,
        "fuse_unk": false,
        "byte_fallback": false,
        "ignore_merges": false,
        "vocab": {"a": 0, "b": 1, "Ã": 2, "©": 3, "Ġ": 4, "<|im_end|>": 5},
        "merges": []
    }
}"#;

pub(crate) const VOCAB_SIZE: usize = 6;

pub(crate) fn tokenizer() -> Arc<Tokenizer> {
    Arc::new(Tokenizer::from_bytes(TOKENIZER_JSON).unwrap())
}
