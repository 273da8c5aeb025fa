//! Offline fixtures: a word-level tokenizer and a two-layer llama model
//! small enough to train in a test.

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::path::Path;

pub const VOCAB: &[&str] = &[
    "<unk>",
    "</s>",
    "###",
    "Instruction",
    ":",
    "Response",
    "2",
    "+",
    "?",
    "4",
];

pub const HIDDEN: usize = 16;
pub const INTERMEDIATE: usize = 32;
pub const LAYERS: usize = 2;
pub const KV_DIM: usize = 8;

pub fn write_tokenizer(dir: &Path) {
    let vocab: Map<String, Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(i, t)| (t.to_string(), json!(i)))
        .collect();
    let special = |id: usize, content: &str| {
        json!({"id": id, "content": content, "single_word": false, "lstrip": false,
               "rstrip": false, "normalized": false, "special": true})
    };
    let tokenizer = json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [special(0, "<unk>"), special(1, "</s>")],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    std::fs::write(dir.join("tokenizer.json"), tokenizer.to_string()).unwrap();
    std::fs::write(
        dir.join("tokenizer_config.json"),
        json!({"eos_token": "</s>", "padding_side": "right"}).to_string(),
    )
    .unwrap();
    std::fs::write(
        dir.join("special_tokens_map.json"),
        json!({"eos_token": "</s>", "unk_token": "<unk>"}).to_string(),
    )
    .unwrap();
}

pub fn model_config() -> Value {
    json!({
        "architectures": ["LlamaForCausalLM"],
        "model_type": "llama",
        "vocab_size": VOCAB.len() + 1,
        "hidden_size": HIDDEN,
        "intermediate_size": INTERMEDIATE,
        "num_hidden_layers": LAYERS,
        "num_attention_heads": 2,
        "num_key_value_heads": 1,
        "max_position_embeddings": 64,
        "rms_norm_eps": 1e-5,
        "eos_token_id": 1,
        "tie_word_embeddings": false,
        "torch_dtype": "float32"
    })
}

/// Parameters in the model written by [`write_model`].
pub fn parameter_count() -> u64 {
    let vocab = (VOCAB.len() + 1) as u64;
    let (h, i, kv) = (HIDDEN as u64, INTERMEDIATE as u64, KV_DIM as u64);
    let per_layer = h * h * 2 + kv * h * 2 + i * h * 3 + h * 2;
    vocab * h * 2 + per_layer * LAYERS as u64 + h
}

/// A complete local model artifact: config, tokenizer and F32 weights.
pub fn write_model(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    write_tokenizer(dir);
    std::fs::write(dir.join("config.json"), model_config().to_string()).unwrap();
    std::fs::write(
        dir.join("generation_config.json"),
        json!({"eos_token_id": 1, "max_new_tokens": 32}).to_string(),
    )
    .unwrap();

    let dev = Device::Cpu;
    let vocab = VOCAB.len() + 1;
    let (h, i, kv) = (HIDDEN, INTERMEDIATE, KV_DIM);
    let mut tensors = HashMap::new();
    let mut random = |name: String, shape: &[usize]| {
        tensors.insert(name, Tensor::randn(0f32, 0.2, shape, &dev).unwrap());
    };
    random("model.embed_tokens.weight".into(), &[vocab, h]);
    random("lm_head.weight".into(), &[vocab, h]);
    for l in 0..LAYERS {
        let p = format!("model.layers.{l}");
        random(format!("{p}.self_attn.q_proj.weight"), &[h, h]);
        random(format!("{p}.self_attn.k_proj.weight"), &[kv, h]);
        random(format!("{p}.self_attn.v_proj.weight"), &[kv, h]);
        random(format!("{p}.self_attn.o_proj.weight"), &[h, h]);
        random(format!("{p}.mlp.gate_proj.weight"), &[i, h]);
        random(format!("{p}.mlp.up_proj.weight"), &[i, h]);
        random(format!("{p}.mlp.down_proj.weight"), &[h, i]);
    }
    let ones = || Tensor::ones(h, DType::F32, &dev).unwrap();
    for l in 0..LAYERS {
        let p = format!("model.layers.{l}");
        tensors.insert(format!("{p}.input_layernorm.weight"), ones());
        tensors.insert(format!("{p}.post_attention_layernorm.weight"), ones());
    }
    tensors.insert("model.norm.weight".into(), ones());
    candle_core::safetensors::save(&tensors, dir.join("model.safetensors")).unwrap();
}

pub fn write_dataset(path: &Path, lines: &[Value]) {
    let body: Vec<String> = lines.iter().map(Value::to_string).collect();
    std::fs::write(path, body.join("\n")).unwrap();
}
