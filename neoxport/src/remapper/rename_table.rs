use super::layout::ShardKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenameRule {
    pub source: &'static str,
    /// Full destination name, or for block shards the part after
    /// `transformer.h.{i}.`.
    pub destination: &'static str,
}

const fn rule(
    source: &'static str,
    destination: &'static str,
) -> RenameRule {
    RenameRule {
        source,
        destination,
    }
}

pub const BLOCK_PREFIX: &str = "transformer.h";

pub const EMBEDDING_RULES: &[RenameRule] = &[rule("word_embeddings.weight", "transformer.wte.weight")];

pub const BLOCK_RULES: &[RenameRule] = &[
    rule("input_layernorm.weight", "ln_1.weight"),
    rule("input_layernorm.bias", "ln_1.bias"),
    rule("attention.query_key_value.weight", "attn.qkv_proj.weight"),
    rule("attention.query_key_value.bias", "attn.qkv_proj.bias"),
    rule("attention.dense.weight", "attn.out_proj.weight"),
    rule("attention.dense.bias", "attn.out_proj.bias"),
    rule("post_attention_layernorm.weight", "ln_2.weight"),
    rule("post_attention_layernorm.bias", "ln_2.bias"),
    rule("mlp.dense_h_to_4h.weight", "mlp.fc_in.weight"),
    rule("mlp.dense_h_to_4h.bias", "mlp.fc_in.bias"),
    rule("mlp.dense_4h_to_h.weight", "mlp.fc_out.weight"),
    rule("mlp.dense_4h_to_h.bias", "mlp.fc_out.bias"),
];

pub const FINAL_NORM_RULES: &[RenameRule] = &[
    rule("norm.weight", "transformer.ln_f.weight"),
    rule("norm.bias", "transformer.ln_f.bias"),
];

pub const HEAD_RULES: &[RenameRule] = &[rule("final_linear.weight", "lm_head.weight")];

/// Attention buffers the destination model rebuilds itself.
pub const DROPPED_BLOCK_BUFFERS: &[&str] = &["attention.bias", "attention.masked_bias"];

pub fn rules_for(kind: ShardKind) -> &'static [RenameRule] {
    match kind {
        ShardKind::Embedding => EMBEDDING_RULES,
        ShardKind::Block(_) => BLOCK_RULES,
        ShardKind::FinalNorm => FINAL_NORM_RULES,
        ShardKind::Head => HEAD_RULES,
    }
}

pub fn destination_key(
    kind: ShardKind,
    rule: &RenameRule,
) -> String {
    match kind {
        ShardKind::Block(block) => format!("{BLOCK_PREFIX}.{block}.{}", rule.destination),
        _ => rule.destination.to_string(),
    }
}

/// Source keys that are known and deliberately not copied.
pub fn is_dropped_buffer(
    kind: ShardKind,
    source_key: &str,
) -> bool {
    matches!(kind, ShardKind::Block(_)) && DROPPED_BLOCK_BUFFERS.contains(&source_key)
}
