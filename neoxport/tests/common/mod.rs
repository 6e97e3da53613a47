#![allow(dead_code)]

use std::{
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
};

use neoxport::{DataType, Tensor, remapper::layout::shard_file_name};
use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

pub const HIDDEN: usize = 4;
pub const INNER: usize = 4 * HIDDEN;
pub const VOCAB: usize = 8;

/// One shard's worth of source tensors, in the order they are pickled.
pub type ShardContents = Vec<(String, Tensor)>;

/// F32 tensor whose elements are `seed, seed + 1, ...`.
pub fn counting_tensor(
    shape: &[usize],
    seed: f32,
) -> Tensor {
    let numel: usize = shape.iter().product();
    let values: Vec<f32> = (0..numel).map(|i| seed + i as f32).collect();
    Tensor::from_values(shape.to_vec(), &values).unwrap()
}

fn storage_name(dtype: DataType) -> &'static str {
    match dtype {
        DataType::F32 => "FloatStorage",
        DataType::F16 => "HalfStorage",
        DataType::BF16 => "BFloat16Storage",
        DataType::F64 => "DoubleStorage",
        DataType::I64 => "LongStorage",
        DataType::I32 => "IntStorage",
        DataType::I16 => "ShortStorage",
        DataType::I8 => "CharStorage",
        DataType::U8 => "ByteStorage",
        DataType::Bool => "BoolStorage",
        other => panic!("torch has no storage for {other:?}"),
    }
}

/// Where a pickled tensor's elements live.
struct StorageSlot {
    key: String,
    offset: usize,
    numel: usize,
}

/// Emits the protocol 2 pickle `torch.save(state_dict)` produces for an
/// `OrderedDict` of contiguous tensors.
struct PickleWriter {
    out: Vec<u8>,
}

impl PickleWriter {
    fn new() -> Self {
        Self {
            out: vec![0x80, 0x02],
        }
    }

    fn global(
        &mut self,
        module: &str,
        name: &str,
    ) {
        self.out.push(b'c');
        self.out.extend_from_slice(format!("{module}\n{name}\n").as_bytes());
    }

    fn string(
        &mut self,
        value: &str,
    ) {
        self.out.push(b'X');
        self.out.extend_from_slice(&(value.len() as u32).to_le_bytes());
        self.out.extend_from_slice(value.as_bytes());
    }

    fn int(
        &mut self,
        value: usize,
    ) {
        match value {
            0..=0xff => self.out.extend_from_slice(&[b'K', value as u8]),
            0x100..=0xffff => {
                self.out.push(b'M');
                self.out.extend_from_slice(&(value as u16).to_le_bytes());
            },
            _ => {
                self.out.push(b'J');
                self.out.extend_from_slice(&(value as i32).to_le_bytes());
            },
        }
    }

    fn int_tuple(
        &mut self,
        values: &[usize],
    ) {
        if values.is_empty() {
            self.out.push(b')');
            return;
        }
        self.out.push(b'(');
        for &value in values {
            self.int(value);
        }
        self.out.push(b't');
    }

    fn empty_ordered_dict(&mut self) {
        self.global("collections", "OrderedDict");
        self.out.extend_from_slice(b")R");
    }

    fn tensor(
        &mut self,
        slot: &StorageSlot,
        tensor: &Tensor,
    ) {
        let shape = tensor.shape();
        let mut stride = vec![1usize; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            stride[i] = stride[i + 1] * shape[i + 1].max(1);
        }

        self.global("torch._utils", "_rebuild_tensor_v2");
        self.out.push(b'(');
        // persistent id: ('storage', torch.XStorage, key, 'cpu', numel)
        self.out.push(b'(');
        self.string("storage");
        self.global("torch", storage_name(tensor.dtype()));
        self.string(&slot.key);
        self.string("cpu");
        self.int(slot.numel);
        self.out.push(b't');
        self.out.push(b'Q');
        self.int(slot.offset);
        self.int_tuple(shape);
        self.int_tuple(&stride);
        self.out.push(0x89);
        self.empty_ordered_dict();
        self.out.push(b't');
        self.out.push(b'R');
    }

    fn state_dict(
        mut self,
        tensors: &[(String, Tensor)],
        slots: &[StorageSlot],
    ) -> Vec<u8> {
        self.empty_ordered_dict();
        self.out.extend_from_slice(b"q\x01");
        if !tensors.is_empty() {
            self.out.push(b'(');
            for ((name, tensor), slot) in tensors.iter().zip(slots) {
                self.string(name);
                self.tensor(slot, tensor);
            }
            self.out.push(b'u');
        }
        // _metadata = {"": {"version": 1}}
        self.out.extend_from_slice(b"}(");
        self.string("");
        self.out.push(b'}');
        self.string("version");
        self.int(1);
        self.out.extend_from_slice(b"sub.");
        self.out
    }
}

fn write_archive(
    path: &Path,
    root: &str,
    pickle: &[u8],
    storages: &[(String, Vec<u8>)],
) {
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
    let mut zip = ZipWriter::new(File::create(path).unwrap());

    zip.start_file(format!("{root}/data.pkl"), options).unwrap();
    zip.write_all(pickle).unwrap();
    zip.start_file(format!("{root}/byteorder"), options).unwrap();
    zip.write_all(b"little").unwrap();
    for (key, bytes) in storages {
        zip.start_file(format!("{root}/data/{key}"), options).unwrap();
        zip.write_all(bytes).unwrap();
    }
    zip.start_file(format!("{root}/version"), options).unwrap();
    zip.write_all(b"3\n").unwrap();
    zip.finish().unwrap();
}

/// Writes a torch zip checkpoint rooted at `<root>/`, one storage per tensor.
pub fn write_torch_checkpoint(
    path: &Path,
    root: &str,
    tensors: &[(String, Tensor)],
) {
    let slots: Vec<StorageSlot> = tensors
        .iter()
        .enumerate()
        .map(|(index, (_, tensor))| StorageSlot {
            key: index.to_string(),
            offset: 0,
            numel: tensor.num_elements(),
        })
        .collect();
    let storages: Vec<(String, Vec<u8>)> = slots
        .iter()
        .zip(tensors)
        .map(|(slot, (_, tensor))| (slot.key.clone(), tensor.as_bytes().to_vec()))
        .collect();
    write_archive(path, root, &PickleWriter::new().state_dict(tensors, &slots), &storages);
}

/// Writes a checkpoint whose tensors are all views into storage `"0"`, the
/// way a flattened parameter buffer is saved. Tensors must share a dtype.
pub fn write_flat_torch_checkpoint(
    path: &Path,
    root: &str,
    tensors: &[(String, Tensor)],
) {
    let total: usize = tensors.iter().map(|(_, tensor)| tensor.num_elements()).sum();
    let mut slots = Vec::with_capacity(tensors.len());
    let mut flat = Vec::new();
    for (_, tensor) in tensors {
        assert_eq!(tensor.dtype(), tensors[0].1.dtype());
        slots.push(StorageSlot {
            key: "0".to_string(),
            offset: flat.len() / tensor.dtype().size_in_bytes(),
            numel: total,
        });
        flat.extend_from_slice(tensor.as_bytes());
    }
    write_archive(path, root, &PickleWriter::new().state_dict(tensors, &slots), &[("0".to_string(), flat)]);
}

pub fn embedding_shard() -> ShardContents {
    vec![("word_embeddings.weight".into(), counting_tensor(&[VOCAB, HIDDEN], 0.0))]
}

/// Every tensor of a transformer block shard, including the attention
/// buffers and rotary frequencies the training framework also saves.
pub fn block_shard(block: usize) -> ShardContents {
    let seed = 1000.0 * (block as f32 + 1.0);
    let mut tensors: ShardContents = [
        ("input_layernorm.weight", vec![HIDDEN]),
        ("input_layernorm.bias", vec![HIDDEN]),
        ("attention.query_key_value.weight", vec![3 * HIDDEN, HIDDEN]),
        ("attention.query_key_value.bias", vec![3 * HIDDEN]),
        ("attention.dense.weight", vec![HIDDEN, HIDDEN]),
        ("attention.dense.bias", vec![HIDDEN]),
        ("post_attention_layernorm.weight", vec![HIDDEN]),
        ("post_attention_layernorm.bias", vec![HIDDEN]),
        ("mlp.dense_h_to_4h.weight", vec![INNER, HIDDEN]),
        ("mlp.dense_h_to_4h.bias", vec![INNER]),
        ("mlp.dense_4h_to_h.weight", vec![HIDDEN, INNER]),
        ("mlp.dense_4h_to_h.bias", vec![HIDDEN]),
    ]
    .into_iter()
    .enumerate()
    .map(|(i, (name, shape))| (name.to_string(), counting_tensor(&shape, seed + 100.0 * i as f32)))
    .collect();

    tensors.push(("attention.bias".into(), Tensor::ones(DataType::Bool, vec![1, 1, 4, 4])));
    tensors.push(("attention.masked_bias".into(), Tensor::from_values(Vec::<usize>::new(), &[-1e4f32]).unwrap()));
    tensors.push(("attention.rotary_emb.inv_freq".into(), counting_tensor(&[HIDDEN / 2], 0.5)));
    tensors
}

pub fn final_norm_shard() -> ShardContents {
    vec![
        ("norm.weight".into(), counting_tensor(&[HIDDEN], 50.0)),
        ("norm.bias".into(), counting_tensor(&[HIDDEN], 60.0)),
    ]
}

pub fn head_shard() -> ShardContents {
    vec![("final_linear.weight".into(), counting_tensor(&[VOCAB, HIDDEN], 70.0))]
}

/// Shard index to contents for an `num_layers` block checkpoint.
pub fn checkpoint_shards(num_layers: usize) -> Vec<(usize, ShardContents)> {
    let mut shards = vec![(0, embedding_shard())];
    for block in 0..num_layers {
        shards.push((block + 2, block_shard(block)));
    }
    shards.push((num_layers + 3, final_norm_shard()));
    shards.push((num_layers + 4, head_shard()));
    shards
}

pub fn write_shards(
    dir: &Path,
    shards: &[(usize, ShardContents)],
) {
    for (index, tensors) in shards {
        let file_name = shard_file_name(*index);
        let root = file_name.trim_end_matches(".pt").to_string();
        write_torch_checkpoint(&dir.join(file_name), &root, tensors);
    }
}

pub fn write_source_configs(
    dir: &Path,
    num_layers: usize,
) {
    let configs = dir.join("configs");
    fs::create_dir_all(&configs).unwrap();
    fs::write(
        configs.join("model.yml"),
        format!("num-layers: {num_layers}\nhidden-size: {HIDDEN}\npos-emb: rotary\n"),
    )
    .unwrap();
    fs::write(configs.join("train.yml"), "train-iters: 10\nlr: 0.0006\n").unwrap();
}

/// Writes a destination `config.json` for a model with `num_layers` blocks
/// and returns its path.
pub fn write_destination_config(
    dir: &Path,
    num_layers: usize,
) -> PathBuf {
    let path = dir.join("hf_config.json");
    fs::write(
        &path,
        format!(
            r#"{{
  "architectures": ["GPTNeoXForCausalLM"],
  "model_type": "gpt_neox",
  "n_layer": {num_layers},
  "n_embd": {HIDDEN},
  "n_inner": {INNER},
  "vocab_size": {VOCAB},
  "torch_dtype": "float32"
}}"#
        ),
    )
    .unwrap();
    path
}

/// A complete checkpoint directory: shards plus `configs/`.
pub fn write_checkpoint(
    dir: &Path,
    num_layers: usize,
) {
    write_shards(dir, &checkpoint_shards(num_layers));
    write_source_configs(dir, num_layers);
}
