//! The destination model: a GPT-NeoX causal LM in the single-file layout
//! (`transformer.wte`, `transformer.h.{i}`, `transformer.ln_f`, `lm_head`).
//!
//! It only knows which parameters it owns and their shapes; it holds
//! whatever tensors it is given and writes them back out.

mod error;

use std::{collections::BTreeMap, fs, path::Path};

use indexmap::IndexMap;

pub use error::ModelError;

use crate::{
    DataType, Tensor,
    config::DestinationConfig,
    parameters::{SafetensorView, write_safetensors},
    remapper::StateMapping,
};

pub const WEIGHTS_FILE_NAME: &str = "model.safetensors";
pub const CONFIG_FILE_NAME: &str = "config.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initializer {
    Zeros,
    Ones,
}

#[derive(Debug)]
struct Parameter {
    shape: Box<[usize]>,
    initializer: Initializer,
    tensor: Option<Tensor>,
}

impl Parameter {
    fn new(
        shape: Vec<usize>,
        initializer: Initializer,
    ) -> Self {
        Self {
            shape: shape.into(),
            initializer,
            tensor: None,
        }
    }

    fn initial_tensor(
        &self,
        dtype: DataType,
    ) -> Tensor {
        match self.initializer {
            Initializer::Zeros => Tensor::zeros(dtype, self.shape.clone()),
            Initializer::Ones => Tensor::ones(dtype, self.shape.clone()),
        }
    }
}

/// Outcome of a non-strict [`GptNeoxForCausalLm::load_state_dict`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Parameters of the model the state mapping did not supply.
    pub missing_keys: Vec<String>,
    /// Names in the state mapping the model has no parameter for.
    pub unexpected_keys: Vec<String>,
}

impl LoadReport {
    pub fn is_exact(&self) -> bool {
        self.missing_keys.is_empty() && self.unexpected_keys.is_empty()
    }
}

#[derive(Debug)]
pub struct GptNeoxForCausalLm {
    config: DestinationConfig,
    dtype: DataType,
    parameters: IndexMap<String, Parameter>,
}

impl GptNeoxForCausalLm {
    pub fn from_config(config: DestinationConfig) -> Result<Self, ModelError> {
        let dtype = config.model.parameter_dtype()?;
        let hidden = config.model.hidden_size;
        let vocab = config.model.vocab_size;
        let qkv = hidden.checked_mul(3).ok_or(ModelError::OversizedConfig("3 * hidden_size"))?;
        let inner = config
            .model
            .intermediate_size()
            .ok_or(ModelError::OversizedConfig("4 * hidden_size"))?;
        let matrices = [
            (vocab, "vocab_size * hidden_size"),
            (qkv, "3 * hidden_size^2"),
            (inner, "intermediate_size * hidden_size"),
        ];
        for (rows, what) in matrices {
            rows.checked_mul(hidden)
                .and_then(|elements| elements.checked_mul(dtype.size_in_bytes()))
                .ok_or(ModelError::OversizedConfig(what))?;
        }

        let mut parameters = IndexMap::new();
        let mut add = |name: String, shape: Vec<usize>, initializer| {
            parameters.insert(name, Parameter::new(shape, initializer));
        };

        add("transformer.wte.weight".into(), vec![vocab, hidden], Initializer::Zeros);
        for i in 0..config.model.num_hidden_layers {
            let prefix = format!("transformer.h.{i}");
            add(format!("{prefix}.ln_1.weight"), vec![hidden], Initializer::Ones);
            add(format!("{prefix}.ln_1.bias"), vec![hidden], Initializer::Zeros);
            add(format!("{prefix}.attn.qkv_proj.weight"), vec![qkv, hidden], Initializer::Zeros);
            add(format!("{prefix}.attn.qkv_proj.bias"), vec![qkv], Initializer::Zeros);
            add(format!("{prefix}.attn.out_proj.weight"), vec![hidden, hidden], Initializer::Zeros);
            add(format!("{prefix}.attn.out_proj.bias"), vec![hidden], Initializer::Zeros);
            add(format!("{prefix}.ln_2.weight"), vec![hidden], Initializer::Ones);
            add(format!("{prefix}.ln_2.bias"), vec![hidden], Initializer::Zeros);
            add(format!("{prefix}.mlp.fc_in.weight"), vec![inner, hidden], Initializer::Zeros);
            add(format!("{prefix}.mlp.fc_in.bias"), vec![inner], Initializer::Zeros);
            add(format!("{prefix}.mlp.fc_out.weight"), vec![hidden, inner], Initializer::Zeros);
            add(format!("{prefix}.mlp.fc_out.bias"), vec![hidden], Initializer::Zeros);
        }
        add("transformer.ln_f.weight".into(), vec![hidden], Initializer::Ones);
        add("transformer.ln_f.bias".into(), vec![hidden], Initializer::Zeros);
        add("lm_head.weight".into(), vec![vocab, hidden], Initializer::Zeros);

        Ok(Self {
            config,
            dtype,
            parameters,
        })
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    pub fn parameter_names(&self) -> impl Iterator<Item = &str> {
        self.parameters.keys().map(String::as_str)
    }

    pub fn parameter_shape(
        &self,
        name: &str,
    ) -> Option<&[usize]> {
        self.parameters.get(name).map(|parameter| parameter.shape.as_ref())
    }

    /// The tensor currently held for `name`, if one has been loaded.
    pub fn parameter(
        &self,
        name: &str,
    ) -> Option<&Tensor> {
        self.parameters.get(name).and_then(|parameter| parameter.tensor.as_ref())
    }

    /// Takes ownership of the tensors in `state` whose names the model knows.
    ///
    /// A shape disagreement is always an error. Name disagreements are
    /// reported, and are an error only when `strict` is set. Nothing is
    /// loaded when an error is returned.
    pub fn load_state_dict(
        &mut self,
        state: StateMapping,
        strict: bool,
    ) -> Result<LoadReport, ModelError> {
        let mut report = LoadReport::default();

        for (key, tensor) in state.iter() {
            match self.parameters.get(key) {
                Some(parameter) if parameter.shape.as_ref() != tensor.shape() => {
                    return Err(ModelError::ShapeMismatch {
                        key: key.to_string(),
                        supplied: tensor.shape().into(),
                        expected: parameter.shape.clone(),
                    });
                },
                Some(_) => {},
                None => report.unexpected_keys.push(key.to_string()),
            }
        }
        report.missing_keys = self
            .parameters
            .keys()
            .filter(|name| !state.contains_key(name))
            .cloned()
            .collect();

        if strict && !report.is_exact() {
            return Err(ModelError::StrictLoad {
                missing_keys: report.missing_keys,
                unexpected_keys: report.unexpected_keys,
            });
        }

        for (key, tensor) in state {
            if let Some(parameter) = self.parameters.get_mut(&key) {
                parameter.tensor = Some(tensor);
            }
        }
        Ok(report)
    }

    /// Writes `model.safetensors` and `config.json` into `save_dir`,
    /// creating it if needed. Parameters never loaded are written with their
    /// initial values in the configured dtype.
    pub fn save_pretrained(
        &self,
        save_dir: &Path,
    ) -> Result<(), ModelError> {
        fs::create_dir_all(save_dir)?;

        let defaults: Vec<Tensor> = self
            .parameters
            .values()
            .filter(|parameter| parameter.tensor.is_none())
            .map(|parameter| parameter.initial_tensor(self.dtype))
            .collect();
        let mut defaults = defaults.iter();

        let mut views = Vec::with_capacity(self.parameters.len());
        for (name, parameter) in &self.parameters {
            if let Some(tensor) = parameter.tensor.as_ref().or_else(|| defaults.next()) {
                views.push(SafetensorView {
                    name,
                    dtype: tensor.dtype(),
                    shape: tensor.shape(),
                    data: tensor.as_bytes(),
                });
            }
        }

        let metadata = BTreeMap::from([("format".to_string(), "pt".to_string())]);
        let weights_path = save_dir.join(WEIGHTS_FILE_NAME);
        write_safetensors(&weights_path, &views, Some(metadata))?;
        tracing::info!("Wrote {} tensors to {}", views.len(), weights_path.display());

        let config_path = save_dir.join(CONFIG_FILE_NAME);
        let mut config_json = self.config.to_json_pretty()?;
        config_json.push('\n');
        fs::write(&config_path, config_json)?;
        tracing::info!("Wrote {}", config_path.display());
        Ok(())
    }
}
