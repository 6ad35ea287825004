// ONNX Runtime backend
use ndarray::Array4;
use ort::execution_providers::CUDAExecutionProvider;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use vizdex_core::{Error, Result};

use crate::backend::{BackendOutput, Device, InferenceBackend, InputSpec};

const POOLED_OUTPUTS: [&str; 3] = ["pooler_output", "image_embeds", "embeddings"];
const SEQUENCE_OUTPUTS: [&str; 1] = ["last_hidden_state"];
const MODEL_FILES: [&str; 2] = ["model.onnx", "onnx/model.onnx"];

fn ort_err<E: std::fmt::Display>(context: &str) -> impl Fn(E) -> Error + '_ {
    move |e| Error::Inference(format!("{context}: {e}"))
}

/// Locate the `.onnx` file for a model given either the file itself or its directory.
pub fn resolve_model_file(path: &Path) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    MODEL_FILES
        .iter()
        .map(|name| path.join(name))
        .find(|candidate| candidate.is_file())
        .ok_or_else(|| Error::InvalidConfig(format!("no ONNX model found at {}", path.display())))
}

pub struct OnnxBackend {
    name: String,
    session: Mutex<Option<Session>>,
    input_name: String,
    pooled_output: Option<String>,
    sequence_output: Option<String>,
    spec: InputSpec,
}

impl OnnxBackend {
    /// Load a model; `fallback` is used when the graph has dynamic spatial dimensions.
    pub fn load(model_path: &Path, device: Device, fallback: InputSpec) -> Result<Self> {
        let file = resolve_model_file(model_path)?;

        let mut builder = Session::builder()
            .map_err(ort_err("session builder"))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(ort_err("optimization level"))?
            .with_intra_threads(num_threads())
            .map_err(ort_err("intra threads"))?;
        if let Device::Cuda(id) = device {
            builder = builder
                .with_execution_providers([CUDAExecutionProvider::default().with_device_id(id as i32).build()])
                .map_err(ort_err("CUDA execution provider"))?;
        }
        let session = builder
            .commit_from_file(&file)
            .map_err(ort_err("failed to load model"))?;

        let input = session
            .inputs
            .first()
            .ok_or_else(|| Error::Inference("model declares no inputs".to_string()))?;
        let input_name = input.name.clone();
        let spec = input
            .input_type
            .tensor_shape()
            .and_then(|shape| match shape.iter().copied().collect::<Vec<i64>>().as_slice() {
                [_, _, h, w] if *h > 0 && *w > 0 => Some(InputSpec {
                    height: *h as u32,
                    width: *w as u32,
                }),
                _ => None,
            })
            .unwrap_or(fallback);

        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        let pooled_output = POOLED_OUTPUTS
            .iter()
            .find(|n| output_names.iter().any(|o| o == *n))
            .map(|n| n.to_string());
        let sequence_output = SEQUENCE_OUTPUTS
            .iter()
            .find(|n| output_names.iter().any(|o| o == *n))
            .map(|n| n.to_string())
            .or_else(|| {
                if pooled_output.is_none() {
                    output_names.first().cloned()
                } else {
                    None
                }
            });

        info!(
            "Loaded ONNX model {} on {} (input {}x{}, outputs {:?})",
            file.display(),
            device,
            spec.width,
            spec.height,
            output_names
        );

        Ok(Self {
            name: file.display().to_string(),
            session: Mutex::new(Some(session)),
            input_name,
            pooled_output,
            sequence_output,
            spec,
        })
    }
}

fn num_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl InferenceBackend for OnnxBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_spec(&self) -> InputSpec {
        self.spec
    }

    fn infer(&self, pixels: &Array4<f32>) -> Result<BackendOutput> {
        let mut guard = self.session.lock();
        let session = guard
            .as_mut()
            .ok_or_else(|| Error::Inference("model session has been released".to_string()))?;

        let tensor = Tensor::from_array(pixels.clone()).map_err(ort_err("input tensor"))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(ort_err("inference"))?;

        if let Some(name) = &self.pooled_output {
            if let Some(value) = outputs.get(name.as_str()) {
                let (_, data) = value.try_extract_tensor::<f32>().map_err(ort_err("pooled output"))?;
                return Ok(BackendOutput::Pooled(data.to_vec()));
            }
        }
        if let Some(name) = &self.sequence_output {
            if let Some(value) = outputs.get(name.as_str()) {
                let (shape, data) = value.try_extract_tensor::<f32>().map_err(ort_err("sequence output"))?;
                let dims: Vec<usize> = shape.iter().map(|&d| d.max(0) as usize).collect();
                return Ok(match dims.as_slice() {
                    [_, tokens, dim] => BackendOutput::Sequence {
                        tokens: *tokens,
                        dim: *dim,
                        data: data.to_vec(),
                    },
                    _ => BackendOutput::Pooled(data.to_vec()),
                });
            }
        }
        Err(Error::Inference("model produced no usable output".to_string()))
    }

    fn release(&self) {
        if self.session.lock().take().is_some() {
            info!("Released ONNX session {}", self.name);
        } else {
            warn!("ONNX session {} already released", self.name);
        }
    }
}
