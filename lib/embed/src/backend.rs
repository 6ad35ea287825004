use ndarray::Array4;
use std::fmt;
use std::str::FromStr;
use vizdex_core::{Error, Result};

/// Spatial input size a backend expects (NCHW, batch 1, 3 channels).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSpec {
    pub height: u32,
    pub width: u32,
}

/// Raw model output for one image.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendOutput {
    /// A pooled embedding (`pooler_output`, `image_embeds`).
    Pooled(Vec<f32>),
    /// Per-token hidden states, row-major `[tokens, dim]`.
    Sequence { tokens: usize, dim: usize, data: Vec<f32> },
}

impl BackendOutput {
    /// Pooled output is taken as-is; a sequence yields its first token.
    pub fn into_embedding(self) -> Result<Vec<f32>> {
        let embedding = match self {
            BackendOutput::Pooled(v) => v,
            BackendOutput::Sequence { tokens, dim, mut data } => {
                if tokens == 0 || dim == 0 || data.len() < dim {
                    return Err(Error::Inference(format!(
                        "sequence output too small: {tokens} tokens x {dim} dims, {} values",
                        data.len()
                    )));
                }
                data.truncate(dim);
                data
            }
        };
        if embedding.is_empty() {
            return Err(Error::Inference("backend returned an empty embedding".to_string()));
        }
        if embedding.iter().any(|v| !v.is_finite()) {
            return Err(Error::Inference("embedding contains non-finite values".to_string()));
        }
        Ok(embedding)
    }
}

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl FromStr for Device {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "cpu" => Ok(Device::Cpu),
            "cuda" | "gpu" => Ok(Device::Cuda(0)),
            _ => s
                .strip_prefix("cuda:")
                .and_then(|id| id.parse().ok())
                .map(Device::Cuda)
                .ok_or_else(|| Error::InvalidConfig(format!("unknown device '{s}', expected cpu, cuda or cuda:<n>"))),
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(id) => write!(f, "cuda:{id}"),
        }
    }
}

/// A loaded vision model. Calls are synchronous and run on the blocking pool.
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn input_spec(&self) -> InputSpec;

    /// Run one forward pass over a `[1, 3, H, W]` tensor.
    fn infer(&self, pixels: &Array4<f32>) -> Result<BackendOutput>;

    /// Drop model resources; later calls to `infer` fail.
    fn release(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_precedence() {
        let pooled = BackendOutput::Pooled(vec![1.0, 2.0]);
        assert_eq!(pooled.into_embedding().unwrap(), vec![1.0, 2.0]);

        let seq = BackendOutput::Sequence {
            tokens: 2,
            dim: 3,
            data: vec![1.0, 2.0, 3.0, 9.0, 9.0, 9.0],
        };
        assert_eq!(seq.into_embedding().unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_unusable_outputs() {
        assert!(matches!(
            BackendOutput::Pooled(vec![1.0, f32::NAN]).into_embedding(),
            Err(Error::Inference(_))
        ));
        assert!(BackendOutput::Pooled(vec![]).into_embedding().is_err());
        assert!(BackendOutput::Sequence { tokens: 0, dim: 4, data: vec![] }
            .into_embedding()
            .is_err());
    }

    #[test]
    fn test_device_parse() {
        assert_eq!("cpu".parse::<Device>().unwrap(), Device::Cpu);
        assert_eq!("CUDA".parse::<Device>().unwrap(), Device::Cuda(0));
        assert_eq!("cuda:2".parse::<Device>().unwrap(), Device::Cuda(2));
        assert!("tpu".parse::<Device>().is_err());
        assert_eq!(Device::Cuda(1).to_string(), "cuda:1");
    }
}
