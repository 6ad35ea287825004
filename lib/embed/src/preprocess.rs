use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::Deserialize;
use std::path::Path;
use tracing::debug;
use vizdex_core::{Error, Result};

use crate::backend::InputSpec;
use crate::loader::CanonicalImage;

pub const PREPROCESSOR_CONFIG_FILE: &str = "preprocessor_config.json";

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// `size` / `crop_size` as they appear in image-processor configs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    ShortestEdge { shortest_edge: u32 },
    Exact { height: u32, width: u32 },
    Square(u32),
}

impl SizeSpec {
    /// Output dimensions (width, height) when applied to an image of `w` x `h`.
    fn resolve(self, w: u32, h: u32) -> (u32, u32) {
        match self {
            SizeSpec::Exact { height, width } => (width, height),
            SizeSpec::Square(side) => (side, side),
            SizeSpec::ShortestEdge { shortest_edge } => {
                let scale = shortest_edge as f64 / w.min(h).max(1) as f64;
                let nw = ((w as f64) * scale).round().max(1.0) as u32;
                let nh = ((h as f64) * scale).round().max(1.0) as u32;
                (nw, nh)
            }
        }
    }

    /// Spatial shape a model expects when configured with this size.
    pub fn input_spec(self) -> InputSpec {
        match self {
            SizeSpec::Exact { height, width } => InputSpec { height, width },
            SizeSpec::Square(side) | SizeSpec::ShortestEdge { shortest_edge: side } => InputSpec {
                height: side,
                width: side,
            },
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_size() -> SizeSpec {
    SizeSpec::Exact {
        height: 224,
        width: 224,
    }
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_mean() -> Vec<f32> {
    IMAGENET_MEAN.to_vec()
}

fn default_std() -> Vec<f32> {
    IMAGENET_STD.to_vec()
}

fn default_resample() -> u32 {
    2
}

/// Image-processor settings shipped next to the model as `preprocessor_config.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PreprocessorConfig {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default = "default_size")]
    pub size: SizeSpec,
    #[serde(default)]
    pub do_center_crop: bool,
    #[serde(default)]
    pub crop_size: Option<SizeSpec>,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_mean")]
    pub image_mean: Vec<f32>,
    #[serde(default = "default_std")]
    pub image_std: Vec<f32>,
    #[serde(default = "default_resample")]
    pub resample: u32,
}

impl Default for PreprocessorConfig {
    fn default() -> Self {
        Self {
            do_resize: true,
            size: default_size(),
            do_center_crop: false,
            crop_size: None,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: default_mean(),
            image_std: default_std(),
            resample: default_resample(),
        }
    }
}

impl PreprocessorConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&data)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.as_ref().display(), e)))
    }

    /// Read the config from `dir`, or fall back to a 224x224 ImageNet processor.
    pub fn load_or_default<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let path = dir.as_ref().join(PREPROCESSOR_CONFIG_FILE);
        if path.is_file() {
            Self::from_file(path)
        } else {
            debug!("No {} in {}, using defaults", PREPROCESSOR_CONFIG_FILE, dir.as_ref().display());
            Ok(Self::default())
        }
    }

    /// Shape the processor produces on its own, used when the model does not declare one.
    pub fn input_spec(&self) -> InputSpec {
        match (self.do_center_crop, self.crop_size) {
            (true, Some(crop)) => crop.input_spec(),
            _ => self.size.input_spec(),
        }
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            0 => FilterType::Nearest,
            1 => FilterType::Lanczos3,
            3 => FilterType::CatmullRom,
            4 => FilterType::Gaussian,
            _ => FilterType::Triangle,
        }
    }

    fn check(&self) -> Result<([f32; 3], [f32; 3])> {
        let (mean, std) = if self.do_normalize {
            let mean: [f32; 3] = self
                .image_mean
                .as_slice()
                .try_into()
                .map_err(|_| Error::Preprocess(format!("image_mean needs 3 values, got {}", self.image_mean.len())))?;
            let std: [f32; 3] = self
                .image_std
                .as_slice()
                .try_into()
                .map_err(|_| Error::Preprocess(format!("image_std needs 3 values, got {}", self.image_std.len())))?;
            (mean, std)
        } else {
            ([0.0; 3], [1.0; 3])
        };
        if std.iter().any(|s| *s == 0.0) {
            return Err(Error::Preprocess("image_std contains zero".to_string()));
        }
        Ok((mean, std))
    }

    /// Resize, crop, rescale and normalize into a `[1, 3, H, W]` tensor matching `spec`.
    pub fn prepare(&self, image: &CanonicalImage, spec: InputSpec) -> Result<Array4<f32>> {
        if image.width() == 0 || image.height() == 0 {
            return Err(Error::Preprocess("image has zero width or height".to_string()));
        }
        if spec.height == 0 || spec.width == 0 {
            return Err(Error::Preprocess(format!("invalid model input size {}x{}", spec.width, spec.height)));
        }
        let (mean, std) = self.check()?;
        let filter = self.filter();

        let mut rgb: RgbImage = image.as_rgb().clone();
        if self.do_resize {
            let (w, h) = self.size.resolve(rgb.width(), rgb.height());
            if (w, h) != rgb.dimensions() {
                rgb = imageops::resize(&rgb, w, h, filter);
            }
        }
        if self.do_center_crop {
            let (cw, ch) = self.crop_size.unwrap_or(self.size).resolve(rgb.width(), rgb.height());
            if rgb.width() < cw || rgb.height() < ch {
                rgb = imageops::resize(&rgb, cw.max(rgb.width()), ch.max(rgb.height()), filter);
            }
            let x = (rgb.width() - cw) / 2;
            let y = (rgb.height() - ch) / 2;
            rgb = imageops::crop_imm(&rgb, x, y, cw, ch).to_image();
        }
        if rgb.dimensions() != (spec.width, spec.height) {
            rgb = imageops::resize(&rgb, spec.width, spec.height, filter);
        }

        let scale = if self.do_rescale { self.rescale_factor } else { 1.0 };
        let (h, w) = (spec.height as usize, spec.width as usize);
        let mut tensor = Array4::<f32>::zeros((1, 3, h, w));
        for (x, y, pixel) in rgb.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 * scale - mean[c]) / std[c];
            }
        }

        if tensor.shape() != [1, 3, h, w] {
            return Err(Error::Preprocess(format!(
                "tensor shape {:?} does not match model input 1x3x{}x{}",
                tensor.shape(),
                h,
                w
            )));
        }
        Ok(tensor)
    }
}
