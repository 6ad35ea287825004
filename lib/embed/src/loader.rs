use bytes::Bytes;
use image::{DynamicImage, RgbImage};
use reqwest::Client;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use vizdex_core::{Error, Result};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Every accepted way of handing an image to the service.
#[derive(Clone)]
pub enum ImageInput {
    Url(String),
    Path(PathBuf),
    Bytes(Bytes),
    Bitmap(DynamicImage),
}

impl ImageInput {
    /// Classify a string by its scheme: `http(s)://` is fetched, anything else is a path.
    pub fn parse(input: &str) -> Self {
        let lower = input.trim_start().to_ascii_lowercase();
        if lower.starts_with("http://") || lower.starts_with("https://") {
            ImageInput::Url(input.trim().to_string())
        } else {
            ImageInput::Path(PathBuf::from(input))
        }
    }

    /// Short descriptor used in error messages and logs.
    pub fn describe(&self) -> String {
        match self {
            ImageInput::Url(url) => format!("url:{url}"),
            ImageInput::Path(path) => format!("path:{}", path.display()),
            ImageInput::Bytes(bytes) => format!("bytes({})", bytes.len()),
            ImageInput::Bitmap(img) => format!("bitmap({}x{})", img.width(), img.height()),
        }
    }
}

impl fmt::Debug for ImageInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl From<Vec<u8>> for ImageInput {
    fn from(bytes: Vec<u8>) -> Self {
        ImageInput::Bytes(Bytes::from(bytes))
    }
}

impl From<Bytes> for ImageInput {
    fn from(bytes: Bytes) -> Self {
        ImageInput::Bytes(bytes)
    }
}

impl From<DynamicImage> for ImageInput {
    fn from(img: DynamicImage) -> Self {
        ImageInput::Bitmap(img)
    }
}

impl From<RgbImage> for ImageInput {
    fn from(img: RgbImage) -> Self {
        ImageInput::Bitmap(DynamicImage::ImageRgb8(img))
    }
}

/// Decoded 8-bit RGB raster.
#[derive(Debug, Clone)]
pub struct CanonicalImage {
    rgb: RgbImage,
}

impl CanonicalImage {
    /// Coerce any raster to RGB, dropping alpha and expanding grayscale.
    pub fn from_dynamic(img: DynamicImage, descriptor: &str) -> Result<Self> {
        if img.width() == 0 || img.height() == 0 {
            return Err(Error::image_decode(descriptor, "image has zero width or height"));
        }
        Ok(Self { rgb: img.into_rgb8() })
    }

    /// Uniform image filled with one colour.
    pub fn solid(width: u32, height: u32, rgb: [u8; 3]) -> Self {
        Self {
            rgb: RgbImage::from_pixel(width, height, image::Rgb(rgb)),
        }
    }

    pub fn width(&self) -> u32 {
        self.rgb.width()
    }

    pub fn height(&self) -> u32 {
        self.rgb.height()
    }

    pub fn as_rgb(&self) -> &RgbImage {
        &self.rgb
    }

    pub fn into_rgb(self) -> RgbImage {
        self.rgb
    }
}

fn decode(bytes: &[u8], descriptor: &str) -> Result<CanonicalImage> {
    let img = image::load_from_memory(bytes).map_err(|e| Error::image_decode(descriptor, e))?;
    CanonicalImage::from_dynamic(img, descriptor)
}

async fn decode_blocking(bytes: Bytes, descriptor: String) -> Result<CanonicalImage> {
    tokio::task::spawn_blocking(move || decode(&bytes, &descriptor))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(format!("decode worker failed: {e}"))))?
}

/// Resolves an [`ImageInput`] into a [`CanonicalImage`]. No retries.
#[derive(Clone)]
pub struct ImageLoader {
    client: Client,
}

impl ImageLoader {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| Error::InvalidConfig(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    pub async fn load(&self, input: ImageInput) -> Result<CanonicalImage> {
        let descriptor = input.describe();
        match input {
            ImageInput::Url(url) => {
                let response = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::image_decode(&descriptor, e))?;
                let status = response.status();
                if !status.is_success() {
                    return Err(Error::image_decode(&descriptor, format!("HTTP status {status}")));
                }
                let bytes = response
                    .bytes()
                    .await
                    .map_err(|e| Error::image_decode(&descriptor, e))?;
                decode_blocking(bytes, descriptor).await
            }
            ImageInput::Path(path) => {
                tokio::task::spawn_blocking(move || {
                    let bytes = std::fs::read(&path).map_err(|e| Error::image_decode(&descriptor, e))?;
                    decode(&bytes, &descriptor)
                })
                .await
                .map_err(|e| Error::Io(std::io::Error::other(format!("decode worker failed: {e}"))))?
            }
            ImageInput::Bytes(bytes) => decode_blocking(bytes, descriptor).await,
            ImageInput::Bitmap(img) => CanonicalImage::from_dynamic(img, &descriptor),
        }
    }
}
