use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Raw feature vector as produced by the inference backend.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Vector {
    data: Vec<f32>,
}

impl Vector {
    #[inline]
    #[must_use]
    pub fn new(data: Vec<f32>) -> Self {
        Self { data }
    }

    #[inline]
    #[must_use]
    pub fn from_slice(data: &[f32]) -> Self {
        Self {
            data: data.to_vec(),
        }
    }

    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    /// Euclidean norm, accumulated in f64 so long embeddings do not drift.
    #[must_use]
    pub fn norm(&self) -> f64 {
        self.data
            .iter()
            .map(|&x| f64::from(x) * f64::from(x))
            .sum::<f64>()
            .sqrt()
    }

    /// L2-normalize into a unit vector.
    ///
    /// The zero vector is returned unchanged rather than divided into NaNs.
    #[must_use]
    pub fn normalize(self) -> NormalizedVector {
        let norm = self.norm();
        if norm > 0.0 {
            let data = self
                .data
                .iter()
                .map(|&x| (f64::from(x) / norm) as f32)
                .collect();
            NormalizedVector { data }
        } else {
            NormalizedVector { data: self.data }
        }
    }
}

impl From<Vec<f32>> for Vector {
    fn from(data: Vec<f32>) -> Self {
        Self::new(data)
    }
}

/// A vector of unit Euclidean length, or the zero vector.
///
/// Only [`Vector::normalize`] and [`NormalizedVector::from_stored`] construct one, so the
/// store never sees an un-normalized embedding.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(transparent)]
pub struct NormalizedVector {
    data: Vec<f32>,
}

impl NormalizedVector {
    /// Rehydrate a vector that was normalized before it was persisted.
    #[inline]
    #[must_use]
    pub fn from_stored(data: Vec<f32>) -> Self {
        Self { data }
    }

    #[inline]
    #[must_use]
    pub fn dim(&self) -> usize {
        self.data.len()
    }

    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&x| x == 0.0)
    }

    #[inline]
    #[must_use]
    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }

    /// Normalizing a unit vector again only changes rounding noise.
    #[must_use]
    pub fn renormalize(self) -> NormalizedVector {
        Vector::new(self.data).normalize()
    }
}

impl Deref for NormalizedVector {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.data
    }
}

impl<'de> Deserialize<'de> for NormalizedVector {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Vec::<f32>::deserialize(deserializer)?;
        Ok(Vector::new(raw).normalize())
    }
}
