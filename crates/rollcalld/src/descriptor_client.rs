//! Descriptor source backed by an HTTP inference sidecar.
//!
//! The face model runs out of process. Each frame is posted as raw 8-bit
//! grayscale; the sidecar answers with one descriptor per detected face.

use std::time::Duration;

use reqwest::Client;
use rollcall_core::{BoundingBox, Descriptor, DescriptorError, DescriptorSource, Detection};
use serde::Deserialize;
use tokio::runtime::Handle;

#[derive(Debug, Deserialize)]
struct DetectResponse {
    #[serde(default)]
    faces: Vec<FaceDto>,
}

#[derive(Debug, Deserialize)]
struct FaceDto {
    descriptor: Vec<f32>,
    #[serde(default, rename = "box")]
    geometry: BoundingBox,
}

pub struct HttpDescriptorSource {
    client: Client,
    url: String,
    runtime: Handle,
}

impl HttpDescriptorSource {
    /// Must be called from within the tokio runtime that will run the scans.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, DescriptorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DescriptorError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.to_string(),
            runtime: Handle::current(),
        })
    }

    async fn post_frame(
        &self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<DetectResponse, DescriptorError> {
        let resp = self
            .client
            .post(&self.url)
            .query(&[("width", width), ("height", height)])
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(pixels.to_vec())
            .send()
            .await
            .map_err(|e| DescriptorError::Unavailable(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(DescriptorError::InferenceFailed(format!(
                "sidecar returned HTTP {}",
                resp.status()
            )));
        }
        resp.json()
            .await
            .map_err(|e| DescriptorError::Malformed(e.to_string()))
    }
}

fn into_detections(resp: DetectResponse) -> Result<Vec<Detection>, DescriptorError> {
    resp.faces
        .into_iter()
        .map(|face| {
            let descriptor = Descriptor::new(face.descriptor);
            if descriptor.is_empty() || !descriptor.is_finite() {
                return Err(DescriptorError::Malformed(
                    "empty or non-finite descriptor".into(),
                ));
            }
            Ok(Detection {
                descriptor,
                geometry: face.geometry,
            })
        })
        .collect()
}

impl DescriptorSource for HttpDescriptorSource {
    fn detect(
        &mut self,
        pixels: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DescriptorError> {
        let runtime = self.runtime.clone();
        let resp = runtime.block_on(self.post_frame(pixels, width, height))?;
        into_detections(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(body: serde_json::Value) -> Result<Vec<Detection>, DescriptorError> {
        into_detections(serde_json::from_value(body).unwrap())
    }

    #[test]
    fn test_faces_parsed() {
        let detections = parse(json!({
            "faces": [
                {"descriptor": [0.1, 0.2], "box": {"x": 1.0, "y": 2.0, "width": 30.0, "height": 40.0}},
                {"descriptor": [0.3, 0.4]}
            ]
        }))
        .unwrap();
        assert_eq!(detections.len(), 2);
        assert_eq!(detections[0].geometry.width, 30.0);
        assert_eq!(detections[1].descriptor.values, vec![0.3, 0.4]);
    }

    #[test]
    fn test_no_faces() {
        assert!(parse(json!({})).unwrap().is_empty());
    }

    #[test]
    fn test_empty_descriptor_is_malformed() {
        let err = parse(json!({"faces": [{"descriptor": []}]})).unwrap_err();
        assert!(matches!(err, DescriptorError::Malformed(_)));
    }
}
