//! Print-failure detection client.
//!
//! Posts an encoded frame to the ML service's `/predict` endpoint and draws
//! the returned bounding boxes onto the image. Boxes arrive in
//! (center-x, center-y, width, height) pixel coordinates. Every failure in
//! this module is non-fatal to the capture pipeline; callers log and fall
//! back to the unannotated image.

use anyhow::{anyhow, Context, Result};
use image::{Rgb, RgbImage};
use serde::Deserialize;
use std::time::Duration;
use url::Url;

const PREDICT_PATH: &str = "/predict";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const BOX_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BOX_STROKE: u32 = 2;

/// One detection from the ML service.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectedFailure {
    pub confidence: f64,
    /// Center-x, center-y, width, height in image pixels.
    pub bbox: [f64; 4],
}

#[derive(Debug, Deserialize)]
struct DetectionResponse {
    detections: Vec<serde_json::Value>,
}

pub struct FailureDetector {
    predict_url: Url,
    agent: ureq::Agent,
}

impl FailureDetector {
    pub fn new(ml_api_url: &str) -> Result<Self> {
        let url = Url::parse(ml_api_url).context("parse ml api url")?;
        let predict_url = url.join(PREDICT_PATH).context("build predict url")?;
        let agent = ureq::AgentBuilder::new()
            .timeout(REQUEST_TIMEOUT)
            .build();
        Ok(Self { predict_url, agent })
    }

    /// Run detection on an encoded JPEG.
    pub fn detect(&self, jpeg: &[u8]) -> Result<Vec<DetectedFailure>> {
        let body = self
            .agent
            .post(self.predict_url.as_str())
            .set("Content-Type", "image/jpeg")
            .send_bytes(jpeg)
            .context("call failure detection service")?
            .into_string()
            .context("read detection response")?;

        let response: DetectionResponse =
            serde_json::from_str(&body).context("parse detection response")?;
        parse_detections(&response.detections)
    }
}

/// Each detection is a heterogeneous array: `[label, confidence, [cx, cy, w,
/// h]]`.
fn parse_detections(raw: &[serde_json::Value]) -> Result<Vec<DetectedFailure>> {
    let mut failures = Vec::with_capacity(raw.len());
    for detection in raw {
        let fields = detection
            .as_array()
            .ok_or_else(|| anyhow!("detection is not an array: {}", detection))?;
        let confidence = fields
            .get(1)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| anyhow!("detection confidence missing or not a number"))?;
        let coords = fields
            .get(2)
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("detection box coordinates missing"))?;
        if coords.len() != 4 {
            return Err(anyhow!(
                "expected 4 box coordinates, got {}",
                coords.len()
            ));
        }
        let mut bbox = [0f64; 4];
        for (slot, coord) in bbox.iter_mut().zip(coords) {
            *slot = coord
                .as_f64()
                .ok_or_else(|| anyhow!("box coordinate is not a number"))?;
        }
        failures.push(DetectedFailure { confidence, bbox });
    }
    Ok(failures)
}

/// Stroke each detection's bounding box onto the image.
pub fn annotate(image: &mut RgbImage, failures: &[DetectedFailure]) {
    for failure in failures {
        let [cx, cy, w, h] = failure.bbox;
        let x0 = (cx - w / 2.0).max(0.0) as u32;
        let y0 = (cy - h / 2.0).max(0.0) as u32;
        let x1 = ((cx + w / 2.0) as u32).min(image.width().saturating_sub(1));
        let y1 = ((cy + h / 2.0) as u32).min(image.height().saturating_sub(1));
        if x0 >= x1 || y0 >= y1 {
            continue;
        }
        stroke_rect(image, x0, y0, x1, y1);
    }
}

fn stroke_rect(image: &mut RgbImage, x0: u32, y0: u32, x1: u32, y1: u32) {
    for t in 0..BOX_STROKE {
        let top = (y0 + t).min(y1);
        let bottom = y1.saturating_sub(t).max(y0);
        for x in x0..=x1 {
            image.put_pixel(x, top, BOX_COLOR);
            image.put_pixel(x, bottom, BOX_COLOR);
        }
        let left = (x0 + t).min(x1);
        let right = x1.saturating_sub(t).max(x0);
        for y in y0..=y1 {
            image.put_pixel(left, y, BOX_COLOR);
            image.put_pixel(right, y, BOX_COLOR);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_labeled_detections() {
        let body = r#"{
            "detections": [
                ["spaghetti", 0.91, [120.0, 80.0, 40.0, 30.0]],
                ["spaghetti", 0.55, [10, 20, 4, 4]]
            ]
        }"#;
        let response: DetectionResponse = serde_json::from_str(body).expect("parse");
        let failures = parse_detections(&response.detections).expect("detections");

        assert_eq!(failures.len(), 2);
        assert!((failures[0].confidence - 0.91).abs() < 1e-9);
        assert_eq!(failures[0].bbox, [120.0, 80.0, 40.0, 30.0]);
    }

    #[test]
    fn empty_detections_are_fine() {
        let response: DetectionResponse =
            serde_json::from_str(r#"{"detections": []}"#).expect("parse");
        assert!(parse_detections(&response.detections)
            .expect("detections")
            .is_empty());
    }

    #[test]
    fn malformed_confidence_is_an_error() {
        let response: DetectionResponse =
            serde_json::from_str(r#"{"detections": [["x", "high", [1, 2, 3, 4]]]}"#)
                .expect("parse");
        assert!(parse_detections(&response.detections).is_err());
    }

    #[test]
    fn annotate_strokes_box_edges() {
        let mut image = RgbImage::from_pixel(100, 100, Rgb([0, 0, 0]));
        annotate(
            &mut image,
            &[DetectedFailure {
                confidence: 0.9,
                bbox: [50.0, 50.0, 20.0, 20.0],
            }],
        );

        // Box spans x 40..=60, y 40..=60.
        assert_eq!(*image.get_pixel(40, 50), BOX_COLOR); // left edge
        assert_eq!(*image.get_pixel(60, 50), BOX_COLOR); // right edge
        assert_eq!(*image.get_pixel(50, 40), BOX_COLOR); // top edge
        assert_eq!(*image.get_pixel(50, 60), BOX_COLOR); // bottom edge
        assert_eq!(*image.get_pixel(50, 50), Rgb([0, 0, 0])); // interior untouched
    }

    #[test]
    fn annotate_clamps_out_of_bounds_boxes() {
        let mut image = RgbImage::from_pixel(50, 50, Rgb([0, 0, 0]));
        annotate(
            &mut image,
            &[DetectedFailure {
                confidence: 0.8,
                bbox: [0.0, 0.0, 200.0, 200.0],
            }],
        );
        assert_eq!(*image.get_pixel(0, 0), BOX_COLOR);
    }
}
