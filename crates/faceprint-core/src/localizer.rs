//! Face region selection.
//!
//! Turns detector output into a [`FaceRegion`] according to a
//! [`LocalizationPolicy`]. The center crop keeps the middle 70% of each axis.

use crate::types::{Detection, FaceRegion};
use serde::Serialize;

/// Fraction trimmed from each edge by the center-crop fallback.
pub const CENTER_CROP_MARGIN: f32 = 0.15;

/// Default minimum confidence for a detection to be trusted.
pub const DEFAULT_DETECTION_THRESHOLD: f32 = 0.5;

/// How the face region of an image is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocalizationPolicy {
    /// Top-scoring detection; no face if the detector found nothing usable.
    UseBestDetection,
    /// Middle 70% of the image. The detector is never consulted.
    AlwaysCenterCrop,
    /// Top-scoring detection at or above `threshold`, else the center crop.
    UseDetectionWithFallback { threshold: f32 },
}

impl Default for LocalizationPolicy {
    fn default() -> Self {
        Self::UseDetectionWithFallback {
            threshold: DEFAULT_DETECTION_THRESHOLD,
        }
    }
}

impl LocalizationPolicy {
    /// Parse a policy name (`best`, `center`, `fallback`).
    pub fn from_name(name: &str, threshold: f32) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "best" | "best-detection" => Some(Self::UseBestDetection),
            "center" | "center-crop" => Some(Self::AlwaysCenterCrop),
            "fallback" | "detection-with-fallback" => {
                Some(Self::UseDetectionWithFallback { threshold })
            }
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::UseBestDetection => "best",
            Self::AlwaysCenterCrop => "center",
            Self::UseDetectionWithFallback { .. } => "fallback",
        }
    }

    /// Anchor score floor the detector should decode with, so that a
    /// fallback threshold below the default still sees its candidates.
    pub fn detector_floor(&self) -> f32 {
        match self {
            Self::UseDetectionWithFallback { threshold } => {
                (*threshold).min(DEFAULT_DETECTION_THRESHOLD)
            }
            _ => DEFAULT_DETECTION_THRESHOLD,
        }
    }

    /// Whether this policy looks at detector output at all.
    pub fn uses_detector(&self) -> bool {
        !matches!(self, Self::AlwaysCenterCrop)
    }
}

/// Where a chosen region came from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RegionSource {
    Detection { confidence: f32 },
    CenterCrop,
}

/// A localization decision for one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Localization {
    pub region: FaceRegion,
    #[serde(flatten)]
    pub source: RegionSource,
}

/// Apply `policy` to `detections` (highest confidence first) for an image of
/// the given size. `None` means no usable face region exists.
pub fn choose_region(
    policy: LocalizationPolicy,
    detections: &[Detection],
    width: u32,
    height: u32,
) -> Option<Localization> {
    let from_detection = |min_confidence: f32| {
        detections
            .iter()
            .filter(|d| d.confidence >= min_confidence)
            .find_map(|d| {
                clamp_detection(d, width, height).map(|region| Localization {
                    region,
                    source: RegionSource::Detection {
                        confidence: d.confidence,
                    },
                })
            })
    };
    let fallback = || {
        center_crop(width, height).map(|region| Localization {
            region,
            source: RegionSource::CenterCrop,
        })
    };

    match policy {
        LocalizationPolicy::UseBestDetection => from_detection(f32::NEG_INFINITY),
        LocalizationPolicy::AlwaysCenterCrop => fallback(),
        LocalizationPolicy::UseDetectionWithFallback { threshold } => {
            let chosen = from_detection(threshold);
            if chosen.is_none() {
                tracing::debug!(
                    threshold,
                    candidates = detections.len(),
                    "no confident detection, using center crop"
                );
            }
            chosen.or_else(fallback)
        }
    }
}

/// The middle 70% of a `width` × `height` image.
pub fn center_crop(width: u32, height: u32) -> Option<FaceRegion> {
    let (x0, x1) = crop_span(width);
    let (y0, y1) = crop_span(height);
    FaceRegion::within(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0), width, height)
}

fn crop_span(extent: u32) -> (u32, u32) {
    let extent = extent as f32;
    (
        (extent * CENTER_CROP_MARGIN) as u32,
        (extent * (1.0 - CENTER_CROP_MARGIN)) as u32,
    )
}

/// Clip a detection to the image, widening to whole pixels.
pub fn clamp_detection(detection: &Detection, width: u32, height: u32) -> Option<FaceRegion> {
    let Detection { x, y, width: w, height: h, .. } = *detection;
    if ![x, y, w, h].iter().all(|v| v.is_finite()) {
        return None;
    }

    let left = x.max(0.0).floor();
    let top = y.max(0.0).floor();
    let right = (x + w).min(width as f32).ceil();
    let bottom = (y + h).min(height as f32).ceil();
    if right <= left || bottom <= top {
        return None;
    }

    FaceRegion::within(
        left as u32,
        top as u32,
        (right - left) as u32,
        (bottom - top) as u32,
        width,
        height,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, confidence: f32) -> Detection {
        Detection { x, y, width: w, height: h, confidence }
    }

    #[test]
    fn test_center_crop_200() {
        let region = center_crop(200, 200).unwrap();
        assert_eq!(region, FaceRegion { x: 30, y: 30, width: 140, height: 140 });
    }

    #[test]
    fn test_center_crop_non_square() {
        let region = center_crop(100, 41).unwrap();
        // 41 * 0.15 = 6.15 → 6, 41 * 0.85 = 34.85 → 34
        assert_eq!(region, FaceRegion { x: 15, y: 6, width: 70, height: 28 });
    }

    #[test]
    fn test_center_crop_minimum_image() {
        let region = center_crop(10, 10).unwrap();
        assert_eq!(region, FaceRegion { x: 1, y: 1, width: 7, height: 7 });
    }

    #[test]
    fn test_center_crop_degenerate() {
        assert!(center_crop(1, 1).is_none());
        assert!(center_crop(0, 50).is_none());
    }

    #[test]
    fn test_clamp_inside() {
        let region = clamp_detection(&det(10.2, 20.7, 30.0, 40.0, 0.9), 100, 100).unwrap();
        assert_eq!(region, FaceRegion { x: 10, y: 20, width: 31, height: 41 });
    }

    #[test]
    fn test_clamp_overhanging_edges() {
        let region = clamp_detection(&det(-15.0, 80.0, 50.0, 50.0, 0.9), 100, 100).unwrap();
        assert_eq!(region, FaceRegion { x: 0, y: 80, width: 35, height: 20 });
    }

    #[test]
    fn test_clamp_outside_image() {
        assert!(clamp_detection(&det(150.0, 10.0, 20.0, 20.0, 0.9), 100, 100).is_none());
        assert!(clamp_detection(&det(f32::NAN, 10.0, 20.0, 20.0, 0.9), 100, 100).is_none());
    }

    #[test]
    fn test_fallback_uses_confident_detection() {
        let dets = [det(10.0, 10.0, 50.0, 60.0, 0.8)];
        let policy = LocalizationPolicy::UseDetectionWithFallback { threshold: 0.5 };
        let loc = choose_region(policy, &dets, 200, 200).unwrap();
        assert_eq!(loc.region, FaceRegion { x: 10, y: 10, width: 50, height: 60 });
        assert_eq!(loc.source, RegionSource::Detection { confidence: 0.8 });
    }

    #[test]
    fn test_fallback_below_threshold_uses_center() {
        let dets = [det(10.0, 10.0, 50.0, 60.0, 0.3)];
        let policy = LocalizationPolicy::UseDetectionWithFallback { threshold: 0.5 };
        let loc = choose_region(policy, &dets, 200, 200).unwrap();
        assert_eq!(loc.source, RegionSource::CenterCrop);
        assert_eq!(loc.region, center_crop(200, 200).unwrap());
    }

    #[test]
    fn test_fallback_skips_unusable_box() {
        let dets = [
            det(500.0, 500.0, 10.0, 10.0, 0.95),
            det(20.0, 20.0, 10.0, 10.0, 0.7),
        ];
        let policy = LocalizationPolicy::default();
        let loc = choose_region(policy, &dets, 100, 100).unwrap();
        assert_eq!(loc.source, RegionSource::Detection { confidence: 0.7 });
    }

    #[test]
    fn test_best_detection_without_faces() {
        assert!(choose_region(LocalizationPolicy::UseBestDetection, &[], 200, 200).is_none());
    }

    #[test]
    fn test_best_detection_ignores_threshold() {
        let dets = [det(0.0, 0.0, 20.0, 20.0, 0.1)];
        let loc = choose_region(LocalizationPolicy::UseBestDetection, &dets, 50, 50).unwrap();
        assert_eq!(loc.source, RegionSource::Detection { confidence: 0.1 });
    }

    #[test]
    fn test_center_crop_ignores_detections() {
        let dets = [det(0.0, 0.0, 20.0, 20.0, 0.99)];
        let loc = choose_region(LocalizationPolicy::AlwaysCenterCrop, &dets, 100, 100).unwrap();
        assert_eq!(loc.source, RegionSource::CenterCrop);
    }

    #[test]
    fn test_policy_names_round_trip() {
        for policy in [
            LocalizationPolicy::UseBestDetection,
            LocalizationPolicy::AlwaysCenterCrop,
            LocalizationPolicy::UseDetectionWithFallback { threshold: 0.6 },
        ] {
            assert_eq!(LocalizationPolicy::from_name(policy.name(), 0.6), Some(policy));
        }
        assert_eq!(LocalizationPolicy::from_name("nope", 0.5), None);
        assert!(!LocalizationPolicy::AlwaysCenterCrop.uses_detector());
    }

    #[test]
    fn test_detector_floor() {
        let low = LocalizationPolicy::UseDetectionWithFallback { threshold: 0.3 };
        let high = LocalizationPolicy::UseDetectionWithFallback { threshold: 0.8 };
        assert!((low.detector_floor() - 0.3).abs() < 1e-6);
        assert!((high.detector_floor() - DEFAULT_DETECTION_THRESHOLD).abs() < 1e-6);
        assert!(
            (LocalizationPolicy::UseBestDetection.detector_floor() - DEFAULT_DETECTION_THRESHOLD).abs()
                < 1e-6
        );
    }

    #[test]
    fn test_localization_serializes_flat() {
        let loc = Localization {
            region: FaceRegion { x: 1, y: 2, width: 3, height: 4 },
            source: RegionSource::CenterCrop,
        };
        let json = serde_json::to_value(loc).unwrap();
        assert_eq!(json["source"], "center_crop");
        assert_eq!(json["region"]["width"], 3);
    }
}
