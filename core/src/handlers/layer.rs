//! `layer` (spec §4.6, sync shape): compute the output canvas from the
//! base layer, resolve the main layer's duration, pre-stitch any
//! timeline-style overlay into one continuous background (auto-filling
//! unspecified segment durations), and delegate compositing to the media
//! service.

use async_trait::async_trait;
use serde_json::Value;

use super::{HandlerContext, HandlerDeps, HandlerOutcome, OperationHandler};
use crate::error::CoreError;
use crate::provider::{job_output_path, LayerRequest, UploadOptions};
use crate::types::{JobResult, MediaOutput, MediaType};

pub struct LayerHandler {
    pub deps: HandlerDeps,
}

/// Even-numbers a dimension (spec §4.6 "both made even" — most H.264
/// encoders reject odd width/height).
fn make_even(n: u32) -> u32 {
    n - (n % 2)
}

fn main_layer_index(layers: &[Value]) -> usize {
    if let Some(explicit) = layers.iter().position(|l| l.get("main").and_then(|v| v.as_bool()).unwrap_or(false)) {
        return explicit;
    }
    0
}

/// Auto-fills unspecified `duration` entries of a timeline layer equally
/// across the main layer's remaining time (spec §4.6 "layer").
fn autofill_timeline_durations(timeline: &mut [Value], main_duration: f64) {
    let explicit_total: f64 = timeline
        .iter()
        .filter_map(|t| t.get("duration").and_then(|v| v.as_f64()))
        .sum();
    let unspecified: Vec<usize> = timeline
        .iter()
        .enumerate()
        .filter(|(_, t)| t.get("duration").is_none())
        .map(|(i, _)| i)
        .collect();
    if unspecified.is_empty() {
        return;
    }
    let remaining = (main_duration - explicit_total).max(0.0);
    let each = remaining / unspecified.len() as f64;
    for idx in unspecified {
        if let Value::Object(map) = &mut timeline[idx] {
            map.insert("duration".to_string(), serde_json::json!(each));
        }
    }
}

#[async_trait]
impl OperationHandler for LayerHandler {
    async fn handle(&self, ctx: HandlerContext) -> Result<HandlerOutcome, CoreError> {
        let layers = ctx
            .params
            .get("layers")
            .and_then(|v| v.as_array())
            .ok_or_else(|| CoreError::ParamValidation("layers is required".to_string()))?;
        if layers.is_empty() {
            return Err(CoreError::ParamValidation("layer requires at least one layer".to_string()));
        }

        let base = &layers[0];
        let base_url = base
            .get("media")
            .or_else(|| base.get("url"))
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::ParamValidation("base layer missing media/url".to_string()))?;

        ctx.report("probing canvas", 10.0);
        let (raw_width, raw_height) = self.deps.media.probe_dimensions(base_url).await?;
        let (width, height) = (make_even(raw_width), make_even(raw_height));

        let main_idx = ctx
            .params
            .get("mainLayer")
            .and_then(|v| v.as_u64())
            .map(|i| i as usize)
            .unwrap_or_else(|| main_layer_index(layers));
        let main_layer = layers.get(main_idx).unwrap_or(base);
        let main_url = main_layer
            .get("media")
            .or_else(|| main_layer.get("url"))
            .and_then(|v| v.as_str())
            .unwrap_or(base_url);
        let main_duration = self.deps.media.probe_duration(main_url).await?;

        ctx.report("pre-stitching timelines", 30.0);
        let mut overlays = Vec::with_capacity(layers.len().saturating_sub(1));
        for (i, layer) in layers.iter().enumerate() {
            if i == 0 {
                continue;
            }
            let mut layer = layer.clone();
            if layer.get("isTimeline").and_then(|v| v.as_bool()).unwrap_or(false) {
                if let Some(Value::Array(timeline)) = layer.get_mut("timeline") {
                    autofill_timeline_durations(timeline, main_duration);
                }
            }
            overlays.push(layer);
        }

        ctx.report("compositing", 55.0);
        let req = LayerRequest {
            base: serde_json::json!({
                "url": base_url,
                "width": width,
                "height": height,
            }),
            overlays: serde_json::json!({
                "items": overlays,
                "mainLayerIndex": main_idx,
                "trimToDuration": main_duration,
            }),
        };
        let response = self.deps.media.layer(req).await?;
        let media_url = response
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| CoreError::Provider("layer response missing url".to_string()))?;

        ctx.report("uploading", 85.0);
        let path = job_output_path(ctx.execution_id, &ctx.job_id, "mp4");
        let final_url = self
            .deps
            .storage
            .upload_from_url(
                &path,
                media_url,
                UploadOptions {
                    content_type: Some("video/mp4".to_string()),
                    organization_id: None,
                },
            )
            .await?;

        Ok(HandlerOutcome::Completed(JobResult::completed(vec![MediaOutput {
            kind: MediaType::Video,
            url: final_url,
            mime_type: Some("video/mp4".to_string()),
        }])))
    }
}
