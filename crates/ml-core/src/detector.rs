use std::{convert::TryFrom, path::Path};

use anyhow::Result;
use tch::{self, Device, Kind, Tensor};
use tracing::debug;
use video_ingest::{Frame, FrameFormat};

use crate::{BoundingBox, Detection, Detector};

/// TorchScript-backed detector wrapper.
pub struct TorchDetector {
    module: tch::CModule,
    device: Device,
    input_size: (i64, i64),
    confidence_threshold: f32,
}

impl TorchDetector {
    /// Load a TorchScript module onto the best available device.
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: (i64, i64)) -> Result<Self> {
        let device = Device::cuda_if_available();
        let module = tch::CModule::load_on_device(model_path, device)?;
        debug!("detector loaded on {device:?}");
        Ok(Self {
            module,
            device,
            input_size,
            confidence_threshold: 0.25,
        })
    }

    /// Override the confidence threshold used for filtering detections.
    pub fn with_confidence_threshold(mut self, confidence: f32) -> Self {
        self.confidence_threshold = confidence;
        self
    }

    /// Converts a BGR frame into a normalized RGB NCHW tensor.
    fn frame_to_tensor(&self, frame: &Frame) -> Result<Tensor> {
        let FrameFormat::Bgr8 = frame.format;
        let expected = (frame.width as usize) * (frame.height as usize) * 3;
        if frame.data.len() != expected {
            anyhow::bail!(
                "unexpected frame buffer size: got {} bytes, expected {}",
                frame.data.len(),
                expected
            );
        }

        let (in_w, in_h) = self.input_size;
        if (frame.width as i64, frame.height as i64) != (in_w, in_h) {
            anyhow::bail!(
                "frame size {}x{} does not match detector input {in_w}x{in_h}",
                frame.width,
                frame.height
            );
        }

        let tensor = Tensor::from_slice(&frame.data)
            .to_device(self.device)
            .to_kind(Kind::Float)
            .view([1, in_h, in_w, 3])
            .flip([3])
            .permute([0, 3, 1, 2])
            / 255.0;

        Ok(tensor)
    }
}

impl Detector for TorchDetector {
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let input = self.frame_to_tensor(frame)?;
        let output = self.module.forward_ts(&[input])?;
        let shape = output.size();
        if shape.len() != 3 {
            anyhow::bail!("unexpected detector output shape: {shape:?}");
        }
        if shape[0] != 1 {
            anyhow::bail!("detector expected batch=1 but received {}", shape[0]);
        }
        if shape[1] < 5 {
            anyhow::bail!(
                "detector output requires at least 5 channels (x,y,w,h,conf), got {}",
                shape[1]
            );
        }

        let preds = output
            .to_device(Device::Cpu)
            .squeeze_dim(0)
            .permute([1, 0])
            .contiguous();
        let rows: Vec<Vec<f32>> = Vec::<Vec<f32>>::try_from(&preds)?;

        let mut detections = Vec::new();
        for row in rows {
            if row.len() < 5 {
                continue;
            }
            let confidence = row[4];
            if confidence < self.confidence_threshold {
                continue;
            }
            let class_id = if row.len() > 5 { row[5] as i64 } else { 0 };
            detections.push(Detection {
                bbox: BoundingBox::from_center_xywh([row[0], row[1], row[2], row[3]]),
                class_id,
                confidence,
                track_id: None,
            });
            if detections.len() >= 512 {
                break;
            }
        }

        Ok(detections)
    }
}
