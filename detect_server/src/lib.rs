//! Webcam object detection served over HTTP.
//!
//! A [`frame_source::FrameSource`] keeps the latest camera frame in a single-slot buffer, the
//! handlers in [`endpoints`] pull from it, run an [`nn::InferModel`] and reply with annotated
//! JPEGs, either as snapshots or as a multipart MJPEG stream.
pub mod annotate;
pub mod config;
pub mod context;
pub mod dashboard;
pub mod encoder;
pub mod endpoints;
pub mod error;
pub mod frame_source;
pub mod meter;
pub mod nn;
pub mod router;
pub mod sensors;
pub mod utils;
