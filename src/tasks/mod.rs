//! Task modules shipped with the broker

pub mod decode;
pub mod pixel;

pub use decode::{decode_registry, DecodeConfig, DecodeTask};
pub use pixel::{ImageFrame, PixelData, PixelError, TransferSyntax};
