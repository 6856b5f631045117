use crate::image::{ImageReadError, ImageWriteError};
use crate::protocol::ProtocolError;
use crate::update::PlanError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("reading image: {0}")]
    ImageRead(#[from] ImageReadError),
    #[error("writing image: {0}")]
    ImageWrite(#[from] ImageWriteError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Plan(#[from] PlanError),
    #[error("serial port: {0}")]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("invalid hex payload: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("image has no flash area named {0:?}")]
    NoSuchArea(String),
    #[error("image has no JSON section")]
    NoJsonSection,
}
