use std::path::PathBuf;

use serde::Deserialize;


/// The root directory of the workspace.
pub fn workspace_root() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .expect("workspace root")
        .to_path_buf()
}

/// The payload printed by `retrace diff` and served by `retrace serve`.
#[derive(Debug, Deserialize)]
pub struct Payload {
    pub image1: Image,
    pub image2: Image,
}

#[derive(Debug, Deserialize)]
pub struct Image {
    pub name: String,
    pub dockerfile: String,
    pub approximate: bool,
}
