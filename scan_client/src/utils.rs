use std::{fs::File, io::Write, path::Path};

use tracing::info;

pub fn save_json(data: &serde_json::Value, path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = path.as_ref();
    let mut file = File::create(path)?;
    file.write_all(serde_json::to_string_pretty(data)?.as_bytes())?;
    info!(path = %path.display(), "report written");
    Ok(())
}

pub fn save_bytes(content: &[u8], path: impl AsRef<Path>) -> std::io::Result<()> {
    let path = path.as_ref();
    let mut file = File::create(path)?;
    file.write_all(content)?;
    info!(path = %path.display(), bytes = content.len(), "artifact written");
    Ok(())
}
