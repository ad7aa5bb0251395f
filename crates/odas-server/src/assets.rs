use std::path::{Component, Path, PathBuf};

/// A static file ready to serve.
#[derive(Debug)]
pub struct Asset {
    pub bytes: Vec<u8>,
    pub content_type: &'static str,
}

/// Content type by extension. Unknown extensions are served as plain text.
pub fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html",
        Some("js") => "text/javascript",
        Some("css") => "text/css",
        _ => "text/plain",
    }
}

/// Map a request path onto a file under `root`.
///
/// `/` means `/index.html`. Paths that try to leave `root` resolve to `None`.
pub fn resolve_path(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = match request_path {
        "" | "/" => "index.html",
        other => other.trim_start_matches('/'),
    };

    let mut resolved = root.to_path_buf();
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

/// Read the file behind `request_path`, or `None` for "not found".
pub async fn load(root: &Path, request_path: &str) -> Option<Asset> {
    let path = resolve_path(root, request_path)?;
    match tokio::fs::read(&path).await {
        Ok(bytes) => Some(Asset {
            bytes,
            content_type: content_type_for(&path),
        }),
        Err(e) => {
            tracing::debug!(path = %path.display(), error = %e, "Asset not found");
            None
        }
    }
}
