//! Application bridges: what a worker actually runs.
//!
//! A bridge is bootstrapped once per worker process and then handles one
//! request at a time. Bridges are looked up by name from a fixed registry.

use std::path::{Component, Path, PathBuf};

use axum::body::Bytes;
use axum::http::{HeaderValue, Request, Response, StatusCode, header};
use thiserror::Error;

use super::protocol::Slot;
use crate::error::{PoolError, Result};

/// Names accepted by [`resolve`].
pub const BRIDGES: &[&str] = &["echo", "static"];

/// What a bridge learns about its worker at bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapContext {
    pub slot: Slot,
    pub debug: bool,
}

/// Errors raised by a bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("Request handler failed: {0}")]
    Handler(String),

    /// The application wrote output behind the server's back. The worker can
    /// no longer trust its connection state and must be replaced.
    #[error("Output was flushed outside the response: {0}")]
    OutputFlushed(String),
}

/// An application hosted by a worker.
pub trait Bridge: Send + Sync {
    /// Prepare the application. Runs once, before the worker reports ready.
    fn bootstrap(&mut self, ctx: &BootstrapContext) -> std::result::Result<(), BridgeError>;

    /// Produce the response for one request.
    fn handle(&self, request: Request<Bytes>) -> std::result::Result<Response<Bytes>, BridgeError>;
}

/// Look up a bridge by name.
pub fn resolve(name: &str, static_directory: Option<&Path>) -> Result<Box<dyn Bridge>> {
    match name {
        "echo" => Ok(Box::new(EchoBridge::default())),
        "static" => Ok(Box::new(StaticBridge::new(
            static_directory.unwrap_or_else(|| Path::new(".")),
        ))),
        other => Err(PoolError::UnknownBridge(other.to_string())),
    }
}

/// Whether `name` is a known bridge.
pub fn is_known(name: &str) -> bool {
    BRIDGES.contains(&name)
}

/// Replies with a plain-text summary of the request.
#[derive(Debug, Default)]
pub struct EchoBridge {
    context: Option<BootstrapContext>,
}

impl Bridge for EchoBridge {
    fn bootstrap(&mut self, ctx: &BootstrapContext) -> std::result::Result<(), BridgeError> {
        self.context = Some(ctx.clone());
        Ok(())
    }

    fn handle(&self, request: Request<Bytes>) -> std::result::Result<Response<Bytes>, BridgeError> {
        let ctx = self
            .context
            .as_ref()
            .ok_or_else(|| BridgeError::Handler("bridge was not bootstrapped".to_string()))?;
        let mut body = format!(
            "{} {}\nworker: {}\nheaders: {}\nbody: {} bytes\n",
            request.method(),
            request.uri().path(),
            ctx.slot,
            request.headers().len(),
            request.body().len()
        );
        if ctx.debug {
            for (name, value) in request.headers() {
                body.push_str(&format!("{}: {}\n", name, value.to_str().unwrap_or("<binary>")));
            }
        }
        text_response(StatusCode::OK, body)
    }
}

/// Serves files from a directory.
#[derive(Debug)]
pub struct StaticBridge {
    root: PathBuf,
}

impl StaticBridge {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path onto a file under the root. `None` if the path
    /// tries to leave it.
    fn locate(&self, request_path: &str) -> Option<PathBuf> {
        let decoded = urlencoding::decode(request_path).ok()?;
        let relative = Path::new(decoded.trim_start_matches('/'));

        let mut path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        if path.is_dir() {
            path.push("index.html");
        }
        Some(path)
    }
}

impl Bridge for StaticBridge {
    fn bootstrap(&mut self, _ctx: &BootstrapContext) -> std::result::Result<(), BridgeError> {
        if !self.root.is_dir() {
            return Err(BridgeError::Bootstrap(format!(
                "static directory {} does not exist",
                self.root.display()
            )));
        }
        Ok(())
    }

    fn handle(&self, request: Request<Bytes>) -> std::result::Result<Response<Bytes>, BridgeError> {
        let Some(path) = self.locate(request.uri().path()) else {
            return text_response(StatusCode::NOT_FOUND, "Not Found\n".to_string());
        };
        match std::fs::read(&path) {
            Ok(contents) => {
                let mut response = Response::new(Bytes::from(contents));
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static(content_type(&path)),
                );
                Ok(response)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                text_response(StatusCode::NOT_FOUND, "Not Found\n".to_string())
            }
            Err(e) => Err(BridgeError::Handler(format!(
                "failed to read {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

fn text_response(
    status: StatusCode,
    body: String,
) -> std::result::Result<Response<Bytes>, BridgeError> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Bytes::from(body))
        .map_err(|e| BridgeError::Handler(e.to_string()))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html" | "htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("txt") => "text/plain; charset=utf-8",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> BootstrapContext {
        BootstrapContext {
            slot: 4,
            debug: false,
        }
    }

    fn get(path: &str) -> Request<Bytes> {
        Request::builder().uri(path).body(Bytes::new()).unwrap()
    }

    #[test]
    fn test_resolve_known_and_unknown() {
        assert!(resolve("echo", None).is_ok());
        assert!(resolve("static", Some(Path::new("/tmp"))).is_ok());
        assert!(matches!(
            resolve("laravel", None),
            Err(PoolError::UnknownBridge(name)) if name == "laravel"
        ));
        assert!(is_known("static"));
        assert!(!is_known("Echo"));
    }

    #[test]
    fn test_echo_requires_bootstrap() {
        let bridge = EchoBridge::default();
        assert!(matches!(
            bridge.handle(get("/")),
            Err(BridgeError::Handler(_))
        ));
    }

    #[test]
    fn test_echo_body() {
        let mut bridge = EchoBridge::default();
        bridge.bootstrap(&ctx()).unwrap();
        let request = Request::builder()
            .method("POST")
            .uri("/submit?x=1")
            .header("X-Test", "1")
            .body(Bytes::from_static(b"hello"))
            .unwrap();

        let response = bridge.handle(request).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = std::str::from_utf8(response.body()).unwrap();
        assert!(body.starts_with("POST /submit\n"));
        assert!(body.contains("worker: 4"));
        assert!(body.contains("headers: 1"));
        assert!(body.contains("body: 5 bytes"));
    }

    #[test]
    fn test_static_serves_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>hi</h1>").unwrap();
        std::fs::create_dir(dir.path().join("css")).unwrap();
        std::fs::write(dir.path().join("css/site.css"), "body{}").unwrap();

        let mut bridge = StaticBridge::new(dir.path());
        bridge.bootstrap(&ctx()).unwrap();

        let response = bridge.handle(get("/")).unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.body().as_ref(), b"<h1>hi</h1>");
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/html; charset=utf-8"
        );

        let response = bridge.handle(get("/css/site.css")).unwrap();
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css");
    }

    #[test]
    fn test_static_missing_and_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let bridge = StaticBridge::new(dir.path().join("public"));
        std::fs::create_dir(dir.path().join("public")).unwrap();
        std::fs::write(dir.path().join("secret.txt"), "nope").unwrap();

        let response = bridge.handle(get("/missing.txt")).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = bridge.handle(get("/../secret.txt")).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = bridge.handle(get("/%2e%2e/secret.txt")).unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_static_bootstrap_needs_directory() {
        let mut bridge = StaticBridge::new("/nonexistent/prefork/www");
        assert!(matches!(
            bridge.bootstrap(&ctx()),
            Err(BridgeError::Bootstrap(_))
        ));
    }
}
