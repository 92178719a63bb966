//! Outbound HTTP: plain HTTP/1.0 GETs with a short timeout, no keep-alive.
//! Special-station commands are queued onto a dispatcher task so the control
//! loop never blocks on the network; every failure is logged and swallowed.

use std::fmt;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Per-request timeout covering connect, send and receive.
const HTTP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub host: String,
    pub port: u16,
    /// Request target including the leading slash and any query string.
    pub path: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpError {
    ConnectErr,
    Timeout,
    EmptyReturn,
    NotReceived,
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectErr => write!(f, "connect error"),
            Self::Timeout => write!(f, "timeout"),
            Self::EmptyReturn => write!(f, "empty response"),
            Self::NotReceived => write!(f, "response not received"),
        }
    }
}

/// Issue a single GET and return the raw response (headers included).
pub async fn get(req: &HttpRequest) -> Result<String, HttpError> {
    let run = async {
        let mut stream = TcpStream::connect((req.host.as_str(), req.port))
            .await
            .map_err(|_| HttpError::ConnectErr)?;

        let request = format!(
            "GET {} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
            req.path, req.host
        );
        stream
            .write_all(request.as_bytes())
            .await
            .map_err(|_| HttpError::NotReceived)?;

        let mut body = Vec::new();
        stream
            .read_to_end(&mut body)
            .await
            .map_err(|_| HttpError::NotReceived)?;
        if body.is_empty() {
            return Err(HttpError::EmptyReturn);
        }
        Ok(String::from_utf8_lossy(&body).into_owned())
    };

    match tokio::time::timeout(HTTP_TIMEOUT, run).await {
        Ok(result) => result,
        Err(_) => Err(HttpError::Timeout),
    }
}

pub type HttpSender = mpsc::UnboundedSender<HttpRequest>;

/// Spawn the fire-and-forget dispatcher. Requests are served one at a time;
/// transport failures never reach station state.
pub fn spawn_dispatcher() -> HttpSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<HttpRequest>();
    tokio::spawn(async move {
        while let Some(req) = rx.recv().await {
            match get(&req).await {
                Ok(_) => debug!(host = %req.host, port = req.port, "http command sent"),
                Err(e) => {
                    warn!(host = %req.host, port = req.port, error = %e, "http command failed")
                }
            }
        }
    });
    tx
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn one_shot_server(response: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            if let Ok((mut sock, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                use tokio::io::AsyncReadExt;
                let _ = sock.read(&mut buf).await;
                let _ = sock.write_all(response).await;
            }
        });
        port
    }

    #[tokio::test]
    async fn get_receives_response() {
        let port = one_shot_server(b"HTTP/1.0 200 OK\r\n\r\nok").await;
        let resp = get(&HttpRequest {
            host: "127.0.0.1".into(),
            port,
            path: "/cm?pw=x".into(),
        })
        .await
        .unwrap();
        assert!(resp.starts_with("HTTP/1.0 200"));
        assert!(resp.ends_with("ok"));
    }

    #[tokio::test]
    async fn get_empty_response_is_error() {
        let port = one_shot_server(b"").await;
        let err = get(&HttpRequest {
            host: "127.0.0.1".into(),
            port,
            path: "/".into(),
        })
        .await
        .unwrap_err();
        assert_eq!(err, HttpError::EmptyReturn);
    }

    #[tokio::test]
    async fn get_connect_error_on_closed_port() {
        // bind-then-drop yields a port with nothing listening
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = get(&HttpRequest {
            host: "127.0.0.1".into(),
            port,
            path: "/".into(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, HttpError::ConnectErr | HttpError::Timeout));
    }

    #[tokio::test]
    async fn dispatcher_swallows_failures() {
        let tx = spawn_dispatcher();
        tx.send(HttpRequest {
            host: "127.0.0.1".into(),
            port: 9, // discard port, nothing listens
            path: "/".into(),
        })
        .unwrap();
        // nothing to assert beyond "does not panic"; give the task a moment
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
