//! HTTP helpers for the relay's REST endpoints

use reqwest::StatusCode;

use crate::error::NetworkError;

/// Fetch the ids of connected users from `GET {base}/users`
pub async fn fetch_users(client: &reqwest::Client, url: &str) -> Result<Vec<String>, NetworkError> {
    let response = client.get(url).send().await?;
    let status = response.status();

    if status != StatusCode::OK {
        return Err(NetworkError::Server(status.as_u16()));
    }

    Ok(response.json::<Vec<String>>().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve exactly one canned HTTP response
    async fn serve_once(status_line: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status_line,
                body.len(),
                body
            );
            let _ = socket.write_all(response.as_bytes()).await;
        });

        format!("http://{}/users", addr)
    }

    #[tokio::test]
    async fn test_fetch_users_ok() {
        let url = serve_once("200 OK", r#"["alice","bob"]"#).await;
        let users = fetch_users(&reqwest::Client::new(), &url).await.unwrap();
        assert_eq!(users, vec!["alice".to_string(), "bob".to_string()]);
    }

    #[tokio::test]
    async fn test_fetch_users_server_error() {
        let url = serve_once("503 Service Unavailable", "").await;
        let err = fetch_users(&reqwest::Client::new(), &url).await.unwrap_err();
        assert!(matches!(err, NetworkError::Server(503)));
    }
}
