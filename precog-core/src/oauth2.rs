//! Drives the interactive OAuth2 authorization-code leg: a local callback
//! listener, CSRF `state` validation, and a synthetic response that feeds the
//! rest of the graph the same way any other request's response would.
//!
//! The browser-launch side effect is gated behind [`BrowserOpener`] so tests
//! can inject a no-op instead of actually spawning a browser.

use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

use crate::context::EvalContext;
use crate::expr;

const CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_PORT: u16 = 3000;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("interpolating authorize url: {0}")]
    Expr(#[from] expr::Error),
    #[error("parsing authorize url: {0}")]
    Url(#[from] url::ParseError),
    #[error("binding local callback listener: {0}")]
    Bind(std::io::Error),
    #[error("callback not received within the timeout")]
    Timeout,
    #[error("callback connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("authorization server returned error: {0}")]
    AuthorizationDenied(String),
    #[error("callback request did not include an authorization code")]
    MissingCode,
    #[error("callback state did not match the expected value (possible CSRF)")]
    StateMismatch,
}

pub struct AuthorizeOutcome {
    pub code: String,
    pub state: String,
}

pub trait BrowserOpener {
    fn open(&self, url: &str) -> Result<(), Error>;
}

pub struct SystemBrowser;

impl BrowserOpener for SystemBrowser {
    fn open(&self, url: &str) -> Result<(), Error> {
        webbrowser::open(url).map_err(Error::Io)
    }
}

pub struct NoopBrowser;

impl BrowserOpener for NoopBrowser {
    fn open(&self, _url: &str) -> Result<(), Error> {
        Ok(())
    }
}

pub struct Coordinator<O: BrowserOpener = SystemBrowser> {
    pub port: u16,
    pub redirect_uri_override: Option<String>,
    pub opener: O,
}

impl Coordinator<SystemBrowser> {
    pub fn new(port: u16, redirect_uri_override: Option<String>) -> Self {
        Coordinator { port, redirect_uri_override, opener: SystemBrowser }
    }
}

impl<O: BrowserOpener> Coordinator<O> {
    pub fn redirect_uri(&self) -> String {
        self.redirect_uri_override
            .clone()
            .unwrap_or_else(|| format!("http://localhost:{}/callback", self.effective_port()))
    }

    fn effective_port(&self) -> u16 {
        if self.port == 0 { DEFAULT_PORT } else { self.port }
    }

    pub async fn authorize(&self, authorize_url_template: &str, ctx: &EvalContext) -> Result<AuthorizeOutcome, Error> {
        let expected_state = ctx
            .system
            .precog_state
            .clone()
            .unwrap_or_else(generate_state);

        let interpolated = expr::interpolate(authorize_url_template, ctx)?;
        let mut url = url::Url::parse(&interpolated)?;

        {
            let mut pairs = url.query_pairs();
            let has_redirect = pairs.any(|(k, _)| k == "redirect_uri");
            drop(pairs);
            if !has_redirect {
                url.query_pairs_mut().append_pair("redirect_uri", &self.redirect_uri());
            }
        }
        {
            let mut pairs = url.query_pairs();
            let has_state = pairs.any(|(k, _)| k == "state");
            drop(pairs);
            if !has_state {
                url.query_pairs_mut().append_pair("state", &expected_state);
            }
        }

        let listener = TcpListener::bind(("127.0.0.1", self.effective_port()))
            .await
            .map_err(Error::Bind)?;

        log::info!("open this URL to continue: {url}");
        println!("{url}");
        if let Err(e) = self.opener.open(url.as_str()) {
            log::warn!("failed to open browser automatically: {e}");
        }

        let outcome = timeout(CALLBACK_TIMEOUT, await_callback(&listener, &expected_state)).await;
        drop(listener);

        match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }
}

pub(crate) fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

async fn await_callback(listener: &TcpListener, expected_state: &str) -> Result<AuthorizeOutcome, Error> {
    let (mut stream, _) = listener.accept().await?;
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request_text = String::from_utf8_lossy(&buf[..n]);
    let request_line = request_text.lines().next().unwrap_or("");
    let path_and_query = request_line.split_whitespace().nth(1).unwrap_or("/callback");

    let params = parse_query(path_and_query);
    let code = params.get("code").cloned();
    let state = params.get("state").cloned().unwrap_or_default();
    let error = params.get("error").cloned();
    let error_description = params.get("error_description").cloned();

    if let Some(err) = error {
        let message = error_description.unwrap_or(err);
        write_response(&mut stream, 400, &error_page(&message)).await?;
        return Err(Error::AuthorizationDenied(message));
    }
    let Some(code) = code else {
        write_response(&mut stream, 400, &error_page("missing authorization code")).await?;
        return Err(Error::MissingCode);
    };
    if state != expected_state {
        write_response(&mut stream, 400, &error_page("possible CSRF")).await?;
        return Err(Error::StateMismatch);
    }

    write_response(&mut stream, 200, SUCCESS_PAGE).await?;
    Ok(AuthorizeOutcome { code, state })
}

async fn write_response(stream: &mut tokio::net::TcpStream, status: u16, body: &str) -> std::io::Result<()> {
    let status_line = match status {
        200 => "200 OK",
        _ => "400 Bad Request",
    };
    let response = format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn parse_query(path_and_query: &str) -> std::collections::BTreeMap<String, String> {
    let query = path_and_query.splitn(2, '?').nth(1).unwrap_or("");
    url::form_urlencoded::parse(query.as_bytes())
        .into_owned()
        .collect()
}

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html><html><head><title>Authorized</title>
<script>setTimeout(function(){ window.close(); }, 2000);</script>
</head><body><p>Authorization complete. You may close this window.</p></body></html>"#;

fn error_page(message: &str) -> String {
    format!("<!DOCTYPE html><html><head><title>Authorization failed</title></head><body><p>{message}</p></body></html>")
}
