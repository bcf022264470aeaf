use crate::cli::app_config::Cli;
use crate::http::resolver::CoalescingResolver;
use crate::http::traced_io::{HookSlot, TracedIo};
use crate::trace::phase::{NoopHooks, PhaseHooks};
use crate::trace::summary::PhaseSummary;
use crate::trace::tracer::{RequestTrace, Tracer};
use anyhow::Context;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, HOST, USER_AGENT};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use rustls::crypto::ring::{default_provider, DEFAULT_CIPHER_SUITES};
use rustls::{ClientConfig, RootCertStore};
use std::io::Write as WriteStd;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;

struct PooledConnection {
    key: String,
    sender: http1::SendRequest<Full<Bytes>>,
    slot: Arc<HookSlot>,
}

/// HTTP/1 client that drives the phase hooks of each request it sends.
///
/// Keeps at most one keep-alive connection; sending to the same
/// scheme://host:port again reuses it and reports the reuse through the
/// hook set instead of re-running DNS, connect and TLS.
pub struct HttpClient {
    resolver: CoalescingResolver,
    pooled: Option<PooledConnection>,
}

impl HttpClient {
    pub fn new() -> Self {
        Self {
            resolver: CoalescingResolver::new(),
            pooled: None,
        }
    }

    pub async fn request(
        &mut self,
        cli: &Cli,
        tracer: &Tracer,
    ) -> Result<PhaseSummary, anyhow::Error> {
        let uri: Uri = cli.url.parse().context("Failed to parse URL")?;
        let scheme = uri.scheme_str().unwrap_or("http").to_string();
        let host = uri
            .host()
            .ok_or_else(|| anyhow!("uri has no host: {}", uri))?
            .to_string();
        let port = uri
            .port_u16()
            .unwrap_or(if scheme == "https" { 443 } else { 80 });

        let request = tracer.decorate(build_request(cli, &uri)?);
        let trace = request.extensions().get::<RequestTrace>().cloned();
        let hooks: Arc<dyn PhaseHooks> = match &trace {
            Some(t) => t.hooks(),
            None => Arc::new(NoopHooks),
        };

        let fut = self.send_request(cli, request, &scheme, &host, port, hooks);
        let res = timeout(Duration::from_secs(30), fut)
            .await
            .context("Request timed out after 30 seconds")?
            .context("Failed to execute request")?;

        if cli.verbosity >= 1 {
            debug!("< {:?} {}", res.version(), res.status());
            for (key, value) in res.headers().iter() {
                debug!("< {}: {}", key, value.to_str()?);
            }
            debug!("<");
        }

        handle_response(cli, res).await?;

        Ok(trace.map(|t| t.tracer().summary()).unwrap_or_default())
    }

    async fn send_request(
        &mut self,
        cli: &Cli,
        request: Request<Full<Bytes>>,
        scheme: &str,
        host: &str,
        port: u16,
        hooks: Arc<dyn PhaseHooks>,
    ) -> Result<Response<Incoming>, anyhow::Error> {
        hooks.on_connection_acquire_start();
        let key = format!("{}://{}:{}", scheme, host, port);

        let mut reused = None;
        if let Some(mut pooled) = self.pooled.take() {
            if pooled.key == key
                && !pooled.sender.is_closed()
                && pooled.sender.ready().await.is_ok()
            {
                reused = Some(pooled);
            } else {
                debug!("Dropping stale connection to {}", pooled.key);
            }
        }

        let (pooled, was_reused) = match reused {
            Some(pooled) => (pooled, true),
            None => (
                self.open_connection(cli, key, scheme, host, port, hooks.as_ref())
                    .await?,
                false,
            ),
        };
        // Point the connection's milestone reporting at this request
        // before any of its bytes hit the wire.
        pooled.slot.arm(hooks.clone());
        hooks.on_connection_acquired(was_reused, was_reused);

        self.pooled = Some(pooled);
        let sender = match self.pooled.as_mut() {
            Some(pooled) => &mut pooled.sender,
            None => return Err(anyhow!("connection vanished before send")),
        };
        let res = sender.send_request(request).await?;
        Ok(res)
    }

    async fn open_connection(
        &self,
        cli: &Cli,
        key: String,
        scheme: &str,
        host: &str,
        port: u16,
        hooks: &dyn PhaseHooks,
    ) -> Result<PooledConnection, anyhow::Error> {
        let addrs = self.resolver.resolve(host, port, hooks).await?;

        hooks.on_connect_start();
        let stream = match TcpStream::connect(addrs.as_slice()).await {
            Ok(stream) => {
                hooks.on_connect_done(None);
                stream
            }
            Err(e) => {
                let message = e.to_string();
                hooks.on_connect_done(Some(&message));
                return Err(anyhow::Error::from(e)
                    .context(format!("Failed to connect to {}:{}", host, port)));
            }
        };

        let slot = HookSlot::new();
        let sender = if scheme == "https" {
            let tls_config = build_tls_config(cli)?;
            let connector = TlsConnector::from(Arc::new(tls_config));
            let domain = pki_types::ServerName::try_from(host)
                .map_err(|e| anyhow!("{}", e))?
                .to_owned();
            hooks.on_tls_handshake_start();
            let tls_stream = connector.connect(domain, stream).await?;
            hooks.on_tls_handshake_done();
            drive_http1(TracedIo::new(tls_stream, slot.clone())).await?
        } else {
            drive_http1(TracedIo::new(stream, slot.clone())).await?
        };

        Ok(PooledConnection { key, sender, slot })
    }
}

async fn drive_http1<S>(io: TracedIo<S>) -> Result<http1::SendRequest<Full<Bytes>>, anyhow::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, conn) = http1::handshake(TokioIo::new(io)).await?;
    tokio::task::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Connection failed: {:?}", err);
        }
    });
    Ok(sender)
}

fn build_request(cli: &Cli, uri: &Uri) -> Result<Request<Full<Bytes>>, anyhow::Error> {
    let mut method = String::from("GET");
    let mut content_type_option = None;
    if cli.body_option.is_some() {
        method = String::from("POST");
        content_type_option = Some(String::from("application/x-www-form-urlencoded"));
    }
    if let Some(method_userdefined) = cli.method_option.as_ref() {
        method = method_userdefined.clone();
    }

    let mut request_builder = Request::builder().method(method.as_str()).uri(uri.clone());

    let mut header_map = http::HeaderMap::new();
    if let Some(content_type) = content_type_option {
        header_map.insert(CONTENT_TYPE, HeaderValue::from_str(&content_type)?);
    }
    header_map.insert(ACCEPT, HeaderValue::from_str("*/*")?);
    header_map.insert(
        HOST,
        HeaderValue::from_str(uri.host().ok_or_else(|| anyhow!("no host"))?)?,
    );
    let user_agent = cli
        .user_agent_option
        .as_deref()
        .unwrap_or(concat!("rpulse/", env!("CARGO_PKG_VERSION")));
    header_map.insert(USER_AGENT, HeaderValue::from_str(user_agent)?);

    for x in &cli.headers {
        let split: Vec<&str> = x.splitn(2, ':').collect();
        ensure!(split.len() == 2, "header error: '{}'", x);
        header_map.insert(
            HeaderName::from_str(split[0])?,
            HeaderValue::from_str(split[1].trim_start())?,
        );
    }

    for (key, val) in header_map {
        request_builder = request_builder.header(key.ok_or_else(|| anyhow!("Key is null"))?, val);
    }

    let body_bytes = cli
        .body_option
        .as_ref()
        .map_or_else(Bytes::new, |body| Bytes::from(body.clone()));
    let request = request_builder.body(Full::new(body_bytes))?;

    if cli.verbosity >= 1 {
        debug!(
            "> {} {} {:?}",
            request.method(),
            request.uri().path(),
            request.version()
        );
        for (key, value) in request.headers().iter() {
            debug!("> {}: {}", key, value.to_str()?);
        }
        debug!(">");
    }

    Ok(request)
}

fn build_tls_config(cli: &Cli) -> Result<ClientConfig, anyhow::Error> {
    let mut root_store = RootCertStore::empty();
    if let Some(file_path) = cli.certificate_path_option.as_ref() {
        let f = std::fs::File::open(file_path)
            .context(format!("Failed to open certificate file: {}", file_path))?;
        let mut rd = std::io::BufReader::new(f);
        for cert in rustls_pemfile::certs(&mut rd) {
            root_store.add(cert?)?;
        }
    } else {
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    let provider = Arc::new(rustls::crypto::CryptoProvider {
        cipher_suites: DEFAULT_CIPHER_SUITES.to_vec(),
        ..default_provider()
    });
    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(rustls::DEFAULT_VERSIONS)?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(tls_config)
}

async fn handle_response(cli: &Cli, res: Response<Incoming>) -> Result<(), anyhow::Error> {
    let (_parts, incoming) = res.into_parts();
    let body_bytes = incoming.collect().await?.to_bytes();

    if let Some(file_path) = cli.file_path_option.as_ref() {
        std::fs::write(file_path, &body_bytes)
            .context(format!("Failed to write response body to {}", file_path))?;
        info!("Saved {} bytes to {}", body_bytes.len(), file_path);
        return Ok(());
    }

    match String::from_utf8(body_bytes.to_vec()) {
        Ok(text) => print!("{text}"),
        Err(_) => {
            error!(
                "[rpulse: warning] response body is not valid UTF-8 and was not written to a file."
            );
            error!("[rpulse: warning] to save to a file, use `-o <filename>`");
        }
    }
    std::io::stdout().flush()?;
    Ok(())
}
