//! Host based reverse proxy and webhook endpoint (`epm serve`)
//!
//! Every registered config file becomes a [`Site`]. Sites sharing a listen
//! port are served by one listener; a request is routed by its Host header to
//! the first site declaring that domain. Requests for unknown hosts may still
//! be deploy hooks; anything else gets an empty 200.

use crate::config::{load_all, AppSpec, ConfigFile};
use crate::error::{json_error_response, ProxyErrorCode};
use crate::paths::EpmHome;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::registry::Registry;
use crate::webhook::{self, hook_target, Deployer};
use http_body_util::{combinators::BoxBody, BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Hostname to app port mapping, fixed for the router's lifetime
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteTable {
    routes: HashMap<String, u16>,
}

impl RouteTable {
    /// Build the table for one config file. A domain declared twice goes to
    /// the app declared last.
    pub fn from_config(config: &ConfigFile) -> Self {
        let mut table = RouteTable::default();
        for app in &config.apps {
            let Some(port) = app.port else { continue };
            for domain in &app.domains {
                if let Some(previous) = table.routes.insert(domain.to_lowercase(), port) {
                    if previous != port {
                        warn!(
                            config = %config.path.display(),
                            domain = %domain,
                            previous,
                            port,
                            "Domain declared more than once, last declaration wins"
                        );
                    }
                }
            }
        }
        table
    }

    pub fn lookup(&self, hostname: &str) -> Option<u16> {
        self.routes.get(hostname).copied()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u16)> for RouteTable {
    fn from_iter<I: IntoIterator<Item = (S, u16)>>(iter: I) -> Self {
        Self {
            routes: iter
                .into_iter()
                .map(|(host, port)| (host.into().to_lowercase(), port))
                .collect(),
        }
    }
}

/// A config file together with its route table
#[derive(Debug, Clone)]
pub struct Site {
    pub config: ConfigFile,
    pub routes: RouteTable,
}

impl Site {
    pub fn new(config: ConfigFile) -> Self {
        let routes = RouteTable::from_config(&config);
        Self { config, routes }
    }
}

/// Group sites by the port they listen on, keeping registry order within a
/// port. `port_override` (the `PORT` variable) moves every site to one port.
pub fn group_by_port(sites: Vec<Site>, port_override: Option<u16>) -> BTreeMap<u16, Vec<Site>> {
    let mut groups: BTreeMap<u16, Vec<Site>> = BTreeMap::new();
    for site in sites {
        let port = port_override.unwrap_or(site.config.port);
        groups.entry(port).or_default().push(site);
    }
    groups
}

/// Request dispatch for the sites sharing one listener
pub struct Router {
    sites: Vec<Site>,
    pool: ConnectionPool,
    deployer: Arc<Deployer>,
}

impl Router {
    pub fn new(sites: Vec<Site>, deployer: Arc<Deployer>) -> Self {
        Self {
            sites,
            pool: ConnectionPool::new(PoolConfig::default()),
            deployer,
        }
    }

    /// App port for a hostname, first site wins
    pub fn route(&self, hostname: &str) -> Option<u16> {
        self.sites.iter().find_map(|site| site.routes.lookup(hostname))
    }

    /// Config and app a hook path addresses
    pub fn hook_app(&self, path: &str) -> Option<(&ConfigFile, &AppSpec)> {
        let name = hook_target(path)?;
        self.sites
            .iter()
            .find_map(|site| site.config.find_app(name).map(|app| (&site.config, app)))
    }

    async fn handle(
        self: Arc<Self>,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
        let hostname = extract_hostname(&req);

        if let Some(port) = hostname.as_deref().and_then(|h| self.route(h)) {
            debug!(host = ?hostname, port, path = %req.uri().path(), "Forwarding request");
            return Ok(match self.pool.forward(req, port).await {
                Ok(response) => response,
                Err(e) => {
                    warn!(host = ?hostname, port, error = %e, "Failed to reach app");
                    json_error_response(
                        ProxyErrorCode::ConnectionFailed,
                        format!("Failed to connect to app on port {}", port),
                    )
                }
            });
        }

        let path = req.uri().path().to_string();
        if let Some((config, app)) = self.hook_app(&path) {
            match webhook::authenticate(req, config.webhook_token()).await {
                Ok(()) => {
                    info!(app = %app.name, branch = %app.branch, "Webhook accepted, deploying");
                    self.deployer.spawn_deploy(app);
                }
                Err(rejection) => {
                    warn!(app = %app.name, %rejection, "Webhook rejected");
                }
            }
        } else {
            debug!(host = ?hostname, %path, "No route for request");
        }

        Ok(empty_response())
    }
}

fn empty_response() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::new(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
}

/// Lowercased Host header (or URI authority for HTTP/2) without the port.
/// Returns `None` for missing or malformed hosts.
fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let (hostname, allowed): (&str, fn(char) -> bool) = if raw.starts_with('[') {
        // IPv6 literal, kept with its brackets
        let end = raw.find(']')?;
        (&raw[..=end], |c| c.is_ascii_hexdigit() || matches!(c, ':' | '.' | '[' | ']'))
    } else {
        let hostname = raw.split(':').next()?;
        (hostname, |c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
    };

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }
    if !hostname.chars().all(allowed) {
        return None;
    }

    Some(hostname.to_lowercase())
}

/// One listening socket serving a [`Router`]
pub struct RouterServer {
    listener: TcpListener,
    router: Arc<Router>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RouterServer {
    pub async fn bind(
        addr: SocketAddr,
        router: Arc<Router>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            router,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            addr = %self.local_addr()?,
            sites = self.router.sites.len(),
            "Router listening (HTTP/1.1 and HTTP/2)"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let router = Arc::clone(&self.router);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, router).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.router.pool.stats();
                        info!(
                            forwarded = stats.forwarded(),
                            failed = stats.failed(),
                            "Router shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, router: Arc<Router>) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        router.handle(req)
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Serve every registered config until `shutdown` resolves.
pub async fn run_router<F>(
    home: &EpmHome,
    port_override: Option<u16>,
    deployer: Arc<Deployer>,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()>,
{
    let registry = Registry::new(home.registry_path());
    let paths = registry.load()?;
    let configs = load_all(&paths).await?;

    let sites: Vec<Site> = configs.into_iter().map(Site::new).collect();
    let groups = group_by_port(sites, port_override);

    if groups.is_empty() {
        warn!(registry = %registry.path().display(), "No config files registered, nothing to serve");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    for (port, sites) in groups {
        for site in &sites {
            info!(
                port,
                config = %site.config.path.display(),
                apps = site.config.apps.len(),
                routes = site.routes.len(),
                "Serving config"
            );
        }
        let router = Arc::new(Router::new(sites, Arc::clone(&deployer)));
        let server =
            RouterServer::bind(SocketAddr::from(([0, 0, 0, 0], port)), router, shutdown_rx.clone())
                .await?;
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run().await {
                error!(port, error = %e, "Router error");
            }
        }));
    }

    shutdown.await;
    let _ = shutdown_tx.send(true);
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}
