use std::convert::Infallible;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::upgrade::OnUpgrade;
use hyper::{Body, Request, Response, Server, StatusCode};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::config::ProxyConfig;
use crate::error::TunnelError;
use crate::gatekeeper::{DialTarget, Gatekeeper, TunnelRequest};
use crate::relay;

/// Binds the listener and serves CONNECT tunnels until `shutdown` resolves.
///
/// Returns the bound address (useful when listening on port 0) and the
/// handle of the server task. Once `shutdown` resolves no new connections are
/// accepted, but the handle only completes after every established tunnel
/// has closed.
pub fn spawn_proxy<S>(
    config: ProxyConfig,
    shutdown: S,
) -> std::io::Result<(SocketAddr, JoinHandle<()>)>
where
    S: Future<Output = ()> + Send + 'static,
{
    let listen_addr = config.listen_addr();
    let gatekeeper = Gatekeeper::new(Arc::new(config));
    let tunnels = TaskTracker::new();

    let svc_tunnels = tunnels.clone();
    let make_svc = make_service_fn(move |conn: &AddrStream| {
        let gatekeeper = gatekeeper.clone();
        let tunnels = svc_tunnels.clone();
        let remote_addr = conn.remote_addr();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                handle_request(req, remote_addr, gatekeeper.clone(), tunnels.clone())
            }))
        }
    });

    let std_listener = TcpListener::bind(listen_addr)?;
    std_listener.set_nonblocking(true)?;
    let local_addr = std_listener.local_addr()?;
    let builder =
        Server::from_tcp(std_listener).map_err(|err| IoError::new(ErrorKind::Other, err))?;
    let server = builder
        .http1_only(true)
        .tcp_nodelay(true)
        .serve(make_svc);
    let graceful = server.with_graceful_shutdown(async move {
        shutdown.await;
    });

    let handle = tokio::spawn(async move {
        if let Err(err) = graceful.await {
            error!(error = %err, "CONNECT proxy server exited with error");
        }
        tunnels.close();
        if !tunnels.is_empty() {
            info!(open = tunnels.len(), "waiting for open tunnels to close");
        }
        tunnels.wait().await;
    });

    Ok((local_addr, handle))
}

async fn handle_request(
    req: Request<Body>,
    remote_addr: SocketAddr,
    gatekeeper: Gatekeeper,
    tunnels: TaskTracker,
) -> Result<Response<Body>, Infallible> {
    match open_tunnel(req, remote_addr, &gatekeeper, &tunnels).await {
        Ok(resp) => Ok(resp),
        Err(err) => {
            warn!(
                %remote_addr,
                configured = gatekeeper.config().target(),
                status = err.status().as_u16(),
                error = %err,
                "tunnel request failed"
            );
            Ok(err.into_response())
        }
    }
}

async fn open_tunnel(
    mut req: Request<Body>,
    remote_addr: SocketAddr,
    gatekeeper: &Gatekeeper,
    tunnels: &TaskTracker,
) -> Result<Response<Body>, TunnelError> {
    let request = TunnelRequest::from_request(&req);
    let target = gatekeeper.authorize(&request)?;
    let upstream = gatekeeper.dial(&target).await?;

    // Dropping `upstream` on this error path closes the half-open dial.
    let on_upgrade = take_client_stream(&mut req)?;

    info!(%remote_addr, requested = request.authority(), %target, "tunnel established");
    tunnels.spawn(run_tunnel(on_upgrade, upstream, remote_addr, target));

    let mut resp = Response::new(Body::empty());
    *resp.status_mut() = StatusCode::OK;
    Ok(resp)
}

/// Takes the capability to own the client connection once the response has
/// been written. Connections that cannot be upgraded don't carry one.
fn take_client_stream<B>(req: &mut Request<B>) -> Result<OnUpgrade, TunnelError> {
    req.extensions_mut()
        .remove::<OnUpgrade>()
        .ok_or(TunnelError::HijackUnsupported)
}

async fn run_tunnel(
    on_upgrade: OnUpgrade,
    upstream: TcpStream,
    remote_addr: SocketAddr,
    target: DialTarget,
) {
    let client = match on_upgrade.await {
        Ok(client) => client,
        Err(err) => {
            warn!(%remote_addr, %target, error = %err, "failed to take over client connection, closing upstream");
            return;
        }
    };

    debug!(%remote_addr, %target, "relaying tunnel");
    let stats = relay::pipe(upstream, client).await;
    info!(
        %remote_addr,
        %target,
        upstream_to_client = stats.a_to_b,
        client_to_upstream = stats.b_to_a,
        "tunnel closed"
    );
}
