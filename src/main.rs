use std::path::PathBuf;
use std::process::ExitCode;

use log::{error, info};
use vxi11_gateway::config::Config;
use vxi11_gateway::rpc::portmap::{Portmapper, PORTMAP_PORT};
use vxi11_gateway::server::Gateway;

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let Some(path) = std::env::args().nth(1) else {
        error!("usage: vxi11-gateway <config.yaml>");
        return ExitCode::from(2);
    };

    let config = match Config::from_file(PathBuf::from(&path)) {
        Ok(config) => config,
        Err(e) => {
            error!("failed to load configuration from {path}: {e}");
            return ExitCode::from(2);
        }
    };

    let host = config.server.host.clone();
    let port = config.server.port;
    let portmapper_enabled = config.server.portmapper_enabled;

    let gateway = match Gateway::new(config) {
        Ok(gateway) => gateway,
        Err(e) => {
            error!("failed to build gateway from configuration: {e}");
            return ExitCode::from(2);
        }
    };

    let core_addr = match format!("{host}:{port}").parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("invalid server.host/server.port ({host}:{port}): {e}");
            return ExitCode::from(2);
        }
    };

    if portmapper_enabled {
        spawn_portmapper(&host, port);
    }

    info!("vxi11-gateway {} starting on tcp {core_addr}", vxi11_gateway::version());
    match gateway.serve(core_addr).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("VXI-11 listener failed to bind {core_addr}: {e}");
            ExitCode::from(3)
        }
    }
}

/// Runs the portmapper on its own background tasks. A bind or serve failure
/// here is logged and the task simply ends — the façade must remain usable
/// on its configured port even if 111/tcp+udp isn't available, which is
/// typical when not running as root (spec.md §4.2).
fn spawn_portmapper(host: &str, core_port: u16) {
    let tcp_host = host.to_string();
    tokio::spawn(async move {
        let portmapper = Portmapper::new(core_port);
        match format!("{tcp_host}:{PORTMAP_PORT}").parse() {
            Ok(addr) => {
                if let Err(e) = portmapper.serve_tcp(addr).await {
                    error!("portmapper tcp listener on {addr} exited: {e}");
                }
            }
            Err(e) => error!("invalid portmapper tcp address: {e}"),
        }
    });

    let udp_host = host.to_string();
    tokio::spawn(async move {
        let portmapper = Portmapper::new(core_port);
        match format!("{udp_host}:{PORTMAP_PORT}").parse() {
            Ok(addr) => {
                if let Err(e) = portmapper.serve_udp(addr).await {
                    error!("portmapper udp listener on {addr} exited: {e}");
                }
            }
            Err(e) => error!("invalid portmapper udp address: {e}"),
        }
    });
}
