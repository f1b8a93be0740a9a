use std::process::exit;
use std::sync::Arc;

use log::warn;
use tokio::net::TcpListener;

use parlor::backend::{Backend, SqliteBackend};
use parlor::cluster::{Cluster, ClusterFabric, LocalCluster};
use parlor::config::ServerConfig;
use parlor::security::kms::{Kms, LocalKms};
use parlor::server::Service;
use parlor::snowflake::IdGenerator;
use parlor::Error;

/// Fold a server id string into the snowflake generator's server bits.
fn server_id_bits(id: &str) -> u16 {
    let mut bits = 0u16;
    for byte in id.bytes() {
        bits = bits.wrapping_mul(31).wrapping_add(u16::from(byte));
    }
    bits & 0x3ff
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::load_from_file(&path) {
            Ok(config) => config,
            Err(err) => {
                eprintln!("error: {err}");
                exit(1);
            }
        },
        None => ServerConfig::default(),
    };

    let kms: Arc<dyn Kms> = match config.kms.get() {
        Ok(kms) => Arc::new(kms),
        Err(Error::NoMasterKey) => {
            warn!("no master key configured; generating an ephemeral one");
            Arc::new(LocalKms::generate())
        }
        Err(err) => {
            eprintln!("error: {err}");
            exit(1);
        }
    };

    let server = config.cluster.describe_self();
    let cluster: Arc<dyn Cluster> =
        Arc::new(LocalCluster::attach(ClusterFabric::new(), server.clone()));
    let ids = Arc::new(IdGenerator::new(server_id_bits(&server.id)));

    let backend: Arc<dyn Backend> = match SqliteBackend::open(
        &config.database.path,
        env!("CARGO_PKG_VERSION"),
        ids.clone(),
    ) {
        Ok(backend) => Arc::new(backend),
        Err(err) => {
            eprintln!("error: {err}");
            exit(1);
        }
    };

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(err) => {
            eprintln!("error: {err}");
            exit(1);
        }
    };

    let service = match Service::start(config, kms, cluster, backend, ids, server).await {
        Ok(service) => service,
        Err(err) => {
            eprintln!("error: {err}");
            exit(1);
        }
    };

    if let Err(err) = service.serve(listener).await {
        eprintln!("error: {err}");
        exit(1);
    }
}
