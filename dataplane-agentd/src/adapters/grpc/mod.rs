pub mod connector;
pub mod convert;
pub mod tls;
pub mod transfer;

pub mod proto {
    tonic::include_proto!("dataplane.mpi.v1");
}

pub use connector::{CommandConnector, EventsConnector, ManagementEndpoint, MetricsConnector};
pub use tls::{load_client_tls, ClientTlsMaterial, ClientTlsPaths};
pub use transfer::GrpcTransfer;
