pub mod server;

pub mod proto {
    pub mod rdrs {
        tonic::include_proto!("rdrs");
    }
}
