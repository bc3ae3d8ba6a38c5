use std::path::PathBuf;

fn main() {
    let proto_path = "proto/mpi.proto";
    println!("cargo:rerun-if-changed={proto_path}");
    println!("cargo:rerun-if-changed=proto");

    let protoc_path =
        protoc_bin_vendored::protoc_bin_path().expect("failed to locate vendored protoc binary");
    std::env::set_var("PROTOC", protoc_path);

    let mut includes = vec![PathBuf::from("proto")];
    if let Ok(well_known) = protoc_bin_vendored::include_path() {
        includes.push(well_known);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&[proto_path], &includes)
        .expect("failed to compile management plane proto");
}
