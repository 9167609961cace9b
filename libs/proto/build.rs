use std::io::{Error, Result};
use std::path::PathBuf;

fn main() -> Result<()> {
    let proto_root = PathBuf::from("../../api/proto");

    let protos = ["edgelink/tunnel/v1/tunnel.proto"];

    let proto_paths: Vec<PathBuf> = protos.iter().map(|p| proto_root.join(p)).collect();

    // Builds without a system protoc fall back to the vendored binary.
    if std::env::var_os("PROTOC").is_none() {
        let protoc = protoc_bin_vendored::protoc_bin_path().map_err(Error::other)?;
        std::env::set_var("PROTOC", protoc);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_protos(&proto_paths, &[&proto_root])?;

    for proto in &protos {
        println!(
            "cargo:rerun-if-changed={}",
            proto_root.join(proto).display()
        );
    }

    Ok(())
}
