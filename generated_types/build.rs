//! Compiles Protocol Buffers into native Rust types.

use std::env;
use std::path::{Path, PathBuf};

type Error = Box<dyn std::error::Error>;
type Result<T, E = Error> = std::result::Result<T, E>;

fn main() -> Result<()> {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("protos");

    generate_grpc_types(&root)?;

    Ok(())
}

/// Schema used with quarry specific gRPC requests
///
/// Creates:
///
/// - `quarry.catalog.v1.rs`
fn generate_grpc_types(root: &Path) -> Result<()> {
    let catalog_path = root.join("quarry/catalog/v1");

    let proto_files = vec![catalog_path.join("service.proto")];

    // Tell cargo to recompile if any of these proto files are changed
    for proto_file in &proto_files {
        println!("cargo:rerun-if-changed={}", proto_file.display());
    }

    let config = prost_build::Config::new();

    let descriptor_path = PathBuf::from(env::var("OUT_DIR")?).join("proto_descriptor.bin");
    tonic_build::configure()
        .file_descriptor_set_path(&descriptor_path)
        // protoc in ubuntu builder needs this option
        .protoc_arg("--experimental_allow_proto3_optional")
        .compile_with_config(config, &proto_files, &[root])?;

    Ok(())
}
