//! Protobuf and gRPC types for the quarry services.

// This crate deliberately does not use the same linting rules as the other crates because of all
// the generated code it contains that we don't have much control over.
#![allow(
    unused_imports,
    clippy::redundant_static_lifetimes,
    clippy::redundant_closure
)]

/// Generated types, laid out following the protobuf package hierarchy.
pub mod quarry {
    pub mod catalog {
        pub mod v1 {
            include!(concat!(env!("OUT_DIR"), "/quarry.catalog.v1.rs"));
        }
    }
}

/// Encoded file descriptor set of every compiled protobuf, used to serve gRPC reflection.
pub const FILE_DESCRIPTOR_SET: &[u8] =
    include_bytes!(concat!(env!("OUT_DIR"), "/proto_descriptor.bin"));

/// Fully qualified name of the catalog service, as registered with the gRPC health service.
pub const CATALOG_SERVICE_NAME: &str = "quarry.catalog.v1.CatalogService";
