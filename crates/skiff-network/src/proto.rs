//! Generated protobuf and gRPC bindings for package `skiff.v1`.

#![allow(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]

tonic::include_proto!("skiff.v1");
